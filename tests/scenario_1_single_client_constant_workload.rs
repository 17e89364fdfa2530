//! End-to-end scenario: a single client reporting a steady stream of
//! samples inside one hot, patchable function should be enough for the
//! group to find a tuning root and start adaptively recompiling it.

use std::collections::HashMap;

use halo_server::bakeoff::BakeoffParams;
use halo_server::code_region::{CodeRegionInfo, FunctionDefinition};
use halo_server::code_version::CodeVersion;
use halo_server::compilation_manager::CompilationManager;
use halo_server::config_manager::ConfigManager;
use halo_server::knob::{Knob, KnobSet, OptLevel};
use halo_server::profiler::{ClientSampleBatch, PerfSample, Profiler};
use halo_server::section::AdaptiveTuningSection;
use halo_server::stopper::StatisticalStopper;
use halo_server::strategy::{TuningEnv, TuningSection};
use halo_server::tuner::PseudoBayesTuner;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn region_with_hot() -> CodeRegionInfo {
    let mut cri = CodeRegionInfo::new();
    cri.add_function(FunctionDefinition { name: "main".into(), start: 0x1000, end: 0x1100, patchable: false });
    cri.add_function(FunctionDefinition { name: "hot".into(), start: 0x2000, end: 0x2100, patchable: true });
    cri
}

fn base_knobs() -> KnobSet {
    let mut ks = KnobSet::new(0);
    ks.insert("opt-level", Knob::OptLvl(Some(OptLevel::O0)));
    ks
}

#[tokio::test]
async fn single_client_constant_workload_finds_hot_and_enters_a_bakeoff() {
    let mut profiler = Profiler::new();
    let cri = region_with_hot();

    let samples: Vec<PerfSample> = (0..200)
        .map(|i| PerfSample { instr_ptr: 0x2050, time: 67_867_967 * (i + 1), thread_id: 1, call_context: vec![0x1050] })
        .collect();
    profiler.consume_perf_data(vec![ClientSampleBatch { client_id: 1, code_region: &cri, samples }], "__halo_original__");

    assert!(profiler.samples_consumed >= 100);
    let hottest = profiler.hottest_node().expect("a hottest node must exist after 200 samples");
    assert_eq!(profiler.find_suitable_tuning_root(hottest), Some("hot".to_string()));

    let mut compiler_mgr = CompilationManager::new();
    let mut config_mgr = ConfigManager::new();
    let mut versions: HashMap<String, CodeVersion> = HashMap::new();
    let base = base_knobs();
    let bitcode = vec![1, 2, 3];
    let tuner = PseudoBayesTuner::default();
    let stopper = StatisticalStopper::default();
    let mut rng = StdRng::seed_from_u64(11);
    let mut section = AdaptiveTuningSection::new();

    let mut env = TuningEnv {
        compiler_mgr: &mut compiler_mgr,
        config_mgr: &mut config_mgr,
        versions: &mut versions,
        bitcode: &bitcode,
        base_knobs: &base,
        profiler: &mut profiler,
        tuner: &tuner,
        stopper: &stopper,
        rng: &mut rng,
        bakeoff_params: BakeoffParams { min_samples: 2, ..BakeoffParams::default() },
        max_dupes_in_row: 10,
    };

    section.tick(&mut env); // Experiment -> Compiling, enqueues the first candidate
    assert_eq!(section.tuning_root(), Some("hot"));

    for _ in 0..200 {
        section.tick(&mut env);
        tokio::task::yield_now().await;
        if env.versions.len() == 2 {
            break;
        }
    }
    // the seeded original version plus the first freshly compiled challenger:
    // this is exactly the pair a bakeoff needs to start against.
    assert_eq!(env.versions.len(), 2, "expected the first unique compile to seed a bakeoff challenger");
}
