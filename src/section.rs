//! The top-level per-group scheduler (spec §4.4): a state machine over
//! `Experiment`, `Compiling`, `Bakeoff`, `MakeDecision`, `Waiting`, driving
//! the tuner, compilation manager, and bakeoff together.

use std::collections::HashMap;

use crate::bakeoff::{Bakeoff, BakeoffCommand, BakeoffOutcome};
use crate::code_version::{CodeVersion, ORIGINAL_LIBRARY_NAME};
use crate::strategy::{SectionCommand, TuningEnv, TuningSection};

const DEFAULT_MAX_DUPES_IN_ROW: u32 = 10;

#[derive(Debug)]
enum State {
    Experiment,
    Compiling,
    Bakeoff(Box<Bakeoff>),
    MakeDecision,
    Waiting,
}

pub struct AdaptiveTuningSection {
    state: State,
    best_lib: String,
    tuning_root: Option<String>,
    duplicate_compiles_in_row: u32,
    max_dupes_in_row: u32,
}

impl Default for AdaptiveTuningSection {
    fn default() -> Self {
        AdaptiveTuningSection {
            state: State::Experiment,
            best_lib: ORIGINAL_LIBRARY_NAME.to_string(),
            tuning_root: None,
            duplicate_compiles_in_row: 0,
            max_dupes_in_row: DEFAULT_MAX_DUPES_IN_ROW,
        }
    }
}

impl AdaptiveTuningSection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_dupes_in_row(max_dupes_in_row: u32) -> Self {
        AdaptiveTuningSection {
            max_dupes_in_row,
            ..Self::default()
        }
    }

    fn non_bakeoff_prelude(&self) -> Vec<SectionCommand> {
        vec![
            self.send_lib(&self.best_lib),
            self.redirect_to(&self.best_lib),
            SectionCommand::DisableSampling,
        ]
    }

    fn bakeoff_commands(cmds: Vec<BakeoffCommand>, other_name: &str, deployed_name: &str) -> Vec<SectionCommand> {
        cmds.into_iter()
            .map(|c| match c {
                BakeoffCommand::Deploy => SectionCommand::Deploy(deployed_name.to_string()),
                BakeoffCommand::EnableSampling => SectionCommand::EnableSampling,
                BakeoffCommand::DisableSampling => SectionCommand::DisableSampling,
                BakeoffCommand::SetSamplingPeriod(p) => SectionCommand::SetSamplingPeriod(p),
            })
            .chain(std::iter::once(SectionCommand::RedirectAll(other_name.to_string())))
            .collect()
    }

    fn step_bakeoff(&mut self, env: &mut TuningEnv, mut bakeoff: Box<Bakeoff>) -> Vec<SectionCommand> {
        let deployed_name = bakeoff.deployed_name.clone();
        let other_name = bakeoff.other_name.clone();

        let new_ipc = self
            .tuning_root
            .as_deref()
            .and_then(|root| env.profiler.current_perf(root, &deployed_name))
            .map(|(_, last)| last);

        // SAFETY-by-construction: deployed_name/other_name always name
        // entries this section itself inserted into `env.versions`.
        let (deployed_cv, other_cv) = get_two_mut(env.versions, &deployed_name, &other_name);

        let (outcome, cmds) = bakeoff.take_step(deployed_cv, other_cv, new_ipc);
        let mut commands = Self::bakeoff_commands(cmds, &other_name, &deployed_name);

        match outcome {
            BakeoffOutcome::InProgress | BakeoffOutcome::PayingDebt => {
                self.state = State::Bakeoff(bakeoff);
            }
            BakeoffOutcome::NewIsBetter { winner } | BakeoffOutcome::CurrentIsBetter { winner } => {
                self.best_lib = winner;
                self.state = State::MakeDecision;
            }
            BakeoffOutcome::Timeout { survivor, should_merge } => {
                self.best_lib = survivor.clone();
                if should_merge {
                    let loser_name = if survivor == deployed_name { other_name.clone() } else { deployed_name.clone() };
                    if let Some(mut loser) = env.versions.remove(&loser_name) {
                        if let Some(winner) = env.versions.get_mut(&survivor) {
                            winner.merge_from(&mut loser);
                        }
                    }
                }
                self.state = State::MakeDecision;
                commands.push(SectionCommand::Deploy(self.best_lib.clone()));
                commands.push(SectionCommand::RedirectAll(self.best_lib.clone()));
            }
        }

        commands
    }

    fn try_start_bakeoff(&mut self, env: &mut TuningEnv, challenger: String) {
        let (best_cv, challenger_cv) = get_two_mut(env.versions, &self.best_lib, &challenger);
        let (bakeoff, cmds) = Bakeoff::new(best_cv, challenger_cv, self.best_lib.clone(), challenger, env.bakeoff_params);
        let _ = cmds; // initial Deploy is re-issued every tick by step_bakeoff anyway.
        self.state = State::Bakeoff(Box::new(bakeoff));
    }
}

/// Fetches two distinct, guaranteed-present entries mutably at once. Panics
/// if either key is missing or the keys are equal — both are programming
/// errors at this call site, never a reachable runtime condition.
fn get_two_mut<'a>(
    map: &'a mut HashMap<String, CodeVersion>,
    a: &str,
    b: &str,
) -> (&'a mut CodeVersion, &'a mut CodeVersion) {
    assert_ne!(a, b, "bakeoff participants must be distinct library names");
    let ptr = map as *mut HashMap<String, CodeVersion>;
    // Two disjoint keys into the same map: safe because `a != b`, so the
    // two `&mut` borrows never alias.
    unsafe {
        let a_ref = (*ptr).get_mut(a).expect("bakeoff participant missing from version map");
        let b_ref = (*ptr).get_mut(b).expect("bakeoff participant missing from version map");
        (a_ref, b_ref)
    }
}

impl TuningSection for AdaptiveTuningSection {
    fn tick(&mut self, env: &mut TuningEnv) -> Vec<SectionCommand> {
        env.versions
            .entry(self.best_lib.clone())
            .or_insert_with(|| CodeVersion::original(env.base_knobs.clone()));

        match std::mem::replace(&mut self.state, State::Experiment) {
            State::Bakeoff(bakeoff) => self.step_bakeoff(env, bakeoff),

            State::Waiting => {
                self.state = State::Waiting;
                self.non_bakeoff_prelude()
            }

            State::MakeDecision => {
                let versions: Vec<CodeVersion> = env.versions.values().cloned().collect();
                if env.stopper.should_stop(&versions) {
                    self.state = State::Waiting;
                } else {
                    self.state = State::Experiment;
                }
                self.non_bakeoff_prelude()
            }

            State::Compiling => {
                let mut commands = self.non_bakeoff_prelude();
                if env.compiler_mgr.jobs_in_flight() == 0 {
                    self.state = State::Experiment;
                    return commands;
                }
                let Some(job) = env.compiler_mgr.dequeue_compilation() else {
                    self.state = State::Compiling;
                    return commands;
                };

                let object = match job.result {
                    Ok(o) => o,
                    Err(_) => {
                        // broken compile: treat like a duplicate-in-a-row, no version created.
                        self.duplicate_compiles_in_row += 1;
                        self.state = if self.duplicate_compiles_in_row < self.max_dupes_in_row
                            || env.versions.len() < 2
                        {
                            State::Experiment
                        } else {
                            State::MakeDecision
                        };
                        return commands;
                    }
                };

                let mut candidate = CodeVersion::new(job.library_name.clone(), object, job.knobs);
                let merge_target = env
                    .versions
                    .values_mut()
                    .find(|v| v.mergeable_with(&candidate));

                if let Some(existing) = merge_target {
                    existing.merge_from(&mut candidate);
                    self.duplicate_compiles_in_row += 1;
                    let existing_name = existing.library_name.clone();

                    if self.duplicate_compiles_in_row < self.max_dupes_in_row || env.versions.len() < 2 {
                        self.state = State::Experiment;
                    } else {
                        let challenger = env
                            .versions
                            .keys()
                            .find(|k| **k != self.best_lib)
                            .cloned()
                            .unwrap_or(existing_name);
                        self.try_start_bakeoff(env, challenger);
                    }
                } else {
                    self.duplicate_compiles_in_row = 0;
                    let name = candidate.library_name.clone();
                    env.versions.insert(name.clone(), candidate);
                    self.try_start_bakeoff(env, name);
                }

                commands
            }

            State::Experiment => {
                if self.tuning_root.is_none() {
                    if let Some(hottest) = env.profiler.hottest_node() {
                        self.tuning_root = env.profiler.find_suitable_tuning_root(hottest);
                    }
                }

                // Drain the tuner's predetermined top-queue into the compile
                // FIFO in one visit (batch prefetch) instead of enqueuing a
                // single job and waiting a full round-trip per candidate.
                let versions: Vec<CodeVersion> = env.versions.values().cloned().collect();
                loop {
                    let config = env.tuner.get_config(env.config_mgr, &versions, env.base_knobs, env.rng);
                    env.compiler_mgr.enqueue_compilation(env.bitcode.to_vec(), config);
                    if !env.tuner.next_is_predetermined(env.config_mgr) {
                        break;
                    }
                }

                self.state = State::Compiling;
                self.non_bakeoff_prelude()
            }
        }
    }

    fn best_lib(&self) -> &str {
        &self.best_lib
    }

    fn tuning_root(&self) -> Option<&str> {
        self.tuning_root.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bakeoff::BakeoffParams;
    use crate::compilation_manager::CompilationManager;
    use crate::config_manager::ConfigManager;
    use crate::knob::{Knob, KnobSet, OptLevel};
    use crate::profiler::Profiler;
    use crate::stopper::StatisticalStopper;
    use crate::tuner::PseudoBayesTuner;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn base_knobs() -> KnobSet {
        let mut ks = KnobSet::new(0);
        ks.insert("opt-level", Knob::OptLvl(Some(OptLevel::O0)));
        ks
    }

    struct Harness {
        compiler_mgr: CompilationManager,
        config_mgr: ConfigManager,
        versions: HashMap<String, CodeVersion>,
        bitcode: Vec<u8>,
        base: KnobSet,
        profiler: Profiler,
        tuner: PseudoBayesTuner,
        stopper: StatisticalStopper,
        rng: StdRng,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                compiler_mgr: CompilationManager::new(),
                config_mgr: ConfigManager::new(),
                versions: HashMap::new(),
                bitcode: vec![1, 2, 3],
                base: base_knobs(),
                profiler: Profiler::new(),
                tuner: PseudoBayesTuner::default(),
                stopper: StatisticalStopper::default(),
                rng: StdRng::seed_from_u64(9),
            }
        }

        fn env(&mut self) -> TuningEnv<'_> {
            TuningEnv {
                compiler_mgr: &mut self.compiler_mgr,
                config_mgr: &mut self.config_mgr,
                versions: &mut self.versions,
                bitcode: &self.bitcode,
                base_knobs: &self.base,
                profiler: &mut self.profiler,
                tuner: &self.tuner,
                stopper: &self.stopper,
                rng: &mut self.rng,
                bakeoff_params: BakeoffParams { min_samples: 2, ..BakeoffParams::default() },
                max_dupes_in_row: 10,
            }
        }
    }

    #[tokio::test]
    async fn experiment_moves_to_compiling_and_eventually_starts_a_bakeoff() {
        let mut h = Harness::new();
        let mut section = AdaptiveTuningSection::new();

        section.tick(&mut h.env()); // Experiment -> Compiling (enqueues a job)
        assert!(matches!(section.state, State::Compiling));

        for _ in 0..200 {
            section.tick(&mut h.env());
            tokio::task::yield_now().await;
            if matches!(section.state, State::Bakeoff(_)) {
                break;
            }
        }
        assert!(
            matches!(section.state, State::Bakeoff(_)),
            "expected a bakeoff to start after the first unique compile"
        );
        // the seeded original version plus the first freshly compiled one.
        assert_eq!(h.versions.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_compiles_in_a_row_eventually_forces_a_bakeoff_instead_of_retrying() {
        let mut h = Harness::new();
        h.versions.insert(ORIGINAL_LIBRARY_NAME.to_string(), CodeVersion::original(h.base.clone()));

        let mut dup_config = h.base.clone();
        dup_config.insert("ipra", Knob::Flag(Some(true)));
        let object = crate::compiler::compile(&h.bitcode, &dup_config).unwrap();
        let existing_name = "halo_lib_00000001".to_string();
        h.versions.insert(existing_name.clone(), CodeVersion::new(existing_name.clone(), object, dup_config.clone()));

        let mut section = AdaptiveTuningSection::with_max_dupes_in_row(2);

        // First duplicate: one already-compiled version shares this config's
        // object bytes, so the compile folds into it instead of seeding a new
        // one. Below the cap, the section just goes back to experimenting.
        section.state = State::Compiling;
        h.compiler_mgr.enqueue_compilation(h.bitcode.clone(), dup_config.clone());
        loop {
            section.tick(&mut h.env());
            tokio::task::yield_now().await;
            if section.duplicate_compiles_in_row == 1 {
                break;
            }
        }
        assert!(matches!(section.state, State::Experiment));
        assert_eq!(h.versions.len(), 2, "a duplicate compile must not grow the version map");

        // Second duplicate in a row hits the cap (max_dupes_in_row == 2):
        // instead of going back to Experiment, the section starts a bakeoff
        // against whatever other version it has on hand.
        section.state = State::Compiling;
        h.compiler_mgr.enqueue_compilation(h.bitcode.clone(), dup_config.clone());
        loop {
            section.tick(&mut h.env());
            tokio::task::yield_now().await;
            if section.duplicate_compiles_in_row == 2 {
                break;
            }
        }
        assert!(
            matches!(section.state, State::Bakeoff(_)),
            "hitting max_dupes_in_row should start a bakeoff instead of compiling yet again"
        );
    }

    #[tokio::test]
    async fn make_decision_routes_to_waiting_once_stopper_says_stop() {
        let mut h = Harness::new();
        // Seed many duplicate configs sharing one version so pUnique is tiny.
        let mut v = CodeVersion::new("only", vec![9, 9, 9], base_knobs());
        for _ in 1..500 {
            v.configs.push(base_knobs());
        }
        h.versions.insert("only".to_string(), v);

        let mut section = AdaptiveTuningSection::new();
        section.state = State::MakeDecision;
        section.tick(&mut h.env());
        assert!(matches!(section.state, State::Waiting));
    }
}
