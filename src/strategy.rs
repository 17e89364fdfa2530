//! The `TuningSection` trait (original: `include/halo/tuner/TuningSection.h`)
//! abstracts over the scheduling strategy a `ClientGroup` runs. Two
//! implementations exist: [`crate::section::AdaptiveTuningSection`] (the
//! full bakeoff-driven state machine, spec §4.4) and [`CompileOnceSection`]
//! below, selected by `--halo-strategy=jit` — grounded in the original's
//! `CompileOnceTuningSection.h`: compile once with the expert-opinion
//! config, deploy it, and never bake off against anything else.

use rand::rngs::StdRng;

use crate::bakeoff::BakeoffParams;
use crate::code_version::CodeVersion;
use crate::compilation_manager::CompilationManager;
use crate::config_manager::ConfigManager;
use crate::knob::KnobSet;
use crate::profiler::Profiler;
use crate::stopper::StatisticalStopper;
use crate::tuner::PseudoBayesTuner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionCommand {
    Deploy(String),
    RedirectAll(String),
    DisableSampling,
    EnableSampling,
    SetSamplingPeriod(u64),
}

/// Mutable handles a tuning section needs for one tick. Borrowed from the
/// owning `ClientGroup`'s state for the duration of the call. Not every
/// strategy uses every field (`CompileOnceSection` ignores the profiler and
/// tuner), but one shared shape keeps `Box<dyn TuningSection>` usable.
pub struct TuningEnv<'a> {
    pub compiler_mgr: &'a mut CompilationManager,
    pub config_mgr: &'a mut ConfigManager,
    pub versions: &'a mut std::collections::HashMap<String, CodeVersion>,
    pub bitcode: &'a [u8],
    pub base_knobs: &'a KnobSet,
    pub profiler: &'a mut Profiler,
    pub tuner: &'a PseudoBayesTuner,
    pub stopper: &'a StatisticalStopper,
    pub rng: &'a mut StdRng,
    pub bakeoff_params: BakeoffParams,
    pub max_dupes_in_row: u32,
}

pub trait TuningSection {
    /// One scheduling tick; returns the commands the group must execute
    /// (deploy / redirect / sampling toggles) against its connected clients.
    fn tick(&mut self, env: &mut TuningEnv) -> Vec<SectionCommand>;

    fn best_lib(&self) -> &str;

    /// The function a `RedirectAll` command should be applied to, if the
    /// strategy has settled on one. `CompileOnceSection` never picks a
    /// tuning root (it redirects nothing, it just deploys), so the default
    /// is `None`.
    fn tuning_root(&self) -> Option<&str> {
        None
    }

    /// Promoted from the original's protected `sendLib`/`redirectTo` helpers
    /// — every strategy deploys and redirects the same way.
    fn send_lib(&self, name: &str) -> SectionCommand {
        SectionCommand::Deploy(name.to_string())
    }

    fn redirect_to(&self, name: &str) -> SectionCommand {
        SectionCommand::RedirectAll(name.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Compiling,
    Deployed,
}

pub struct CompileOnceSection {
    phase: Phase,
    best_lib: String,
    expert_cursor: usize,
    pending_library: Option<String>,
}

impl Default for CompileOnceSection {
    fn default() -> Self {
        CompileOnceSection {
            phase: Phase::NotStarted,
            best_lib: crate::code_version::ORIGINAL_LIBRARY_NAME.to_string(),
            expert_cursor: 0,
            pending_library: None,
        }
    }
}

impl CompileOnceSection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TuningSection for CompileOnceSection {
    fn tick(&mut self, env: &mut TuningEnv) -> Vec<SectionCommand> {
        match self.phase {
            Phase::NotStarted => {
                let config = crate::config_manager::ConfigManager::gen_expert_opinion(
                    env.base_knobs,
                    &mut self.expert_cursor,
                )
                .unwrap_or_else(|| env.base_knobs.clone());
                let name = env.compiler_mgr.enqueue_compilation(env.bitcode.to_vec(), config);
                self.pending_library = Some(name);
                self.phase = Phase::Compiling;
                vec![self.send_lib(&self.best_lib), self.redirect_to(&self.best_lib)]
            }
            Phase::Compiling => {
                if let Some(job) = env.compiler_mgr.dequeue_compilation() {
                    if let Ok(object) = job.result {
                        let version = CodeVersion::new(job.library_name.clone(), object, job.knobs);
                        self.best_lib = version.library_name.clone();
                        env.versions.insert(version.library_name.clone(), version);
                        self.phase = Phase::Deployed;
                        return vec![self.send_lib(&self.best_lib), self.redirect_to(&self.best_lib)];
                    }
                    // broken compile: stay on whatever is currently deployed.
                    self.phase = Phase::Deployed;
                }
                vec![self.send_lib(&self.best_lib), self.redirect_to(&self.best_lib)]
            }
            Phase::Deployed => {
                vec![self.send_lib(&self.best_lib), self.redirect_to(&self.best_lib)]
            }
        }
    }

    fn best_lib(&self) -> &str {
        &self.best_lib
    }
}
