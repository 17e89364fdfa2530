//! Convergence heuristic deciding when to stop exploring (spec §4.7).
//!
//! The original source also carries an alpha/epsilon confidence-interval
//! stopper (`include/halo/tuner/StatisticalStopper.h`); `spec.md` explicitly
//! selects the simpler `pUnique` heuristic below instead, so that design is
//! not implemented here (documented as superseded in `DESIGN.md`).

use crate::code_version::CodeVersion;
use crate::knob::KnobSet;

pub const DEFAULT_THRESHOLD: f64 = 0.01;

pub struct StatisticalStopper {
    pub threshold: f64,
}

impl Default for StatisticalStopper {
    fn default() -> Self {
        StatisticalStopper { threshold: DEFAULT_THRESHOLD }
    }
}

impl StatisticalStopper {
    pub fn new(threshold: f64) -> Self {
        StatisticalStopper { threshold }
    }

    /// `pUnique = unique versions / total compiled configs (incl. duplicate
    /// compiles)`. Stops exploring once the compiler is producing
    /// essentially no new object code. An empty version set never stops.
    pub fn should_stop(&self, versions: &[CodeVersion]) -> bool {
        let compiled: usize = versions.iter().map(|v| v.configs.len()).sum();
        if compiled == 0 {
            return false;
        }
        let unique = versions.len();
        let p_unique = unique as f64 / compiled as f64;
        p_unique < self.threshold
    }
}

/// Full configuration-space size `N = prod(knob.cardinality())`, reported
/// for diagnostics only — never used in the stop test (spec §4.7).
pub fn space_size(knobs: &KnobSet) -> u128 {
    knobs.cardinality()
}
