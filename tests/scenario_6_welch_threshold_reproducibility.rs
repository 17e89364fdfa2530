//! A small, fixed sample pair whose combined degrees of freedom round to 6
//! (so the lookup table's 1.943 critical value applies at alpha=0.05), with
//! a verdict direction that should be exactly reproducible: no RNG, no
//! timing, same numbers in, same verdict out every run.

use halo_server::bakeoff::{welch_test, WelchVerdict};
use halo_server::code_version::CodeVersion;
use halo_server::knob::{Knob, KnobSet, OptLevel};

fn config(level: OptLevel) -> KnobSet {
    let mut ks = KnobSet::new(0);
    ks.insert("opt-level", Knob::OptLvl(Some(level)));
    ks
}

#[test]
fn equal_variance_equal_n_sample_pair_resolves_to_deployed_less() {
    let mut a = CodeVersion::new("a", vec![1], config(OptLevel::O0));
    for v in [1.00, 1.00, 1.01, 0.99] {
        a.quality.observe(v);
    }
    let mut b = CodeVersion::new("b", vec![2], config(OptLevel::O3));
    for v in [2.00, 2.01, 1.99, 2.00] {
        b.quality.observe(v);
    }

    // Both samples have identical variance and size, so Welch-Satterthwaite
    // collapses to the equal-variance case: df = 2*(n-1) = 6.
    assert_eq!(welch_test(&a, &b, 0.05), WelchVerdict::DeployedLess);

    // Same inputs, a stricter alpha: a bigger critical value shouldn't flip
    // a result this far from the threshold.
    assert_eq!(welch_test(&a, &b, 0.01), WelchVerdict::DeployedLess);
}
