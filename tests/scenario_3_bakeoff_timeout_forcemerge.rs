//! End-to-end scenario: two versions with statistically indistinguishable
//! performance (every observed IPC sample identical) should never resolve
//! a winner, time out after `max_switches`, and — under `--halo-forcemerge`
//! — get merged into one version.

use std::collections::HashMap;

use halo_server::bakeoff::{Bakeoff, BakeoffOutcome, BakeoffParams};
use halo_server::code_version::CodeVersion;
use halo_server::knob::{Knob, KnobSet, OptLevel};

fn config(level: OptLevel) -> KnobSet {
    let mut ks = KnobSet::new(0);
    ks.insert("opt-level", Knob::OptLvl(Some(level)));
    ks
}

/// Same disjoint-mutable-borrow trick `section.rs` uses to pull both
/// bakeoff participants out of one map at once, driven by name rather than
/// by a fixed argument order — the real calling convention, since
/// `Bakeoff` swaps `deployed_name`/`other_name` internally on every
/// inconclusive switch.
fn get_two_mut<'a>(map: &'a mut HashMap<String, CodeVersion>, a: &str, b: &str) -> (&'a mut CodeVersion, &'a mut CodeVersion) {
    assert_ne!(a, b);
    let ptr = map as *mut HashMap<String, CodeVersion>;
    unsafe { ((*ptr).get_mut(a).unwrap(), (*ptr).get_mut(b).unwrap()) }
}

#[test]
fn identical_performers_time_out_and_merge_under_forcemerge() {
    const ORIGINAL: &str = "__halo_original__";
    const CHALLENGER: &str = "halo_lib_00000001";
    const CONSTANT_IPC: f64 = 1.5;

    let mut versions = HashMap::new();
    versions.insert(ORIGINAL.to_string(), CodeVersion::new(ORIGINAL, vec![], config(OptLevel::O0)));
    versions.insert(CHALLENGER.to_string(), CodeVersion::new(CHALLENGER, vec![9, 9, 9], config(OptLevel::O2)));

    let params = BakeoffParams { switch_rate: 1, max_switches: 6, min_samples: 2, confidence: 0.95, force_merge: true, ..BakeoffParams::default() };
    let (mut bakeoff, _) = {
        let (deployed, other) = get_two_mut(&mut versions, ORIGINAL, CHALLENGER);
        Bakeoff::new(deployed, other, ORIGINAL, CHALLENGER, params)
    };

    // Both sides report the exact same IPC on every sample: variance on
    // both streams is always zero, so the Welch denominator is always zero
    // and every step is deterministically a "no answer" — no reliance on
    // any particular RNG draw to stay statistically indistinguishable.
    {
        let other = versions.get_mut(CHALLENGER).unwrap();
        other.quality.observe(CONSTANT_IPC);
        other.quality.observe(CONSTANT_IPC);
    }

    let outcome = loop {
        let (deployed, other) = get_two_mut(&mut versions, &bakeoff.deployed_name, &bakeoff.other_name);
        let (outcome, _) = bakeoff.take_step(deployed, other, Some(CONSTANT_IPC));
        match outcome {
            BakeoffOutcome::InProgress | BakeoffOutcome::PayingDebt => continue,
            decided => break decided,
        }
    };

    let (survivor, should_merge) = match outcome {
        BakeoffOutcome::Timeout { survivor, should_merge } => (survivor, should_merge),
        other => panic!("expected Timeout after indistinguishable performance, got {other:?}"),
    };
    assert!(should_merge, "--halo-forcemerge should request a merge on timeout");
    assert_eq!(survivor, ORIGINAL, "timeout prefers the originally-deployed version");
    assert_eq!(versions.len(), 2);

    // Mirror the section's own timeout handling: drop the loser, fold it
    // into the survivor, and confirm the version map shrinks by one.
    let loser_name = versions.keys().find(|k| **k != survivor).cloned().unwrap();
    let mut loser = versions.remove(&loser_name).unwrap();
    versions.get_mut(&survivor).unwrap().merge_from(&mut loser);

    assert_eq!(versions.len(), 1, "timeout with should_merge must shrink the version map by one");
}
