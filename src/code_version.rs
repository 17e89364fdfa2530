//! A compiled artifact tied to one or more equivalent configurations (spec
//! §3): an object file, the content hashes of its object-file bytes, the
//! configs known to produce it, a running quality observation stream, and a
//! `broken` flag set when compilation or deployment has failed.

use std::collections::HashSet;

use sha1::{Digest, Sha1};

use crate::knob::KnobSet;
use crate::random_quantity::RandomQuantity;

pub type ObjectHash = [u8; 20];

pub fn hash_object(object: &[u8]) -> ObjectHash {
    let mut hasher = Sha1::new();
    hasher.update(object);
    hasher.finalize().into()
}

/// Sentinel name for the version representing the client's own code at
/// startup, before any recompilation has happened.
pub const ORIGINAL_LIBRARY_NAME: &str = "__halo_original__";

#[derive(Debug, Clone)]
pub struct CodeVersion {
    pub library_name: String,
    pub object: Option<Vec<u8>>,
    pub hashes: HashSet<ObjectHash>,
    pub configs: Vec<KnobSet>,
    pub quality: RandomQuantity,
    pub broken: bool,
}

impl CodeVersion {
    pub fn new(library_name: impl Into<String>, object: Vec<u8>, config: KnobSet) -> Self {
        let hash = hash_object(&object);
        CodeVersion {
            library_name: library_name.into(),
            object: Some(object),
            hashes: HashSet::from([hash]),
            configs: vec![config],
            quality: RandomQuantity::with_default_capacity(),
            broken: false,
        }
    }

    /// The version representing the client's own code at enrollment: empty
    /// object file, sentinel name, seeded from the `build_settings` the
    /// client reported on enroll.
    pub fn original(config: KnobSet) -> Self {
        CodeVersion {
            library_name: ORIGINAL_LIBRARY_NAME.to_string(),
            object: None,
            hashes: HashSet::new(),
            configs: vec![config],
            quality: RandomQuantity::with_default_capacity(),
            broken: false,
        }
    }

    /// Two versions are mergeable iff their object-file hash sets
    /// intersect. The original-library version (empty hash set) is
    /// mergeable with nothing.
    pub fn mergeable_with(&self, other: &CodeVersion) -> bool {
        !self.hashes.is_empty() && self.hashes.intersection(&other.hashes).next().is_some()
    }

    /// Absorbs `donor` into `self`: unions configs, hash sets, and quality
    /// observations, and clears the donor so it can be dropped by the
    /// caller. `self` keeps its own library name and object file.
    pub fn merge_from(&mut self, donor: &mut CodeVersion) {
        self.configs.append(&mut donor.configs);
        for h in donor.hashes.drain() {
            self.hashes.insert(h);
        }
        for v in donor.quality.values().to_vec() {
            self.quality.observe(v);
        }
        donor.configs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knob::{Knob, KnobSet, OptLevel};

    fn config(level: OptLevel) -> KnobSet {
        let mut ks = KnobSet::new(0);
        ks.insert("opt-level", Knob::OptLvl(Some(level)));
        ks
    }

    #[test]
    fn identical_object_bytes_are_mergeable() {
        let a = CodeVersion::new("lib_a", vec![1, 2, 3], config(OptLevel::O2));
        let b = CodeVersion::new("lib_b", vec![1, 2, 3], config(OptLevel::O3));
        assert!(a.mergeable_with(&b));
    }

    #[test]
    fn different_object_bytes_are_not_mergeable() {
        let a = CodeVersion::new("lib_a", vec![1, 2, 3], config(OptLevel::O2));
        let b = CodeVersion::new("lib_b", vec![4, 5, 6], config(OptLevel::O3));
        assert!(!a.mergeable_with(&b));
    }

    #[test]
    fn original_library_is_never_mergeable() {
        let orig = CodeVersion::original(config(OptLevel::O0));
        let other = CodeVersion::new("lib_a", vec![1, 2, 3], config(OptLevel::O2));
        assert!(!orig.mergeable_with(&other));
        assert!(!other.mergeable_with(&orig));
    }

    #[test]
    fn merge_unions_configs_hashes_and_quality_and_clears_donor() {
        let mut a = CodeVersion::new("lib_a", vec![1, 2, 3], config(OptLevel::O2));
        a.quality.observe(1.5);
        let mut b = CodeVersion::new("lib_b", vec![1, 2, 3], config(OptLevel::O3));
        b.quality.observe(2.5);

        a.merge_from(&mut b);

        assert_eq!(a.configs.len(), 2);
        assert!(a.hashes.contains(&hash_object(&[1, 2, 3])));
        assert_eq!(a.quality.size(), 2);
        assert!(b.configs.is_empty());
    }
}
