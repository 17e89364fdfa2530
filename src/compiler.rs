//! The compilation backend: a pure `(bitcode, KnobSet) -> ObjectFile`
//! function standing in for the original's LLVM-based `CompilationPipeline`.
//! Equivalent knob settings (those that do not affect code generation, e.g.
//! differing only in an unset knob) must produce byte-identical objects so
//! `CodeVersion::mergeable_with` can detect duplicates — this stub achieves
//! that by hashing a canonical encoding of only the knobs that are set.

use crate::errors::CompileError;
use crate::knob::KnobSet;

/// Deterministic stand-in for real codegen: serializes the set knobs in a
/// stable (sorted) order and expands that into a fixed-size "object file."
/// Two configs that set the same knobs to the same values always compile to
/// the same bytes.
pub fn compile(bitcode: &[u8], knobs: &KnobSet) -> Result<Vec<u8>, CompileError> {
    if bitcode.is_empty() {
        return Err(CompileError::EmptyBitcode);
    }

    let mut entries: Vec<(String, String)> = knobs
        .set_knobs()
        .map(|(id, k)| (id.clone(), format!("{:?}", k)))
        .collect();
    entries.sort();

    let mut encoded = Vec::with_capacity(bitcode.len() + entries.len() * 32);
    encoded.extend_from_slice(b"HALOOBJ1");
    encoded.extend_from_slice(&(bitcode.len() as u64).to_be_bytes());
    encoded.extend_from_slice(bitcode);
    for (id, repr) in entries {
        encoded.extend_from_slice(id.as_bytes());
        encoded.push(0);
        encoded.extend_from_slice(repr.as_bytes());
        encoded.push(0);
    }

    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knob::{Knob, OptLevel};

    fn knobs_with(level: OptLevel) -> KnobSet {
        let mut ks = KnobSet::new(0);
        ks.insert("opt-level", Knob::OptLvl(Some(level)));
        ks
    }

    #[test]
    fn same_knobs_compile_to_identical_bytes() {
        let a = compile(b"bc", &knobs_with(OptLevel::O2)).unwrap();
        let b = compile(b"bc", &knobs_with(OptLevel::O2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_knobs_compile_to_different_bytes() {
        let a = compile(b"bc", &knobs_with(OptLevel::O2)).unwrap();
        let b = compile(b"bc", &knobs_with(OptLevel::O3)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_bitcode_is_an_error() {
        assert!(compile(b"", &knobs_with(OptLevel::O0)).is_err());
    }

    #[test]
    fn unset_knobs_do_not_affect_output() {
        let mut with_unset = knobs_with(OptLevel::O2);
        with_unset.insert("ipra", Knob::Flag(None));
        let without = knobs_with(OptLevel::O2);
        assert_eq!(
            compile(b"bc", &with_unset).unwrap(),
            compile(b"bc", &without).unwrap()
        );
    }
}
