//! Per-client code-region map: resolves instruction pointers to functions.
//!
//! Grounded in `include/halo/compiler/CodeRegionInfo.h` of the original
//! source. Following the "shared raw pointers" redesign note (spec §9), the
//! interval map owns `(interval -> FunctionId)` and a parallel arena resolves
//! ids to [`FunctionInfo`] — no raw pointers, no lifetimes tying the map to
//! the arena.

use std::collections::BTreeMap;
use std::collections::HashMap;

pub const UNKNOWN_FUNCTION: &str = "<unknown>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub usize);

/// One VMA-normalized address range for a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDefinition {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub patchable: bool,
}

impl FunctionDefinition {
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.start && ip < self.end
    }
}

/// One or more [`FunctionDefinition`]s (aliased names / multiple emitted
/// copies) that should be treated as the same logical function.
#[derive(Debug, Clone, Default)]
pub struct FunctionInfo {
    definitions: Vec<FunctionDefinition>,
}

impl FunctionInfo {
    pub fn contains(&self, ip: u64) -> bool {
        self.definitions.iter().any(|d| d.contains(ip))
    }

    /// The first-registered definition's name, used as the stable display
    /// name for this function.
    pub fn canonical_name(&self) -> &str {
        self.definitions
            .first()
            .map(|d| d.name.as_str())
            .unwrap_or(UNKNOWN_FUNCTION)
    }

    pub fn is_patchable(&self) -> bool {
        self.definitions.iter().any(|d| d.patchable)
    }

    pub fn definitions(&self) -> &[FunctionDefinition] {
        &self.definitions
    }

    /// The start address of whichever definition contains `ip`, used by
    /// `CodeRegionInfo::is_call` to detect self-recursive calls.
    pub fn start_containing(&self, ip: u64) -> Option<u64> {
        self.definitions
            .iter()
            .find(|d| d.contains(ip))
            .map(|d| d.start)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodeRegionInfo {
    arena: Vec<FunctionInfo>,
    /// start address -> (end address, owning FunctionId). A `BTreeMap`
    /// keyed by interval start gives us `range(..=ip).next_back()` as a
    /// cheap stand-in for a real interval tree.
    intervals: BTreeMap<u64, (u64, FunctionId)>,
    name_index: HashMap<String, FunctionId>,
}

impl CodeRegionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a brand new function with its first definition.
    pub fn add_function(&mut self, def: FunctionDefinition) -> FunctionId {
        let id = FunctionId(self.arena.len());
        self.name_index.insert(def.name.clone(), id);
        self.intervals.insert(def.start, (def.end, id));
        self.arena.push(FunctionInfo {
            definitions: vec![def],
        });
        id
    }

    /// Adds an alias definition (another name and/or address range) to an
    /// existing function.
    pub fn add_alias(&mut self, id: FunctionId, def: FunctionDefinition) {
        self.name_index.insert(def.name.clone(), id);
        self.intervals.insert(def.start, (def.end, id));
        if let Some(info) = self.arena.get_mut(id.0) {
            info.definitions.push(def);
        }
    }

    pub fn get(&self, id: FunctionId) -> Option<&FunctionInfo> {
        self.arena.get(id.0)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<FunctionId> {
        self.name_index.get(name).copied()
    }

    /// Interval-map lookup: returns the function owning `ip`, or `None` if
    /// `ip` lands in no known function (the "unknown-function sentinel").
    pub fn lookup(&self, ip: u64) -> Option<FunctionId> {
        let (&start, &(end, id)) = self.intervals.range(..=ip).next_back()?;
        if ip >= start && ip < end {
            Some(id)
        } else {
            None
        }
    }

    pub fn canonical_name(&self, id: FunctionId) -> &str {
        self.get(id).map(|f| f.canonical_name()).unwrap_or(UNKNOWN_FUNCTION)
    }

    pub fn is_patchable(&self, id: FunctionId) -> bool {
        self.get(id).map(|f| f.is_patchable()).unwrap_or(false)
    }

    /// Two IPs are a call boundary iff:
    ///  - they resolve to different functions, or
    ///  - the target equals the start address of its own function (a
    ///    self-recursive call), or
    ///  - exactly one of the two is unknown.
    pub fn is_call(&self, src: u64, tgt: u64) -> bool {
        let src_fn = self.lookup(src);
        let tgt_fn = self.lookup(tgt);
        match (src_fn, tgt_fn) {
            (Some(a), Some(b)) => {
                if a != b {
                    return true;
                }
                self.get(b).and_then(|f| f.start_containing(tgt)) == Some(tgt)
            }
            (None, Some(_)) | (Some(_), None) => true,
            (None, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, start: u64, end: u64, patchable: bool) -> FunctionDefinition {
        FunctionDefinition {
            name: name.to_string(),
            start,
            end,
            patchable,
        }
    }

    #[test]
    fn lookup_resolves_ip_to_function() {
        let mut cri = CodeRegionInfo::new();
        let hot = cri.add_function(def("hot", 0x1000, 0x1100, true));
        let main = cri.add_function(def("main", 0x2000, 0x2100, false));

        assert_eq!(cri.lookup(0x1050), Some(hot));
        assert_eq!(cri.lookup(0x2050), Some(main));
        assert_eq!(cri.lookup(0x3000), None);
    }

    #[test]
    fn unknown_lookup_returns_none_sentinel() {
        let cri = CodeRegionInfo::new();
        assert_eq!(cri.lookup(0xdead), None);
    }

    #[test]
    fn is_call_true_for_different_functions() {
        let mut cri = CodeRegionInfo::new();
        cri.add_function(def("main", 0x1000, 0x1100, false));
        cri.add_function(def("hot", 0x2000, 0x2100, true));
        assert!(cri.is_call(0x1050, 0x2000));
    }

    #[test]
    fn is_call_true_for_self_recursion_at_function_start() {
        let mut cri = CodeRegionInfo::new();
        cri.add_function(def("fib", 0x1000, 0x1100, true));
        assert!(cri.is_call(0x1050, 0x1000));
    }

    #[test]
    fn is_call_false_within_same_function_not_at_start() {
        let mut cri = CodeRegionInfo::new();
        cri.add_function(def("fib", 0x1000, 0x1100, true));
        assert!(!cri.is_call(0x1010, 0x1050));
    }

    #[test]
    fn is_call_true_when_exactly_one_side_unknown() {
        let mut cri = CodeRegionInfo::new();
        cri.add_function(def("main", 0x1000, 0x1100, false));
        assert!(cri.is_call(0x1050, 0xffff));
        assert!(cri.is_call(0xffff, 0x1050));
    }

    #[test]
    fn is_call_false_when_both_unknown() {
        let cri = CodeRegionInfo::new();
        assert!(!cri.is_call(0xdead, 0xbeef));
    }

    #[test]
    fn aliases_share_the_same_function_id() {
        let mut cri = CodeRegionInfo::new();
        let id = cri.add_function(def("_Z3foo", 0x1000, 0x1100, true));
        cri.add_alias(id, def("foo", 0x1000, 0x1100, true));
        assert_eq!(cri.lookup_by_name("foo"), Some(id));
        assert_eq!(cri.lookup_by_name("_Z3foo"), Some(id));
        assert_eq!(cri.canonical_name(id), "_Z3foo");
    }
}
