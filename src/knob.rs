//! The tunable configuration space.
//!
//! A [`Knob`] is one compiler-flag-shaped tunable: a tri-state flag, a
//! bounded integer with a reporting scale, or a total-ordered optimization
//! level. A [`KnobSet`] is a named collection of knobs plus the loop count
//! used to expand `loop{i}-{name}` ids for per-loop knobs.
//!
//! Knobs may be *unset*, meaning "do not emit this option" — only set knobs
//! contribute during code generation (`KnobSet::emit`).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// How an integer knob's raw value should be interpreted when reported or
/// perturbed. `None` = linear. `Half`/`Hundredth` scale the raw integer down
/// before display (e.g. a raw value of 150 with `Hundredth` reports 1.50).
/// `Log` perturbs in log-space (see `config_manager::perturb_numeric`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scale {
    None,
    Log,
    Half,
    Hundredth,
}

/// A total order over the standard four optimization levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
}

impl OptLevel {
    pub const ALL: [OptLevel; 4] = [OptLevel::O0, OptLevel::O1, OptLevel::O2, OptLevel::O3];

    pub fn from_index(i: i64) -> Self {
        match i.clamp(0, 3) {
            0 => OptLevel::O0,
            1 => OptLevel::O1,
            2 => OptLevel::O2,
            _ => OptLevel::O3,
        }
    }

    pub fn index(self) -> i64 {
        self as i64
    }
}

/// The knob sum type. Every variant can be unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Knob {
    Flag(Option<bool>),
    Int {
        value: Option<i64>,
        min: i64,
        max: i64,
        scale: Scale,
    },
    OptLvl(Option<OptLevel>),
}

impl Knob {
    pub fn is_set(&self) -> bool {
        match self {
            Knob::Flag(v) => v.is_some(),
            Knob::Int { value, .. } => value.is_some(),
            Knob::OptLvl(v) => v.is_some(),
        }
    }

    pub fn unset(&self) -> Self {
        match self {
            Knob::Flag(_) => Knob::Flag(None),
            Knob::Int { min, max, scale, .. } => Knob::Int {
                value: None,
                min: *min,
                max: *max,
                scale: *scale,
            },
            Knob::OptLvl(_) => Knob::OptLvl(None),
        }
    }

    /// Number of distinct settable values, for `KnobSet::cardinality`
    /// diagnostics (reported, never used in the stop test per spec §4.7).
    pub fn cardinality(&self) -> u64 {
        match self {
            Knob::Flag(_) => 2,
            Knob::Int { min, max, .. } => (max.saturating_sub(*min) as u64).saturating_add(1),
            Knob::OptLvl(_) => OptLevel::ALL.len() as u64,
        }
    }

    /// Flatten to a single float for the tuner's dense feature matrix.
    /// Absent knobs become `NaN`, matching spec §4.2 step 2.
    pub fn as_f64(&self) -> f64 {
        match self {
            Knob::Flag(Some(b)) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Knob::Flag(None) => f64::NAN,
            Knob::Int { value: Some(v), .. } => *v as f64,
            Knob::Int { value: None, .. } => f64::NAN,
            Knob::OptLvl(Some(l)) => l.index() as f64,
            Knob::OptLvl(None) => f64::NAN,
        }
    }

    /// Re-inflate a float from the feature matrix back into this knob's
    /// shape, clamping to its declared range. A `NaN` input leaves the knob
    /// unset.
    pub fn with_f64(&self, x: f64) -> Self {
        if x.is_nan() {
            return self.unset();
        }
        match self {
            Knob::Flag(_) => Knob::Flag(Some(x >= 0.5)),
            Knob::Int { min, max, scale, .. } => Knob::Int {
                value: Some((x.round() as i64).clamp(*min, *max)),
                min: *min,
                max: *max,
                scale: *scale,
            },
            Knob::OptLvl(_) => Knob::OptLvl(Some(OptLevel::from_index(x.round() as i64))),
        }
    }
}

/// A named collection of knobs plus the loop count `N` that determines how
/// many `loop{i}-{name}` ids are expected to exist for each registered
/// per-loop knob template.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KnobSet {
    knobs: HashMap<String, Knob>,
    loop_count: u32,
}

/// Compose the `loop{i}-{name}` id used for per-loop knobs.
pub fn loop_knob_id(i: u32, name: &str) -> String {
    format!("loop{i}-{name}")
}

impl KnobSet {
    pub fn new(loop_count: u32) -> Self {
        KnobSet {
            knobs: HashMap::new(),
            loop_count,
        }
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn set_loop_count(&mut self, n: u32) {
        self.loop_count = n;
    }

    pub fn len(&self) -> usize {
        self.knobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knobs.is_empty()
    }

    /// Insert or overwrite a knob by id. Returns the previous value, if any.
    /// No two knobs may share an id — this is the sole write path that can
    /// violate that invariant, and it never does because it replaces rather
    /// than duplicates.
    pub fn insert(&mut self, id: impl Into<String>, knob: Knob) -> Option<Knob> {
        self.knobs.insert(id.into(), knob)
    }

    pub fn get(&self, id: &str) -> Option<&Knob> {
        self.knobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Knob> {
        self.knobs.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Knob> {
        self.knobs.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.knobs.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Knob)> {
        self.knobs.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.knobs.keys()
    }

    /// Product of every knob's cardinality: the size of the full
    /// configuration space. Diagnostic-only (spec §4.7).
    pub fn cardinality(&self) -> u128 {
        self.knobs
            .values()
            .map(|k| k.cardinality() as u128)
            .product::<u128>()
            .max(1)
    }

    /// Copy-union: for every knob in `other` not already present in `self`,
    /// insert it. On a conflicting id, `self`'s value wins (the receiver).
    pub fn union_from(&mut self, other: &KnobSet) {
        for (id, knob) in other.knobs.iter() {
            self.knobs.entry(id.clone()).or_insert_with(|| knob.clone());
        }
        self.loop_count = self.loop_count.max(other.loop_count);
    }

    /// Only knobs that are actually set contribute to code generation.
    pub fn set_knobs(&self) -> impl Iterator<Item = (&String, &Knob)> {
        self.knobs.iter().filter(|(_, k)| k.is_set())
    }
}

/// `HashMap` gives us correct, order-independent `PartialEq`/`Eq` for free,
/// but does not implement `Hash` (iteration order is unspecified, so a naive
/// derive would break `hash(K) == hash(clone(K))` only by accident). We fold
/// per-entry hashes with XOR, which is commutative, so the result does not
/// depend on iteration order.
impl Hash for KnobSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut acc: u64 = 0;
        for (id, knob) in self.knobs.iter() {
            let mut h = DefaultHasher::new();
            id.hash(&mut h);
            knob.hash(&mut h);
            acc ^= h.finish();
        }
        acc.hash(state);
        self.loop_count.hash(state);
    }
}
