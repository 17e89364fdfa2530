//! Database of generated configurations with metadata, plus the generator
//! functions that produce new candidates (spec §3, §4.6).

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::knob::{Knob, KnobSet, OptLevel, Scale};

const GENERATE_RETRY_BOUND: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigMeta {
    pub predicted_quality: f64,
    pub been_in_top: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    database: HashMap<KnobSet, ConfigMeta>,
    top_queue: VecDeque<KnobSet>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.database.len()
    }

    pub fn is_empty(&self) -> bool {
        self.database.is_empty()
    }

    pub fn contains(&self, config: &KnobSet) -> bool {
        self.database.contains_key(config)
    }

    pub fn meta(&self, config: &KnobSet) -> Option<&ConfigMeta> {
        self.database.get(config)
    }

    pub fn set_predicted_quality(&mut self, config: &KnobSet, quality: f64) {
        if let Some(meta) = self.database.get_mut(config) {
            meta.predicted_quality = quality;
        }
    }

    /// Records `config` in the database if it is not already present,
    /// without affecting `been_in_top`.
    pub fn insert(&mut self, config: KnobSet) {
        self.database.entry(config).or_insert_with(ConfigMeta::default);
    }

    /// Enqueues `config` for trial and marks it as having been in the top
    /// batch.
    pub fn add_top(&mut self, config: KnobSet) {
        let meta = self.database.entry(config.clone()).or_insert_with(ConfigMeta::default);
        meta.been_in_top = true;
        self.top_queue.push_back(config);
    }

    pub fn pop_top(&mut self) -> Option<KnobSet> {
        self.top_queue.pop_front()
    }

    pub fn top_queue_len(&self) -> usize {
        self.top_queue.len()
    }

    pub fn all_configs(&self) -> impl Iterator<Item = (&KnobSet, &ConfigMeta)> {
        self.database.iter()
    }

    /// Clone `base`, draw each knob uniformly from its range, retry up to
    /// `GENERATE_RETRY_BOUND` times looking for a config not already in the
    /// database, and insert whatever the last attempt produced.
    pub fn gen_random(&mut self, base: &KnobSet, rng: &mut impl Rng) -> KnobSet {
        let mut candidate = base.clone();
        for attempt in 0..GENERATE_RETRY_BOUND {
            candidate = randomize(base, rng);
            if !self.contains(&candidate) || attempt == GENERATE_RETRY_BOUND - 1 {
                break;
            }
        }
        self.insert(candidate.clone());
        candidate
    }

    /// Like `gen_random` but perturbs around `base` with the normal rule
    /// from §4.2 instead of drawing uniformly.
    pub fn gen_nearby(&mut self, base: &KnobSet, rng: &mut impl Rng, energy: f64) -> KnobSet {
        let mut candidate = base.clone();
        for attempt in 0..GENERATE_RETRY_BOUND {
            candidate = perturb(base, rng, energy);
            if !self.contains(&candidate) || attempt == GENERATE_RETRY_BOUND - 1 {
                break;
            }
        }
        self.insert(candidate.clone());
        candidate
    }

    /// Draws a random key from the database. If `exclude_top` is set and
    /// every key has been in the top batch, returns any arbitrary one
    /// anyway (no usable alternative exists).
    pub fn gen_previous(&self, rng: &mut impl Rng, exclude_top: bool) -> Option<KnobSet> {
        if self.database.is_empty() {
            return None;
        }
        let keys: Vec<&KnobSet> = if exclude_top {
            let filtered: Vec<&KnobSet> = self
                .database
                .iter()
                .filter(|(_, m)| !m.been_in_top)
                .map(|(k, _)| k)
                .collect();
            if filtered.is_empty() {
                self.database.keys().collect()
            } else {
                filtered
            }
        } else {
            self.database.keys().collect()
        };
        let idx = rng.gen_range(0..keys.len());
        Some(keys[idx].clone())
    }

    /// Cycles through a small hard-coded list of known-good settings;
    /// `cursor` tracks position across calls and is advanced in place.
    /// Returns `None` once the list is exhausted.
    pub fn gen_expert_opinion(base: &KnobSet, cursor: &mut usize) -> Option<KnobSet> {
        let opinions = expert_opinions();
        if *cursor >= opinions.len() {
            return None;
        }
        let mut candidate = base.clone();
        for (id, knob) in opinions[*cursor].iter() {
            candidate.insert(id.clone(), knob.clone());
        }
        *cursor += 1;
        Some(candidate)
    }
}

/// "O3 + native CPU + IPRA + PBQP + attributor + exp-alias" and similar
/// hard-coded known-good bundles.
fn expert_opinions() -> Vec<Vec<(String, Knob)>> {
    vec![
        vec![
            ("opt-level".to_string(), Knob::OptLvl(Some(OptLevel::O3))),
            ("ipra".to_string(), Knob::Flag(Some(true))),
            ("pbqp".to_string(), Knob::Flag(Some(true))),
        ],
        vec![
            ("opt-level".to_string(), Knob::OptLvl(Some(OptLevel::O3))),
            ("attributor".to_string(), Knob::Flag(Some(true))),
            ("exp-alias".to_string(), Knob::Flag(Some(true))),
        ],
        vec![
            ("opt-level".to_string(), Knob::OptLvl(Some(OptLevel::O2))),
            ("ipra".to_string(), Knob::Flag(Some(false))),
        ],
    ]
}

fn randomize(base: &KnobSet, rng: &mut impl Rng) -> KnobSet {
    let mut out = KnobSet::new(base.loop_count());
    for (id, knob) in base.iter() {
        let new_knob = match knob {
            Knob::Flag(_) => Knob::Flag(Some(rng.gen_bool(0.5))),
            Knob::Int { min, max, scale, .. } => Knob::Int {
                value: Some(rng.gen_range(*min..=*max)),
                min: *min,
                max: *max,
                scale: *scale,
            },
            Knob::OptLvl(_) => {
                Knob::OptLvl(Some(OptLevel::from_index(rng.gen_range(0..=3))))
            }
        };
        out.insert(id.clone(), new_knob);
    }
    out
}

/// Perturbation rule from spec §4.2: sample a numeric knob from
/// `Normal(current, scaled_range/2)` where `scaled_range = (max-min)*energy/100`,
/// clamp to `[min,max]`, round. Flags treat their 0/1 range the same way.
pub fn perturb_numeric(current: i64, min: i64, max: i64, energy: f64, rng: &mut impl Rng) -> i64 {
    let scaled_range = (max - min) as f64 * energy / 100.0;
    let std_dev = (scaled_range / 2.0).max(1e-9);
    let normal = Normal::new(current as f64, std_dev).expect("std_dev is always positive");
    let sample = normal.sample(rng);
    sample.round().clamp(min as f64, max as f64) as i64
}

fn perturb(base: &KnobSet, rng: &mut impl Rng, energy: f64) -> KnobSet {
    let mut out = KnobSet::new(base.loop_count());
    for (id, knob) in base.iter() {
        let new_knob = match knob {
            Knob::Flag(v) => {
                let cur = if v.unwrap_or(false) { 1 } else { 0 };
                Knob::Flag(Some(perturb_numeric(cur, 0, 1, energy, rng) >= 1))
            }
            Knob::Int { value, min, max, scale } => {
                let cur = value.unwrap_or(*min);
                Knob::Int {
                    value: Some(perturb_numeric(cur, *min, *max, energy, rng)),
                    min: *min,
                    max: *max,
                    scale: *scale,
                }
            }
            Knob::OptLvl(v) => {
                let cur = v.map(|l| l.index()).unwrap_or(0);
                Knob::OptLvl(Some(OptLevel::from_index(perturb_numeric(
                    cur, 0, 3, energy, rng,
                ))))
            }
        };
        out.insert(id.clone(), new_knob);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn base() -> KnobSet {
        let mut ks = KnobSet::new(0);
        ks.insert("opt-level", Knob::OptLvl(Some(OptLevel::O2)));
        ks.insert(
            "inline-threshold",
            Knob::Int { value: Some(100), min: 0, max: 1000, scale: Scale::None },
        );
        ks
    }

    #[test]
    fn add_top_marks_been_in_top_and_enqueues() {
        let mut mgr = ConfigManager::new();
        mgr.add_top(base());
        assert_eq!(mgr.top_queue_len(), 1);
        assert!(mgr.meta(&base()).unwrap().been_in_top);
    }

    #[test]
    fn pop_top_is_fifo() {
        let mut mgr = ConfigManager::new();
        let mut a = base();
        a.insert("a-marker", Knob::Flag(Some(true)));
        let mut b = base();
        b.insert("b-marker", Knob::Flag(Some(true)));
        mgr.add_top(a.clone());
        mgr.add_top(b.clone());
        assert_eq!(mgr.pop_top(), Some(a));
        assert_eq!(mgr.pop_top(), Some(b));
        assert_eq!(mgr.pop_top(), None);
    }

    #[test]
    fn gen_random_inserts_into_database() {
        let mut mgr = ConfigManager::new();
        let mut rng = StdRng::seed_from_u64(42);
        let cfg = mgr.gen_random(&base(), &mut rng);
        assert!(mgr.contains(&cfg));
    }

    #[test]
    fn gen_previous_returns_none_on_empty_database() {
        let mgr = ConfigManager::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(mgr.gen_previous(&mut rng, true), None);
    }

    #[test]
    fn gen_expert_opinion_exhausts_then_returns_none() {
        let mut cursor = 0;
        let b = base();
        let mut seen = 0;
        while ConfigManager::gen_expert_opinion(&b, &mut cursor).is_some() {
            seen += 1;
        }
        assert!(seen > 0);
        assert_eq!(ConfigManager::gen_expert_opinion(&b, &mut cursor), None);
    }

    #[test]
    fn perturb_numeric_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let v = perturb_numeric(500, 0, 1000, 50.0, &mut rng);
            assert!((0..=1000).contains(&v));
        }
    }
}
