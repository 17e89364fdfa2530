//! Surrogate-model-driven configuration proposer (spec §4.2): trains a
//! [`surrogate::GbtModel`] on `(config -> quality)` history, scores a batch
//! of generated candidates, and queues the best of them onto the
//! [`ConfigManager`]'s top-queue.

use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use crate::code_version::CodeVersion;
use crate::config_manager::ConfigManager;
use crate::errors::TunerError;
use crate::knob::KnobSet;
use crate::surrogate::{self, GbtParams, TrainingRow};

pub struct TunerParams {
    pub min_prior: usize,
    pub search_sz: usize,
    pub explore_ratio: f64,
    pub exploit_batch_sz: usize,
    pub total_batch_sz: usize,
    pub perturb_energy: f64,
    pub gbt: GbtParams,
}

impl Default for TunerParams {
    fn default() -> Self {
        TunerParams {
            min_prior: 4,
            search_sz: 200,
            explore_ratio: 0.3,
            exploit_batch_sz: 5,
            total_batch_sz: 10,
            perturb_energy: 50.0,
            gbt: GbtParams::default(),
        }
    }
}

pub struct PseudoBayesTuner {
    pub params: TunerParams,
}

impl Default for PseudoBayesTuner {
    fn default() -> Self {
        PseudoBayesTuner { params: TunerParams::default() }
    }
}

fn knob_columns(configs: &[&KnobSet]) -> Vec<String> {
    let mut ids: Vec<String> = configs
        .iter()
        .flat_map(|c| c.ids().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    ids.sort();
    ids
}

fn row_for(config: &KnobSet, columns: &[String]) -> Vec<f64> {
    columns
        .iter()
        .map(|id| config.get(id).map(|k| k.as_f64()).unwrap_or(f64::NAN))
        .collect()
}

fn best_version(versions: &[CodeVersion]) -> Option<&CodeVersion> {
    versions
        .iter()
        .filter(|v| !v.broken && !v.quality.is_empty())
        .max_by(|a, b| a.quality.mean().partial_cmp(&b.quality.mean()).unwrap())
}

impl PseudoBayesTuner {
    pub fn new(params: TunerParams) -> Self {
        PseudoBayesTuner { params }
    }

    pub fn next_is_predetermined(&self, manager: &ConfigManager) -> bool {
        manager.top_queue_len() > 0
    }

    /// Returns the front of the manager's top-queue; if empty, runs
    /// `generate_configs` and tops up any remaining slack with random
    /// configs so the queue always has at least one entry to hand back.
    pub fn get_config(
        &self,
        manager: &mut ConfigManager,
        versions: &[CodeVersion],
        base: &KnobSet,
        rng: &mut impl Rng,
    ) -> KnobSet {
        if let Some(c) = manager.pop_top() {
            return c;
        }

        let _ = self.generate_configs(manager, versions, rng);

        while manager.top_queue_len() < self.params.total_batch_sz {
            let c = manager.gen_random(base, rng);
            manager.add_top(c);
        }

        manager
            .pop_top()
            .unwrap_or_else(|| manager.gen_random(base, rng))
    }

    /// The core surrogate-search algorithm of spec §4.2 steps 1-6.
    pub fn generate_configs(
        &self,
        manager: &mut ConfigManager,
        versions: &[CodeVersion],
        rng: &mut impl Rng,
    ) -> Result<usize, TunerError> {
        let mut usable: Vec<(&KnobSet, f64)> = Vec::new();
        for v in versions {
            if v.quality.is_empty() {
                continue;
            }
            let target = v.quality.mean();
            for config in &v.configs {
                usable.push((config, target));
            }
        }

        if usable.len() < self.params.min_prior {
            return Err(TunerError::InsufficientPrior {
                have: usable.len(),
                need: self.params.min_prior,
            });
        }

        let columns = knob_columns(&usable.iter().map(|(c, _)| *c).collect::<Vec<_>>());

        let mut rows: Vec<TrainingRow> = usable
            .iter()
            .map(|(c, target)| TrainingRow {
                features: row_for(c, &columns),
                target: *target,
            })
            .collect();
        rows.shuffle(rng);

        let heldout = (rows.len() as f64 * 0.2).round().max(2.0) as usize;
        let heldout = heldout.min(rows.len().saturating_sub(1)).max(1);
        let split_at = rows.len() - heldout;
        let (train_rows, val_rows) = rows.split_at_mut(split_at);

        let model = surrogate::train(train_rows, val_rows, &self.params.gbt, rng);

        let base_config = usable[0].0.clone();
        let pivot = best_version(versions).map(|v| v.configs[0].clone()).unwrap_or_else(|| base_config.clone());

        let n_random = (self.params.search_sz as f64 * self.params.explore_ratio).round() as usize;
        let n_refresh = (self.params.search_sz / 20).max(1);
        let n_perturb = self.params.search_sz.saturating_sub(n_random).saturating_sub(n_refresh);

        let mut candidates: Vec<KnobSet> = Vec::with_capacity(self.params.search_sz);
        for _ in 0..n_random {
            candidates.push(manager.gen_random(&base_config, rng));
        }
        for _ in 0..n_perturb {
            candidates.push(manager.gen_nearby(&pivot, rng, self.params.perturb_energy));
        }
        for _ in 0..n_refresh {
            if let Some(c) = manager.gen_previous(rng, false) {
                candidates.push(c);
            }
        }

        if candidates.is_empty() {
            return Err(TunerError::NoGoodCandidate);
        }

        let scored: Vec<(KnobSet, f64)> = candidates
            .par_iter()
            .map(|c| {
                let row = row_for(c, &columns);
                (c.clone(), model.predict(&row))
            })
            .collect();

        let mut ranked = scored;
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(self.params.exploit_batch_sz);

        if ranked.is_empty() {
            return Err(TunerError::NoGoodCandidate);
        }

        let n_queued = ranked.len();
        for (config, predicted) in ranked {
            manager.insert(config.clone());
            manager.set_predicted_quality(&config, predicted);
            manager.add_top(config);
        }

        Ok(n_queued)
    }
}
