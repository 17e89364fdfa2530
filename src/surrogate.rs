//! A small hand-rolled gradient-boosted regression tree model.
//!
//! The design notes (spec §9) call out GBTs as "the only ecosystem
//! dependency that resists reimplementation... implementers may use any
//! gradient-boosted-trees library, but the contract is the parameters" — no
//! crate in this workspace's stack provides one, so this is first-party code
//! implementing exactly that documented contract: squared-error CART
//! regression trees, boosted in rounds of `num_parallel_tree` trees each,
//! with early stopping the first time validation error does not improve.

use rand::seq::SliceRandom;
use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct GbtParams {
    pub max_depth: u32,
    pub eta: f64,
    pub min_child_weight: usize,
    pub subsample: f64,
    pub num_parallel_tree: usize,
    pub learn_iters: usize,
}

impl Default for GbtParams {
    fn default() -> Self {
        GbtParams {
            max_depth: 3,
            eta: 0.3,
            min_child_weight: 2,
            subsample: 0.75,
            num_parallel_tree: 4,
            learn_iters: 50,
        }
    }
}

/// One row: a dense feature vector (`NaN` for absent knobs) plus the
/// observed target quality.
#[derive(Debug, Clone)]
pub struct TrainingRow {
    pub features: Vec<f64>,
    pub target: f64,
}

#[derive(Debug, Clone)]
enum TreeNode {
    Leaf { value: f64 },
    Split {
        feature: usize,
        threshold: f64,
        /// Which branch a `NaN` feature value falls into (CART's "missing
        /// value" convention: send it down whichever side had more rows at
        /// training time).
        nan_goes_left: bool,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
    },
}

impl TreeNode {
    fn predict(&self, row: &[f64]) -> f64 {
        match self {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split { feature, threshold, nan_goes_left, left, right } => {
                let x = row[*feature];
                let go_left = if x.is_nan() {
                    *nan_goes_left
                } else {
                    x < *threshold
                };
                if go_left {
                    left.predict(row)
                } else {
                    right.predict(row)
                }
            }
        }
    }
}

fn mean(residuals: &[f64], idx: &[usize]) -> f64 {
    if idx.is_empty() {
        return 0.0;
    }
    idx.iter().map(|&i| residuals[i]).sum::<f64>() / idx.len() as f64
}

fn sse(residuals: &[f64], idx: &[usize], value: f64) -> f64 {
    idx.iter().map(|&i| (residuals[i] - value).powi(2)).sum()
}

/// Greedy, exhaustive-threshold CART builder minimizing squared error.
fn build_tree(
    rows: &[TrainingRow],
    residuals: &[f64],
    idx: &[usize],
    depth: u32,
    params: &GbtParams,
) -> TreeNode {
    let leaf_value = mean(residuals, idx);
    if depth >= params.max_depth || idx.len() < params.min_child_weight * 2 {
        return TreeNode::Leaf { value: leaf_value };
    }

    let n_features = rows[0].features.len();
    let parent_sse = sse(residuals, idx, leaf_value);

    let mut best: Option<(usize, f64, bool, Vec<usize>, Vec<usize>, f64)> = None;

    for feature in 0..n_features {
        let mut present: Vec<usize> = idx
            .iter()
            .copied()
            .filter(|&i| !rows[i].features[feature].is_nan())
            .collect();
        if present.len() < params.min_child_weight * 2 {
            continue;
        }
        present.sort_by(|&a, &b| {
            rows[a].features[feature]
                .partial_cmp(&rows[b].features[feature])
                .unwrap()
        });

        let missing: Vec<usize> = idx
            .iter()
            .copied()
            .filter(|&i| rows[i].features[feature].is_nan())
            .collect();

        for split_pos in params.min_child_weight..=(present.len() - params.min_child_weight) {
            let threshold = rows[present[split_pos]].features[feature];
            if (rows[present[split_pos - 1]].features[feature] - threshold).abs() < 1e-12 {
                continue;
            }

            // try both assignments of missing rows (empty in most runs, but
            // spec's feature matrix explicitly allows NaN for absent knobs).
            for nan_left in [true, false] {
                let mut left: Vec<usize> = present[..split_pos].to_vec();
                let mut right: Vec<usize> = present[split_pos..].to_vec();
                if nan_left {
                    left.extend_from_slice(&missing);
                } else {
                    right.extend_from_slice(&missing);
                }
                if left.len() < params.min_child_weight || right.len() < params.min_child_weight {
                    continue;
                }

                let left_val = mean(residuals, &left);
                let right_val = mean(residuals, &right);
                let gain = parent_sse - sse(residuals, &left, left_val) - sse(residuals, &right, right_val);

                if best.as_ref().map(|b| gain > b.5).unwrap_or(gain > 1e-9) {
                    best = Some((feature, threshold, nan_left, left, right, gain));
                }
            }
        }
    }

    match best {
        Some((feature, threshold, nan_left, left, right, _gain)) => TreeNode::Split {
            feature,
            threshold,
            nan_goes_left: nan_left,
            left: Box::new(build_tree(rows, residuals, &left, depth + 1, params)),
            right: Box::new(build_tree(rows, residuals, &right, depth + 1, params)),
        },
        None => TreeNode::Leaf { value: leaf_value },
    }
}

#[derive(Debug, Clone)]
pub struct GbtModel {
    base_score: f64,
    /// Each round is `num_parallel_tree` trees whose (already eta-scaled)
    /// predictions are averaged together.
    rounds: Vec<Vec<TreeNode>>,
    eta: f64,
}

impl GbtModel {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut out = self.base_score;
        for round in &self.rounds {
            let round_sum: f64 = round.iter().map(|t| t.predict(row)).sum::<f64>() / round.len() as f64;
            out += self.eta * round_sum;
        }
        out
    }
}

fn mse(model_partial: impl Fn(&[f64]) -> f64, rows: &[TrainingRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    rows.iter()
        .map(|r| (model_partial(&r.features) - r.target).powi(2))
        .sum::<f64>()
        / rows.len() as f64
}

/// Trains a GBT per the parameters above, with validation-based early
/// stopping: `LearnIters` rounds at most, stop the first time validation
/// error does not strictly decrease, keep the best model seen so far.
pub fn train(
    train_rows: &[TrainingRow],
    validation_rows: &[TrainingRow],
    params: &GbtParams,
    rng: &mut impl Rng,
) -> GbtModel {
    let base_score = train_rows.iter().map(|r| r.target).sum::<f64>() / train_rows.len().max(1) as f64;

    let mut residuals: Vec<f64> = train_rows.iter().map(|r| r.target - base_score).collect();
    let mut rounds: Vec<Vec<TreeNode>> = Vec::new();

    let mut best_rounds = rounds.clone();
    let mut best_val_err = f64::INFINITY;

    for _ in 0..params.learn_iters {
        let sample_size = ((train_rows.len() as f64) * params.subsample).round().max(1.0) as usize;
        let mut all_idx: Vec<usize> = (0..train_rows.len()).collect();

        let mut round_trees = Vec::with_capacity(params.num_parallel_tree);
        for _ in 0..params.num_parallel_tree {
            all_idx.shuffle(rng);
            let idx: Vec<usize> = all_idx[..sample_size.min(all_idx.len())].to_vec();
            round_trees.push(build_tree(train_rows, &residuals, &idx, 0, params));
        }
        rounds.push(round_trees.clone());

        let round_pred = |features: &[f64]| -> f64 {
            round_trees.iter().map(|t| t.predict(features)).sum::<f64>() / round_trees.len() as f64
        };
        for (r, residual) in train_rows.iter().zip(residuals.iter_mut()) {
            *residual -= params.eta * round_pred(&r.features);
        }

        let model_so_far = GbtModel {
            base_score,
            rounds: rounds.clone(),
            eta: params.eta,
        };
        let val_err = mse(|row| model_so_far.predict(row), validation_rows);

        if val_err < best_val_err {
            best_val_err = val_err;
            best_rounds = rounds.clone();
        } else {
            break;
        }
    }

    GbtModel {
        base_score,
        rounds: best_rounds,
        eta: params.eta,
    }
}
