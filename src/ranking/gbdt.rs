//! Gradient-boosted regression trees with a pairwise ranking objective.
//!
//! Gradients come from RankNet pair losses taken only within a race
//! group. Trees are grown depth-wise on histogram bins with Newton leaf
//! values and L2 regularization.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

use super::dataset::RankingDataset;
use super::metrics::mean_ndcg;
use crate::config::TrainerConfig;

/// Early stopping watches NDCG at this cutoff.
const EVAL_CUTOFF: usize = 3;

const MIN_SPLIT_GAIN: f64 = 1e-12;

/// A single decision tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    /// Rows with `value <= threshold` go left
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    /// Leaf output, already scaled by the learning rate
    Leaf(f64),
}

/// One regression tree; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf(value) => return *value,
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// Trained ensemble with the column order and imputation values it
/// expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingModel {
    pub columns: Vec<String>,
    pub medians: Vec<f64>,
    pub trees: Vec<Tree>,
    pub best_iteration: usize,
}

impl RankingModel {
    /// Raw ranking score for one dense row.
    pub fn score(&self, row: &[f64]) -> f64 {
        self.trees.iter().map(|t| t.predict(row)).sum()
    }

    /// Scores for every row of a dataset.
    pub fn score_dataset(&self, data: &RankingDataset) -> Vec<f64> {
        (0..data.n_rows())
            .into_par_iter()
            .map(|i| self.score(&data.row(i)))
            .collect()
    }

    /// Dense row from optional values, in model column order.
    pub fn impute(&self, values: &[Option<f64>]) -> Vec<f64> {
        self.medians
            .iter()
            .enumerate()
            .map(|(j, m)| values.get(j).copied().flatten().unwrap_or(*m))
            .collect()
    }
}

/// Boosting hyper-parameters.
#[derive(Debug, Clone)]
pub struct GbdtParams {
    pub max_depth: usize,
    pub learning_rate: f64,
    pub n_rounds: usize,
    pub subsample: f64,
    pub colsample: f64,
    pub early_stopping_rounds: usize,
    pub min_child_weight: f64,
    pub lambda: f64,
    pub max_bins: usize,
    pub seed: u64,
}

impl From<&TrainerConfig> for GbdtParams {
    fn from(c: &TrainerConfig) -> Self {
        Self {
            max_depth: c.max_depth,
            learning_rate: c.learning_rate,
            n_rounds: c.n_rounds,
            subsample: c.subsample,
            colsample: c.colsample,
            early_stopping_rounds: c.early_stopping_rounds,
            min_child_weight: c.min_child_weight,
            lambda: c.lambda,
            max_bins: c.max_bins.clamp(2, u16::MAX as usize),
            seed: c.seed,
        }
    }
}

/// Result of a boosting run.
#[derive(Debug, Clone)]
pub struct Booster {
    pub trees: Vec<Tree>,
    pub best_iteration: usize,
    /// Total split gain per feature over the kept trees
    pub importance: Vec<f64>,
    /// Eval NDCG@3 after each round
    pub eval_history: Vec<f64>,
}

/// Bin thresholds per feature; bin `b` holds values `<= cuts[b]`, the
/// last bin everything above.
struct BinnedMatrix {
    cuts: Vec<Vec<f64>>,
    /// Column-major bin indices
    bins: Vec<Vec<u16>>,
}

impl BinnedMatrix {
    fn build(data: &RankingDataset, max_bins: usize) -> Self {
        let (cuts, bins): (Vec<_>, Vec<_>) = (0..data.n_features())
            .into_par_iter()
            .map(|j| {
                let column = data.features.column(j);
                let mut uniq: Vec<f64> = column.iter().copied().collect();
                uniq.sort_by(f64::total_cmp);
                uniq.dedup();

                let cuts: Vec<f64> = if uniq.len() <= max_bins {
                    uniq[..uniq.len().saturating_sub(1)].to_vec()
                } else {
                    let mut c: Vec<f64> = (1..max_bins)
                        .map(|k| uniq[k * uniq.len() / max_bins - 1])
                        .collect();
                    c.dedup();
                    c
                };
                let bins = column
                    .iter()
                    .map(|v| cuts.partition_point(|c| c < v) as u16)
                    .collect();
                (cuts, bins)
            })
            .unzip();
        Self { cuts, bins }
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitCandidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

/// Pairwise gradients and hessians, pairs taken within each group only.
pub fn pairwise_gradients(groups: &[Range<usize>], labels: &[f64], scores: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let per_group: Vec<Vec<(f64, f64)>> = groups
        .par_iter()
        .map(|g| {
            let n = g.len();
            let mut out = vec![(0.0, 0.0); n];
            for a in 0..n {
                for b in 0..n {
                    let (i, j) = (g.start + a, g.start + b);
                    if labels[i] <= labels[j] {
                        continue;
                    }
                    // i should rank above j
                    let rho = 1.0 / (1.0 + (scores[i] - scores[j]).exp());
                    let h = (rho * (1.0 - rho)).max(1e-16);
                    out[a].0 -= rho;
                    out[a].1 += h;
                    out[b].0 += rho;
                    out[b].1 += h;
                }
            }
            out
        })
        .collect();

    let mut grad = vec![0.0; labels.len()];
    let mut hess = vec![0.0; labels.len()];
    for (g, values) in groups.iter().zip(per_group) {
        for (k, (gr, he)) in values.into_iter().enumerate() {
            grad[g.start + k] = gr;
            hess[g.start + k] = he;
        }
    }
    (grad, hess)
}

struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    grad: &'a [f64],
    hess: &'a [f64],
    features: &'a [usize],
    params: &'a GbdtParams,
    nodes: Vec<TreeNode>,
    importance: Vec<f64>,
}

impl<'a> TreeBuilder<'a> {
    fn leaf_weight(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.params.lambda) * self.params.learning_rate
    }

    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.params.lambda)
    }

    fn best_split(&self, rows: &[usize], g_total: f64, h_total: f64) -> Option<SplitCandidate> {
        let parent = self.score(g_total, h_total);
        let candidates: Vec<Option<SplitCandidate>> = self
            .features
            .par_iter()
            .map(|&feature| {
                let n_bins = self.binned.cuts[feature].len() + 1;
                if n_bins < 2 {
                    return None;
                }
                let mut g_hist = vec![0.0; n_bins];
                let mut h_hist = vec![0.0; n_bins];
                let column = &self.binned.bins[feature];
                for &r in rows {
                    let b = column[r] as usize;
                    g_hist[b] += self.grad[r];
                    h_hist[b] += self.hess[r];
                }

                let mut best: Option<SplitCandidate> = None;
                let (mut gl, mut hl) = (0.0, 0.0);
                for bin in 0..n_bins - 1 {
                    gl += g_hist[bin];
                    hl += h_hist[bin];
                    let (gr, hr) = (g_total - gl, h_total - hl);
                    if hl < self.params.min_child_weight || hr < self.params.min_child_weight {
                        continue;
                    }
                    let gain = self.score(gl, hl) + self.score(gr, hr) - parent;
                    if gain > MIN_SPLIT_GAIN && best.map_or(true, |b| gain > b.gain) {
                        best = Some(SplitCandidate { feature, bin, gain });
                    }
                }
                best
            })
            .collect();

        // Sequential reduce keeps the choice independent of thread timing
        candidates
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<SplitCandidate>, c| match acc {
                Some(a) if a.gain >= c.gain => Some(a),
                _ => Some(c),
            })
    }

    fn build(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let g_total: f64 = rows.iter().map(|&r| self.grad[r]).sum();
        let h_total: f64 = rows.iter().map(|&r| self.hess[r]).sum();
        let idx = self.nodes.len();
        self.nodes.push(TreeNode::Leaf(self.leaf_weight(g_total, h_total)));

        if depth >= self.params.max_depth || rows.len() < 2 {
            return idx;
        }
        let split = match self.best_split(&rows, g_total, h_total) {
            Some(s) => s,
            None => return idx,
        };

        let column = &self.binned.bins[split.feature];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| column[r] as usize <= split.bin);

        self.importance[split.feature] += split.gain;
        let left = self.build(left_rows, depth + 1);
        let right = self.build(right_rows, depth + 1);
        self.nodes[idx] = TreeNode::Split {
            feature: split.feature,
            threshold: self.binned.cuts[split.feature][split.bin],
            left,
            right,
        };
        idx
    }
}

/// Boost a pairwise ranker, early stopping on the eval set when given.
pub fn train(train: &RankingDataset, eval: Option<&RankingDataset>, params: &GbdtParams) -> Booster {
    let n_features = train.n_features();
    let binned = BinnedMatrix::build(train, params.max_bins);
    let mut rng = ChaCha8Rng::seed_from_u64(params.seed);

    let mut train_scores = vec![0.0; train.n_rows()];
    let mut eval_scores = eval.map(|e| vec![0.0; e.n_rows()]);

    let mut trees = Vec::new();
    let mut importances: Vec<Vec<f64>> = Vec::new();
    let mut eval_history = Vec::new();
    let mut best_iteration = 0;
    let mut best_ndcg = f64::NEG_INFINITY;

    let n_cols = ((n_features as f64 * params.colsample).ceil() as usize).clamp(1, n_features.max(1));

    for round in 0..params.n_rounds {
        let (grad, hess) = pairwise_gradients(&train.groups, &train.labels, &train_scores);

        let rows: Vec<usize> = (0..train.n_rows())
            .filter(|_| rng.gen::<f64>() < params.subsample)
            .collect();
        let mut features: Vec<usize> = (0..n_features).collect();
        features.shuffle(&mut rng);
        features.truncate(n_cols);
        features.sort_unstable();

        let mut builder = TreeBuilder {
            binned: &binned,
            grad: &grad,
            hess: &hess,
            features: &features,
            params,
            nodes: Vec::new(),
            importance: vec![0.0; n_features],
        };
        builder.build(rows, 0);
        let tree = Tree {
            nodes: builder.nodes,
        };

        for (i, s) in train_scores.iter_mut().enumerate() {
            *s += tree.predict(&train.row(i));
        }

        if let (Some(eval), Some(scores)) = (eval, eval_scores.as_mut()) {
            for (i, s) in scores.iter_mut().enumerate() {
                *s += tree.predict(&eval.row(i));
            }
            let ndcg = mean_ndcg(&eval.groups, scores, &eval.labels, EVAL_CUTOFF);
            eval_history.push(ndcg);
            debug!("round {} eval ndcg@{} {:.5}", round, EVAL_CUTOFF, ndcg);

            if ndcg > best_ndcg {
                best_ndcg = ndcg;
                best_iteration = round;
            } else if round - best_iteration >= params.early_stopping_rounds {
                trees.push(tree);
                importances.push(builder.importance);
                info!(
                    "Early stopping at round {}, best round {} (ndcg@{} {:.5})",
                    round, best_iteration, EVAL_CUTOFF, best_ndcg
                );
                break;
            }
        } else {
            best_iteration = round;
        }

        trees.push(tree);
        importances.push(builder.importance);
    }

    trees.truncate(best_iteration + 1);
    let mut importance = vec![0.0; n_features];
    for per_tree in importances.iter().take(trees.len()) {
        for (total, gain) in importance.iter_mut().zip(per_tree) {
            *total += gain;
        }
    }

    Booster {
        trees,
        best_iteration,
        importance,
        eval_history,
    }
}
