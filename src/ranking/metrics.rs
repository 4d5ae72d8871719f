//! Ranking quality metrics over race groups.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Aggregate evaluation over a set of races.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub races: usize,
    pub ndcg_at_1: f64,
    pub ndcg_at_3: f64,
    pub ndcg_at_5: f64,
    /// Races where the top-scored runner won
    pub top_pick_win_rate: f64,
    /// Races where the winner was among the top three scores
    pub top_3_hit_rate: f64,
    /// Mean reciprocal predicted rank of the winner
    pub mrr: f64,
    /// Mean per-race rank correlation, races with three or more runners
    pub spearman: f64,
}

/// Indices of a group ordered by descending score, ties by input order.
pub fn order_by_score(scores: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    idx
}

/// NDCG@k with exponential gain `2^rel - 1`.
///
/// A group whose ideal DCG is zero scores 1.0.
pub fn ndcg_at(scores: &[f64], relevance: &[f64], k: usize) -> f64 {
    let dcg = |order: &[usize]| -> f64 {
        order
            .iter()
            .take(k)
            .enumerate()
            .map(|(i, &j)| (2f64.powf(relevance[j]) - 1.0) / ((i + 2) as f64).log2())
            .sum()
    };

    let predicted = order_by_score(scores);
    let mut ideal: Vec<usize> = (0..relevance.len()).collect();
    ideal.sort_by(|&a, &b| relevance[b].total_cmp(&relevance[a]));

    let idcg = dcg(&ideal);
    if idcg <= 0.0 {
        return 1.0;
    }
    dcg(&predicted) / idcg
}

/// Mean NDCG@k across groups.
pub fn mean_ndcg(groups: &[Range<usize>], scores: &[f64], relevance: &[f64], k: usize) -> f64 {
    if groups.is_empty() {
        return 0.0;
    }
    groups
        .iter()
        .map(|g| ndcg_at(&scores[g.clone()], &relevance[g.clone()], k))
        .sum::<f64>()
        / groups.len() as f64
}

/// Average ranks (1-based), ties share the mean of their positions.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < idx.len() {
        let mut j = i;
        while j + 1 < idx.len() && values[idx[j + 1]] == values[idx[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &k in &idx[i..=j] {
            ranks[k] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Spearman rank correlation, `None` when either side is constant.
pub fn spearman(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ra = average_ranks(a);
    let rb = average_ranks(b);
    let n = ra.len() as f64;
    let ma = ra.iter().sum::<f64>() / n;
    let mb = rb.iter().sum::<f64>() / n;
    let cov: f64 = ra.iter().zip(&rb).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = ra.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = rb.iter().map(|y| (y - mb).powi(2)).sum();
    if va == 0.0 || vb == 0.0 {
        return None;
    }
    Some(cov / (va * vb).sqrt())
}

/// Evaluate scores against finishing positions.
///
/// `relevance` is the per-runner points label; `positions` the actual
/// finishing positions. Winner-based rates only count races with a
/// recorded winner.
pub fn evaluate(
    groups: &[Range<usize>],
    scores: &[f64],
    relevance: &[f64],
    positions: &[u32],
) -> RankingMetrics {
    let mut top_pick = 0usize;
    let mut top_3 = 0usize;
    let mut reciprocal = 0.0;
    let mut with_winner = 0usize;
    let mut rho_sum = 0.0;
    let mut rho_races = 0usize;

    for g in groups {
        let s = &scores[g.clone()];
        let p = &positions[g.clone()];
        let order = order_by_score(s);

        if let Some(rank) = order.iter().position(|&i| p[i] == 1) {
            with_winner += 1;
            if rank == 0 {
                top_pick += 1;
            }
            if rank < 3 {
                top_3 += 1;
            }
            reciprocal += 1.0 / (rank + 1) as f64;
        }

        if s.len() >= 3 {
            // Higher score should mean a smaller finishing position
            let negated: Vec<f64> = p.iter().map(|&x| -(x as f64)).collect();
            if let Some(rho) = spearman(s, &negated) {
                rho_sum += rho;
                rho_races += 1;
            }
        }
    }

    let rate = |count: usize| {
        if with_winner == 0 {
            0.0
        } else {
            count as f64 / with_winner as f64
        }
    };

    RankingMetrics {
        races: groups.len(),
        ndcg_at_1: mean_ndcg(groups, scores, relevance, 1),
        ndcg_at_3: mean_ndcg(groups, scores, relevance, 3),
        ndcg_at_5: mean_ndcg(groups, scores, relevance, 5),
        top_pick_win_rate: rate(top_pick),
        top_3_hit_rate: rate(top_3),
        mrr: if with_winner == 0 {
            0.0
        } else {
            reciprocal / with_winner as f64
        },
        spearman: if rho_races == 0 {
            0.0
        } else {
            rho_sum / rho_races as f64
        },
    }
}

/// How often the top-scored runner finished in each position.
pub fn top_pick_positions(
    groups: &[Range<usize>],
    scores: &[f64],
    positions: &[u32],
) -> BTreeMap<u32, usize> {
    let mut counts = BTreeMap::new();
    for g in groups {
        if let Some(&best) = order_by_score(&scores[g.clone()]).first() {
            *counts.entry(positions[g.start + best]).or_insert(0) += 1;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ndcg_perfect_and_reversed() {
        let relevance = [3.0, 2.0, 1.0];
        assert!((ndcg_at(&[3.0, 2.0, 1.0], &relevance, 3) - 1.0).abs() < 1e-12);
        let reversed = ndcg_at(&[1.0, 2.0, 3.0], &relevance, 3);
        assert!(reversed < 1.0);
        assert!(reversed > 0.0);
    }

    #[test]
    fn test_ndcg_at_1() {
        // Top pick has relevance 2 of a best 3: (2^2 - 1) / (2^3 - 1)
        let ndcg = ndcg_at(&[0.5, 0.9, 0.1], &[3.0, 2.0, 1.0], 1);
        assert!((ndcg - 3.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_ndcg_all_zero_relevance() {
        assert_eq!(ndcg_at(&[1.0, 2.0], &[0.0, 0.0], 3), 1.0);
    }

    #[test]
    fn test_spearman() {
        assert!((spearman(&[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0]).unwrap() - 1.0).abs() < 1e-12);
        assert!((spearman(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(spearman(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
    }

    #[test]
    fn test_evaluate() {
        // Race 1: winner scored highest. Race 2: winner scored second.
        let groups = vec![0..3, 3..6];
        let scores = [0.9, 0.5, 0.1, 0.8, 0.7, 0.1];
        let positions = [1, 2, 3, 2, 1, 3];
        let relevance: Vec<f64> = positions.iter().map(|&p| (4 - p) as f64).collect();

        let m = evaluate(&groups, &scores, &relevance, &positions);
        assert_eq!(m.races, 2);
        assert_eq!(m.top_pick_win_rate, 0.5);
        assert_eq!(m.top_3_hit_rate, 1.0);
        assert!((m.mrr - 0.75).abs() < 1e-12);
        assert!((m.spearman - 0.75).abs() < 1e-12);

        let picks = top_pick_positions(&groups, &scores, &positions);
        assert_eq!(picks.get(&1), Some(&1));
        assert_eq!(picks.get(&2), Some(&1));
    }

    #[test]
    fn test_ties_keep_input_order() {
        assert_eq!(order_by_score(&[1.0, 2.0, 2.0, 0.0]), vec![1, 2, 0, 3]);
    }
}
