//! Field-relative features.
//!
//! Runs after every runner in a race has its per-runner vector. Ranks are
//! permutations of `1..=k`; ties and missing values keep input order, with
//! missing values ranked last.

use super::{DrawTable, FeatureVector, RunningStyle};
use crate::config::FeaturesConfig;

/// Fill the field-relative and draw columns of every vector in one race.
pub fn apply_field_relative(
    field: &mut [FeatureVector],
    draws: &DrawTable,
    config: &FeaturesConfig,
) {
    let n = field.len();
    if n == 0 {
        return;
    }

    let rpr: Vec<Option<f64>> = field.iter().map(|f| f.rpr).collect();
    let ofr: Vec<Option<f64>> = field.iter().map(|f| f.ofr).collect();
    let weight: Vec<Option<f64>> = field.iter().map(|f| f.weight_lbs).collect();
    let age: Vec<Option<f64>> = field.iter().map(|f| f.horse_age).collect();
    let tsr: Vec<Option<f64>> = field.iter().map(|f| f.horse_avg_tsr_last_5).collect();
    let jockey: Vec<f64> = field
        .iter()
        .map(|f| f.jockey_win_rate_90d.unwrap_or(0.0))
        .collect();
    let trainer: Vec<f64> = field
        .iter()
        .map(|f| f.trainer_win_rate_90d.unwrap_or(0.0))
        .collect();

    let ratings: Vec<f64> = rpr.iter().flatten().copied().collect();
    let best = ratings.iter().copied().reduce(f64::max);
    let worst = ratings.iter().copied().reduce(f64::min);
    let avg = mean(&ratings);
    let top_3_avg = top_3_average(&ratings);
    let quartile = if ratings.len() >= 4 {
        Some(percentile(&ratings, 75.0))
    } else {
        avg
    };

    let rpr_rank = rank(&rpr, Order::Descending);
    let ofr_rank = rank(&ofr, Order::Descending);
    let weight_rank = rank(&weight, Order::Ascending);
    let age_rank = rank(&age, Order::Ascending);

    let ofr_avg = mean(&ofr.iter().flatten().copied().collect::<Vec<_>>());
    let weight_avg = mean(&weight.iter().flatten().copied().collect::<Vec<_>>());
    let age_avg = mean(&age.iter().flatten().copied().collect::<Vec<_>>());
    let tsr_avg = mean(&tsr.iter().flatten().copied().collect::<Vec<_>>());
    let jockey_avg = jockey.iter().sum::<f64>() / n as f64;
    let trainer_avg = trainer.iter().sum::<f64>() / n as f64;

    let pressers = field
        .iter()
        .filter(|f| {
            f.typical_running_style
                .map(|code| RunningStyle::from_code(code as u8).presses_pace())
                .unwrap_or(false)
        })
        .count() as f64;

    for (i, f) in field.iter_mut().enumerate() {
        f.field_size = Some(n as f64);
        f.field_best_rpr = best;
        f.field_worst_rpr = worst;
        f.field_avg_rpr = avg;
        f.field_rpr_spread = best.zip(worst).map(|(b, w)| b - w);
        f.top_3_rpr_avg = top_3_avg;

        f.horse_rpr_rank = Some(rpr_rank[i]);
        f.horse_rpr_vs_best = delta(rpr[i], best);
        f.horse_rpr_vs_worst = delta(rpr[i], worst);
        f.horse_in_top_quartile = rpr[i]
            .zip(quartile)
            .map(|(r, q)| if r >= q { 1.0 } else { 0.0 });

        f.rating_vs_avg = delta(ofr[i], ofr_avg);
        f.ofr_rank = Some(ofr_rank[i]);
        f.weight_lbs_rank = Some(weight_rank[i]);
        f.weight_vs_avg = delta(weight[i], weight_avg);
        f.age_rank = Some(age_rank[i]);
        f.age_vs_avg = delta(age[i], age_avg);
        f.tsr_vs_field_avg = delta(tsr[i], tsr_avg);
        f.jockey_rating = Some(jockey[i] - jockey_avg);
        f.trainer_rating = Some(trainer[i] - trainer_avg);
        f.pace_pressure_likely = Some(pressers);

        let bias = draws.bias_for(f.draw, n, config);
        f.course_distance_draw_bias = bias.bias;
        f.draw_position_normalized = bias.position_normalized;
        f.low_draw_advantage = Some(flag(bias.low_draw_advantage));
        f.high_draw_advantage = Some(flag(bias.high_draw_advantage));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// 1-based ranks. Stable: equal values keep input order, `None` ranks
/// after every present value.
pub fn rank(values: &[Option<f64>], order: Order) -> Vec<f64> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| match (values[a], values[b]) {
        (Some(x), Some(y)) => match order {
            Order::Ascending => x.total_cmp(&y),
            Order::Descending => y.total_cmp(&x),
        },
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    let mut ranks = vec![0.0; values.len()];
    for (pos, &i) in idx.iter().enumerate() {
        ranks[i] = (pos + 1) as f64;
    }
    ranks
}

/// Linear-interpolation percentile, `q` in 0..=100.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = (sorted.len() - 1) as f64 * q / 100.0;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn top_3_average(values: &[f64]) -> Option<f64> {
    if values.len() < 3 {
        return mean(values);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    mean(&sorted[..3])
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn delta(value: Option<f64>, reference: Option<f64>) -> Option<f64> {
    value.zip(reference).map(|(v, r)| v - r)
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}
