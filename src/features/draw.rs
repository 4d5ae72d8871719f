//! Post-position (draw) bias from past runs at the same course.

use std::collections::BTreeMap;

use crate::config::FeaturesConfig;
use crate::storage::DrawRun;

/// Draw bias features for one runner.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DrawBias {
    /// Win rate from this draw minus the rate expected with no bias.
    pub bias: Option<f64>,
    pub position_normalized: Option<f64>,
    pub low_draw_advantage: bool,
    pub high_draw_advantage: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    runs: u32,
    wins: u32,
}

impl Bucket {
    fn win_rate(&self) -> f64 {
        self.wins as f64 / self.runs as f64
    }
}

/// Win rates by draw at one course and distance. Only buckets that reach
/// the minimum sample size are kept.
#[derive(Debug, Clone, Default)]
pub struct DrawTable {
    buckets: BTreeMap<u32, Bucket>,
}

impl DrawTable {
    /// Build from completed runs at the course. Runs more than
    /// `tolerance_f` furlongs from `distance_f` are ignored.
    pub fn from_runs(runs: &[DrawRun], distance_f: f64, tolerance_f: f64, min_sample: u32) -> Self {
        let mut all: BTreeMap<u32, Bucket> = BTreeMap::new();
        for run in runs {
            if run.draw == 0 || (run.distance_f - distance_f).abs() > tolerance_f {
                continue;
            }
            let bucket = all.entry(run.draw).or_default();
            bucket.runs += 1;
            if run.position == 1 {
                bucket.wins += 1;
            }
        }
        all.retain(|_, b| b.runs >= min_sample);
        Self { buckets: all }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn mean_rate(&self, pred: impl Fn(u32) -> bool) -> Option<f64> {
        let rates: Vec<f64> = self
            .buckets
            .iter()
            .filter(|(d, _)| pred(**d))
            .map(|(_, b)| b.win_rate())
            .collect();
        (!rates.is_empty()).then(|| rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Draw bias for one runner in a field of `field_size`.
    pub fn bias_for(&self, draw: Option<f64>, field_size: usize, config: &FeaturesConfig) -> DrawBias {
        let draw = match draw {
            Some(d) if d >= 1.0 => d as u32,
            _ => return DrawBias::default(),
        };
        let field = field_size as i64;

        let bias = self
            .buckets
            .get(&draw)
            .map(|b| b.win_rate() - 1.0 / self.buckets.len() as f64);

        let position_normalized = if field_size > 0 {
            draw as f64 / field_size as f64
        } else {
            0.5
        };

        let high_start = (field - 5).max(10);
        let low_rate = self.mean_rate(|d| d <= config.low_draw_max);
        let high_rate = self.mean_rate(|d| d as i64 >= high_start);

        let mut low_draw_advantage = false;
        let mut high_draw_advantage = false;
        if let (Some(low), Some(high)) = (low_rate, high_rate) {
            if low > 0.0 && high > 0.0 {
                if low > high * config.draw_advantage_margin {
                    low_draw_advantage = draw <= config.low_draw_max;
                } else if high > low * config.draw_advantage_margin {
                    high_draw_advantage = draw as i64 >= field - 5;
                }
            }
        }

        DrawBias {
            bias,
            position_normalized: Some(position_normalized),
            low_draw_advantage,
            high_draw_advantage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runs(draw: u32, count: u32, wins: u32) -> Vec<DrawRun> {
        (0..count)
            .map(|i| DrawRun {
                draw,
                distance_f: 6.0,
                position: if i < wins { 1 } else { 5 },
            })
            .collect()
    }

    #[test]
    fn test_small_buckets_never_produce_bias() {
        let mut history = runs(1, 4, 4);
        history.extend(runs(2, 5, 1));
        let table = DrawTable::from_runs(&history, 6.0, 1.0, 5);
        let config = FeaturesConfig::default();

        assert_eq!(table.len(), 1);
        assert_eq!(table.bias_for(Some(1.0), 10, &config).bias, None);
        assert!(table.bias_for(Some(2.0), 10, &config).bias.is_some());
    }

    #[test]
    fn test_bias_against_uniform_expectation() {
        let mut history = runs(1, 10, 5);
        history.extend(runs(2, 10, 1));
        let table = DrawTable::from_runs(&history, 6.0, 1.0, 5);
        let config = FeaturesConfig::default();

        let bias = table.bias_for(Some(1.0), 8, &config);
        assert!((bias.bias.unwrap() - 0.0).abs() < 1e-12);
        let bias = table.bias_for(Some(2.0), 8, &config);
        assert!((bias.bias.unwrap() - (0.1 - 0.5)).abs() < 1e-12);
        assert_eq!(bias.position_normalized, Some(0.25));
    }

    #[test]
    fn test_distance_tolerance() {
        let mut history = runs(3, 5, 1);
        for run in history.iter_mut() {
            run.distance_f = 8.0;
        }
        let table = DrawTable::from_runs(&history, 6.0, 1.0, 5);
        assert!(table.is_empty());
    }

    #[test]
    fn test_low_draw_advantage() {
        let mut history = runs(2, 10, 4);
        history.extend(runs(12, 10, 1));
        let table = DrawTable::from_runs(&history, 6.0, 1.0, 5);
        let config = FeaturesConfig::default();

        let low = table.bias_for(Some(2.0), 14, &config);
        assert!(low.low_draw_advantage);
        assert!(!low.high_draw_advantage);

        let high = table.bias_for(Some(12.0), 14, &config);
        assert!(!high.low_draw_advantage);
        assert!(!high.high_draw_advantage);
    }

    #[test]
    fn test_high_draw_advantage() {
        let mut history = runs(2, 10, 1);
        history.extend(runs(12, 10, 4));
        let table = DrawTable::from_runs(&history, 6.0, 1.0, 5);
        let config = FeaturesConfig::default();

        assert!(table.bias_for(Some(12.0), 14, &config).high_draw_advantage);
        assert!(!table.bias_for(Some(2.0), 14, &config).high_draw_advantage);
    }

    #[test]
    fn test_missing_draw() {
        let table = DrawTable::default();
        let config = FeaturesConfig::default();
        assert_eq!(table.bias_for(None, 10, &config), DrawBias::default());
        assert_eq!(table.bias_for(Some(0.0), 10, &config), DrawBias::default());
    }
}
