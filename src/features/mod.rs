//! Feature engine.
//!
//! Builds one flat vector per runner from race context, runner attributes,
//! form and pre-race statistics, then adds field-relative features across
//! the race. Every statistic is computed from runs strictly before the
//! race date.

pub mod draw;
pub mod encode;
pub mod engine;
pub mod field;
pub mod pace;
pub mod target;

pub use draw::{DrawBias, DrawTable};
pub use engine::FeatureEngine;
pub use pace::RunningStyle;
pub use target::TargetLabel;

use serde::{Deserialize, Serialize};

/// Declares the feature vector together with its column list and
/// name-based access.
macro_rules! feature_vector {
    ($($name:ident),* $(,)?) => {
        /// One runner's features. `None` means "no data".
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        pub struct FeatureVector {
            $(pub $name: Option<f64>,)*
        }

        /// Feature column names in storage and model order.
        pub const FEATURE_COLUMNS: &[&str] = &[$(stringify!($name)),*];

        impl FeatureVector {
            /// Values in [`FEATURE_COLUMNS`] order.
            pub fn values(&self) -> Vec<Option<f64>> {
                vec![$(self.$name),*]
            }

            /// Rebuild from values in [`FEATURE_COLUMNS`] order.
            pub fn from_values(values: &[Option<f64>]) -> Self {
                let mut it = values.iter().copied();
                Self {
                    $($name: it.next().flatten(),)*
                }
            }

            /// Look up a feature by column name.
            pub fn get(&self, column: &str) -> Option<f64> {
                match column {
                    $(stringify!($name) => self.$name,)*
                    _ => None,
                }
            }
        }
    };
}

feature_vector! {
    // Horse history
    horse_age,
    horse_career_runs,
    horse_career_wins,
    horse_win_rate,
    horse_place_rate,
    horse_avg_position,
    horse_course_wins,
    horse_course_win_rate,
    horse_distance_win_rate,
    horse_going_win_rate,
    horse_days_since_last,
    // Form string
    horse_form_last_position,
    horse_form_last_3_avg,
    horse_form_last_5_avg,
    horse_form_last_10_avg,
    horse_form_best_last_5,
    horse_form_worst_last_5,
    horse_form_improving,
    horse_consistency,
    races_since_win,
    races_since_place,
    form_completed_last_5,
    form_dnf_last_5,
    form_win_rate_last_10,
    form_place_rate_last_10,
    // Ratings and pace
    horse_best_rating,
    horse_best_tsr,
    horse_avg_tsr_last_5,
    speed_improving,
    typical_running_style,
    // Trainer
    trainer_win_rate_14d,
    trainer_win_rate_30d,
    trainer_win_rate_90d,
    trainer_win_rate_365d,
    trainer_strike_rate,
    trainer_roi,
    trainer_ae_ratio,
    trainer_course_win_rate,
    trainer_distance_win_rate,
    // Jockey
    jockey_win_rate_14d,
    jockey_win_rate_30d,
    jockey_win_rate_90d,
    jockey_win_rate_365d,
    jockey_strike_rate,
    jockey_roi,
    jockey_ae_ratio,
    jockey_course_win_rate,
    jockey_distance_win_rate,
    // Trainer/jockey pair
    combo_win_rate,
    combo_strike_rate,
    combo_runs,
    combo_roi,
    // Race context
    distance_f,
    going_encoded,
    surface_encoded,
    race_type_encoded,
    race_class_encoded,
    prize_money,
    // Runner
    runner_number,
    draw,
    weight_lbs,
    ofr,
    rpr,
    ts,
    headgear_encoded,
    // Field-relative
    field_size,
    field_best_rpr,
    field_worst_rpr,
    field_avg_rpr,
    field_rpr_spread,
    top_3_rpr_avg,
    horse_rpr_rank,
    horse_rpr_vs_best,
    horse_rpr_vs_worst,
    horse_in_top_quartile,
    rating_vs_avg,
    ofr_rank,
    weight_lbs_rank,
    weight_vs_avg,
    age_rank,
    age_vs_avg,
    tsr_vs_field_avg,
    jockey_rating,
    trainer_rating,
    pace_pressure_likely,
    // Draw
    course_distance_draw_bias,
    draw_position_normalized,
    low_draw_advantage,
    high_draw_advantage,
}

/// Feature vector with its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerFeatures {
    pub race_id: String,
    pub runner_id: String,
    pub horse_id: String,
    pub features: FeatureVector,
}

/// Everything computed for one race: feature rows plus labels for the
/// runners that finished.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceFeatures {
    pub race_id: String,
    pub runners: Vec<RunnerFeatures>,
    pub targets: Vec<TargetLabel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_count() {
        assert_eq!(FEATURE_COLUMNS.len(), 89);
        assert_eq!(FeatureVector::default().values().len(), FEATURE_COLUMNS.len());
    }

    #[test]
    fn test_columns_unique() {
        let mut sorted = FEATURE_COLUMNS.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), FEATURE_COLUMNS.len());
    }

    #[test]
    fn test_values_and_get_agree() {
        let fv = FeatureVector {
            rpr: Some(101.0),
            draw: Some(4.0),
            ..Default::default()
        };
        let values = fv.values();
        for (i, column) in FEATURE_COLUMNS.iter().enumerate() {
            assert_eq!(values[i], fv.get(column));
        }
        assert_eq!(fv.get("rpr"), Some(101.0));
        assert_eq!(fv.get("no_such_column"), None);
        assert_eq!(FeatureVector::from_values(&values), fv);
    }
}
