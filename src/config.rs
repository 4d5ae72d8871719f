//! Configuration for the ranking pipeline.

use serde::{Deserialize, Serialize};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/racing.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Statistics aggregation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Joint runs a trainer/jockey pair needs before its stats count
    #[serde(default = "default_combo_min_runs")]
    pub combo_min_runs: u32,
    /// Past runs scanned for speed ratings
    #[serde(default = "default_pace_lookback")]
    pub pace_lookback: usize,
    /// Past runs whose comments vote on running style
    #[serde(default = "default_pace_comment_runs")]
    pub pace_comment_runs: usize,
}

fn default_combo_min_runs() -> u32 {
    5
}

fn default_pace_lookback() -> usize {
    10
}

fn default_pace_comment_runs() -> usize {
    5
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            combo_min_runs: default_combo_min_runs(),
            pace_lookback: default_pace_lookback(),
            pace_comment_runs: default_pace_comment_runs(),
        }
    }
}

/// Feature engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    /// Furlongs either side of the race distance for horse distance form
    #[serde(default = "default_distance_tolerance_f")]
    pub distance_tolerance_f: f64,
    /// Furlongs either side of the race distance for draw analysis
    #[serde(default = "default_draw_distance_tolerance_f")]
    pub draw_distance_tolerance_f: f64,
    /// Runs a draw bucket needs before its win rate is trusted
    #[serde(default = "default_draw_min_sample")]
    pub draw_min_sample: u32,
    /// Relative margin one draw group must beat the other by
    #[serde(default = "default_draw_advantage_margin")]
    pub draw_advantage_margin: f64,
    /// Highest stall counted as a low draw
    #[serde(default = "default_low_draw_max")]
    pub low_draw_max: u32,
}

fn default_distance_tolerance_f() -> f64 {
    2.0
}

fn default_draw_distance_tolerance_f() -> f64 {
    1.0
}

fn default_draw_min_sample() -> u32 {
    5
}

fn default_draw_advantage_margin() -> f64 {
    1.2
}

fn default_low_draw_max() -> u32 {
    5
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            distance_tolerance_f: default_distance_tolerance_f(),
            draw_distance_tolerance_f: default_draw_distance_tolerance_f(),
            draw_min_sample: default_draw_min_sample(),
            draw_advantage_margin: default_draw_advantage_margin(),
            low_draw_max: default_low_draw_max(),
        }
    }
}

/// Parallel compute / batched write configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Worker threads, 0 = available cores minus one
    #[serde(default)]
    pub workers: usize,
    /// Races per write transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Computed races buffered between workers and the writer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            batch_size: default_batch_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Resolve the worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    }
}

/// Ranking trainer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_race_type")]
    pub race_type: String,
    /// Share of races (latest first) held out for evaluation
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    /// Ceiling for relevance points
    #[serde(default = "default_label_ceiling")]
    pub label_ceiling: u32,
    #[serde(default = "default_model_dir")]
    pub model_dir: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_n_rounds")]
    pub n_rounds: usize,
    #[serde(default = "default_subsample")]
    pub subsample: f64,
    #[serde(default = "default_colsample")]
    pub colsample: f64,
    #[serde(default = "default_early_stopping_rounds")]
    pub early_stopping_rounds: usize,
    #[serde(default = "default_min_child_weight")]
    pub min_child_weight: f64,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_race_type() -> String {
    "Flat".to_string()
}

fn default_test_size() -> f64 {
    0.2
}

fn default_label_ceiling() -> u32 {
    31
}

fn default_model_dir() -> String {
    "data/models".to_string()
}

fn default_max_depth() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    0.03
}

fn default_n_rounds() -> usize {
    300
}

fn default_subsample() -> f64 {
    0.8
}

fn default_colsample() -> f64 {
    0.8
}

fn default_early_stopping_rounds() -> usize {
    20
}

fn default_min_child_weight() -> f64 {
    1.0
}

fn default_lambda() -> f64 {
    1.0
}

fn default_max_bins() -> usize {
    64
}

fn default_seed() -> u64 {
    42
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            race_type: default_race_type(),
            test_size: default_test_size(),
            label_ceiling: default_label_ceiling(),
            model_dir: default_model_dir(),
            max_depth: default_max_depth(),
            learning_rate: default_learning_rate(),
            n_rounds: default_n_rounds(),
            subsample: default_subsample(),
            colsample: default_colsample(),
            early_stopping_rounds: default_early_stopping_rounds(),
            min_child_weight: default_min_child_weight(),
            lambda: default_lambda(),
            max_bins: default_max_bins(),
            seed: default_seed(),
        }
    }
}

/// Fallback rating for one race class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDefault {
    pub class: String,
    pub value: f64,
}

/// Predictor configuration
///
/// The smart-default tables are tunable; the fallback order is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default = "default_confidence_high_gap")]
    pub confidence_high_gap: f64,
    #[serde(default = "default_confidence_medium_gap")]
    pub confidence_medium_gap: f64,
    #[serde(default = "default_top_features")]
    pub top_features: usize,
    #[serde(default = "default_strong_pick")]
    pub strong_pick_probability: f64,
    #[serde(default = "default_good_chance")]
    pub good_chance_probability: f64,
    /// Default racing-post rating by race class, searched in order
    #[serde(default = "default_rpr_by_class")]
    pub rpr_by_class: Vec<ClassDefault>,
    /// Default topspeed rating by race class, searched in order
    #[serde(default = "default_ts_by_class")]
    pub ts_by_class: Vec<ClassDefault>,
    #[serde(default = "default_global_rpr")]
    pub global_rpr: f64,
    #[serde(default = "default_global_ts")]
    pub global_ts: f64,
}

fn default_confidence_high_gap() -> f64 {
    0.15
}

fn default_confidence_medium_gap() -> f64 {
    0.08
}

fn default_top_features() -> usize {
    3
}

fn default_strong_pick() -> f64 {
    0.20
}

fn default_good_chance() -> f64 {
    0.12
}

/// Highest grade first, so an ambiguous partial match resolves upward.
fn class_table(values: [f64; 11]) -> Vec<ClassDefault> {
    const CLASSES: [&str; 11] = [
        "Group 1", "Group 2", "Group 3", "Listed", "Class 1", "Class 2", "Class 3", "Class 4",
        "Class 5", "Class 6", "Class 7",
    ];
    CLASSES
        .iter()
        .zip(values)
        .map(|(class, value)| ClassDefault {
            class: class.to_string(),
            value,
        })
        .collect()
}

fn default_rpr_by_class() -> Vec<ClassDefault> {
    class_table([
        115.0, 115.0, 110.0, 110.0, 105.0, 100.0, 95.0, 85.0, 75.0, 65.0, 65.0,
    ])
}

fn default_ts_by_class() -> Vec<ClassDefault> {
    class_table([
        90.0, 90.0, 85.0, 85.0, 80.0, 75.0, 70.0, 65.0, 60.0, 55.0, 55.0,
    ])
}

fn default_global_rpr() -> f64 {
    90.0
}

fn default_global_ts() -> f64 {
    70.0
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            confidence_high_gap: default_confidence_high_gap(),
            confidence_medium_gap: default_confidence_medium_gap(),
            top_features: default_top_features(),
            strong_pick_probability: default_strong_pick(),
            good_chance_probability: default_good_chance(),
            rpr_by_class: default_rpr_by_class(),
            ts_by_class: default_ts_by_class(),
            global_rpr: default_global_rpr(),
            global_ts: default_global_ts(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
}

impl AppConfig {
    /// Load configuration from defaults, an optional `racing` file and the
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // Add config file if exists
            .add_source(config::File::with_name("racing").required(false))
            // Override with environment variables (RACING__PIPELINE__BATCH_SIZE, etc.)
            .add_source(
                config::Environment::with_prefix("RACING")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
