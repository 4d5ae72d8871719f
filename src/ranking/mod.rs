//! Pairwise learning-to-rank over race groups.
//!
//! Rows are grouped by race and labelled with relevance points derived
//! from finishing position. The ensemble is trained in-crate and stored
//! as JSON next to its column list and feature importance.

pub mod artifact;
pub mod dataset;
pub mod gbdt;
pub mod metrics;
pub mod trainer;

pub use artifact::{ArtifactPaths, FeatureImportance, ModelArtifacts};
pub use dataset::{relevance_points, temporal_split, RankingDataset};
pub use gbdt::{RankingModel, Tree, TreeNode};
pub use metrics::RankingMetrics;
pub use trainer::{RankingTrainer, TrainingReport};
