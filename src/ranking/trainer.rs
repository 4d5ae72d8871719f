//! Ranking trainer: split, label, boost, evaluate, persist.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::artifact::{ArtifactPaths, FeatureImportance, ModelArtifacts};
use super::dataset::{column_medians, temporal_split, RankingDataset};
use super::gbdt::{self, GbdtParams, RankingModel};
use super::metrics::{evaluate, top_pick_positions, RankingMetrics};
use crate::config::TrainerConfig;
use crate::error::RankError;
use crate::storage::{FeatureTable, RaceRepository};

/// Summary of one training run.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub race_type: String,
    pub train_races: usize,
    pub train_rows: usize,
    pub eval_races: usize,
    pub eval_rows: usize,
    pub n_features: usize,
    pub n_trees: usize,
    pub best_iteration: usize,
    pub metrics: RankingMetrics,
    /// Finishing position of the top-scored runner, eval races
    pub top_pick_positions: BTreeMap<u32, usize>,
    pub top_features: Vec<FeatureImportance>,
    pub model_dir: PathBuf,
}

/// Trains one ranker per race type.
pub struct RankingTrainer {
    config: TrainerConfig,
}

impl RankingTrainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    /// Train from the stored feature and target tables and write the
    /// artifact set.
    pub fn train(&self, repo: &RaceRepository) -> Result<TrainingReport> {
        let race_type = self.config.race_type.clone();
        info!("Loading training data for race type {}", race_type);
        let table = repo
            .load_feature_table(&race_type)
            .context("Failed to load feature table")?;

        let (artifacts, report) = self.fit(table)?;
        let dir = Path::new(&self.config.model_dir);
        let paths: ArtifactPaths = artifacts
            .save(dir, &race_type)
            .with_context(|| format!("Failed to write artifacts to {}", dir.display()))?;
        info!("Model saved to {}", paths.ranker.display());

        Ok(report)
    }

    /// Fit a model without touching the filesystem.
    pub fn fit(&self, table: FeatureTable) -> Result<(ModelArtifacts, TrainingReport)> {
        if table.rows.is_empty() {
            return Err(RankError::EmptyDataset(format!(
                "no labelled rows for race type {}",
                self.config.race_type
            ))
            .into());
        }
        let n_cols = table.columns.len();
        info!("{} rows, {} feature columns", table.rows.len(), n_cols);

        let (train_rows, eval_rows) = temporal_split(table.rows, self.config.test_size)?;
        let medians = column_medians(&train_rows, n_cols);

        let train_set = RankingDataset::from_rows(&train_rows, &medians, self.config.label_ceiling);
        let eval_set = RankingDataset::from_rows(&eval_rows, &medians, self.config.label_ceiling);
        info!(
            "Train: {} races / {} rows, eval: {} races / {} rows",
            train_set.groups.len(),
            train_set.n_rows(),
            eval_set.groups.len(),
            eval_set.n_rows()
        );

        let params = GbdtParams::from(&self.config);
        let booster = gbdt::train(&train_set, Some(&eval_set), &params);
        if booster.trees.iter().all(|t| t.nodes.len() == 1) {
            warn!("No tree found a useful split; scores will be constant");
        }

        let model = RankingModel {
            columns: table.columns,
            medians,
            trees: booster.trees,
            best_iteration: booster.best_iteration,
        };

        let scores = model.score_dataset(&eval_set);
        let metrics = evaluate(&eval_set.groups, &scores, &eval_set.labels, &eval_set.positions);
        let picks = top_pick_positions(&eval_set.groups, &scores, &eval_set.positions);

        info!(
            "NDCG@1 {:.4}  NDCG@3 {:.4}  NDCG@5 {:.4}",
            metrics.ndcg_at_1, metrics.ndcg_at_3, metrics.ndcg_at_5
        );
        info!(
            "Top pick win rate {:.1}%  top-3 hit rate {:.1}%  MRR {:.4}  Spearman {:.4}",
            metrics.top_pick_win_rate * 100.0,
            metrics.top_3_hit_rate * 100.0,
            metrics.mrr,
            metrics.spearman
        );
        for (position, count) in &picks {
            info!("  Top pick finished {}: {} races", position, count);
        }

        let artifacts = ModelArtifacts::new(model, &booster.importance);
        let report = TrainingReport {
            race_type: self.config.race_type.clone(),
            train_races: train_set.groups.len(),
            train_rows: train_set.n_rows(),
            eval_races: eval_set.groups.len(),
            eval_rows: eval_set.n_rows(),
            n_features: n_cols,
            n_trees: artifacts.model.trees.len(),
            best_iteration: artifacts.model.best_iteration,
            metrics,
            top_pick_positions: picks,
            top_features: artifacts.importance.iter().take(10).cloned().collect(),
            model_dir: PathBuf::from(&self.config.model_dir),
        };

        Ok((artifacts, report))
    }
}
