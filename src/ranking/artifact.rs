//! Model artifact set, namespaced by race type.
//!
//! - `ranker_<type>.json`: the serialized ensemble
//! - `feature_columns_<type>.json`: ordered column names
//! - `feature_importance_<type>.json`: gain per column, highest first

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::gbdt::RankingModel;
use crate::error::{RankError, Result};

/// Importance of one feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// File locations for one race type.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub ranker: PathBuf,
    pub columns: PathBuf,
    pub importance: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, race_type: &str) -> Self {
        let key = race_type.trim().to_lowercase().replace(' ', "_");
        Self {
            ranker: dir.join(format!("ranker_{key}.json")),
            columns: dir.join(format!("feature_columns_{key}.json")),
            importance: dir.join(format!("feature_importance_{key}.json")),
        }
    }
}

/// A complete, immutable artifact set.
#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub model: RankingModel,
    pub importance: Vec<FeatureImportance>,
}

impl ModelArtifacts {
    /// Build from per-column gains in model column order.
    pub fn new(model: RankingModel, gains: &[f64]) -> Self {
        let mut importance: Vec<FeatureImportance> = model
            .columns
            .iter()
            .zip(gains)
            .map(|(feature, &importance)| FeatureImportance {
                feature: feature.clone(),
                importance,
            })
            .collect();
        importance.sort_by(|a, b| b.importance.total_cmp(&a.importance));
        Self { model, importance }
    }

    pub fn columns(&self) -> &[String] {
        &self.model.columns
    }

    /// Write all three files.
    ///
    /// Everything is staged as `.tmp` first and renamed only once every
    /// file has been written. The columns file is renamed last; `load`
    /// refuses a ranker whose columns disagree with it.
    pub fn save(&self, dir: &Path, race_type: &str) -> Result<ArtifactPaths> {
        fs::create_dir_all(dir)?;
        let paths = ArtifactPaths::new(dir, race_type);

        let staged = [
            (&paths.ranker, serde_json::to_vec(&self.model)?),
            (&paths.importance, serde_json::to_vec_pretty(&self.importance)?),
            (&paths.columns, serde_json::to_vec_pretty(&self.model.columns)?),
        ];

        let mut tmp_paths = Vec::with_capacity(staged.len());
        for (path, bytes) in &staged {
            let tmp = tmp_path(path);
            if let Err(e) = fs::write(&tmp, bytes) {
                for t in &tmp_paths {
                    let _ = fs::remove_file(t);
                }
                return Err(e.into());
            }
            tmp_paths.push(tmp);
        }
        for ((path, _), tmp) in staged.iter().zip(&tmp_paths) {
            fs::rename(tmp, path)?;
        }
        Ok(paths)
    }

    /// Load the set for a race type.
    pub fn load(dir: &Path, race_type: &str) -> Result<Self> {
        let paths = ArtifactPaths::new(dir, race_type);
        for path in [&paths.ranker, &paths.columns, &paths.importance] {
            if !path.exists() {
                return Err(RankError::ModelNotFound(path.clone()));
            }
        }

        let model: RankingModel = serde_json::from_slice(&fs::read(&paths.ranker)?)?;
        let columns: Vec<String> = serde_json::from_slice(&fs::read(&paths.columns)?)?;
        let importance: Vec<FeatureImportance> =
            serde_json::from_slice(&fs::read(&paths.importance)?)?;

        if columns != model.columns {
            return Err(RankError::Artifact(format!(
                "{} does not match the columns stored in {}",
                paths.columns.display(),
                paths.ranker.display()
            )));
        }
        if let Some(fi) = importance.iter().find(|fi| !model.columns.contains(&fi.feature)) {
            return Err(RankError::Artifact(format!(
                "{} names column `{}` unknown to {}",
                paths.importance.display(),
                fi.feature,
                paths.ranker.display()
            )));
        }
        if model.medians.len() != model.columns.len() {
            return Err(RankError::Artifact(format!(
                "{} has {} medians for {} columns",
                paths.ranker.display(),
                model.medians.len(),
                model.columns.len()
            )));
        }

        Ok(Self { model, importance })
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
