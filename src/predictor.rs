//! Win probabilities for an unraced field.
//!
//! Rebuilds the training features for each runner, fills missing ability
//! ratings with smart defaults, scores the field with the trained ranker
//! and normalizes the scores into probabilities with a softmax.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{ClassDefault, PredictorConfig};
use crate::features::{FeatureEngine, FeatureVector};
use crate::ranking::ModelArtifacts;
use crate::storage::{RaceRepository, RawRace, RawRunner};

/// Race-level confidence in the top pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::High => "High",
            Confidence::Medium => "Medium",
            Confidence::Low => "Low",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a substituted rating came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DefaultSource {
    FieldMedian,
    FieldMean,
    ClassTable,
    Global,
}

/// One feature's share of a runner's score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureContribution {
    pub feature: String,
    pub value: f64,
    pub importance: f64,
    /// importance × value
    pub contribution: f64,
}

/// Prediction for one runner.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerPrediction {
    pub runner_id: String,
    pub horse_id: String,
    pub horse_name: Option<String>,
    pub number: Option<f64>,
    pub score: f64,
    pub win_probability: f64,
    /// 1 = most likely winner
    pub predicted_rank: u32,
    /// "Strong Pick" / "Good Chance"; informational only
    pub strength: Option<String>,
    pub top_features: Vec<FeatureContribution>,
    /// Ratings that were filled with smart defaults
    pub defaulted: Vec<String>,
}

/// Prediction for a whole field, runners in predicted order.
#[derive(Debug, Clone, Serialize)]
pub struct RacePrediction {
    pub race_id: String,
    pub date: NaiveDate,
    pub course: Option<String>,
    pub race_type: String,
    pub confidence: Confidence,
    pub runners: Vec<RunnerPrediction>,
}

/// Scores fields with one race type's artifact set.
pub struct Predictor {
    artifacts: ModelArtifacts,
    race_type: String,
    config: PredictorConfig,
}

impl Predictor {
    pub fn new(artifacts: ModelArtifacts, race_type: &str, config: PredictorConfig) -> Self {
        Self {
            artifacts,
            race_type: race_type.to_string(),
            config,
        }
    }

    /// Load the artifact set for `race_type` from `model_dir`.
    pub fn load(model_dir: &Path, race_type: &str, config: PredictorConfig) -> Result<Self> {
        let artifacts = ModelArtifacts::load(model_dir, race_type)
            .with_context(|| format!("Failed to load {} model from {}", race_type, model_dir.display()))?;
        info!(
            "Loaded {} ranker: {} trees over {} features",
            race_type,
            artifacts.model.trees.len(),
            artifacts.columns().len()
        );
        Ok(Self::new(artifacts, race_type, config))
    }

    /// Predict a race read from a store of upcoming races.
    ///
    /// History and statistics come from the engine's store, which is
    /// usually a different database.
    pub fn predict_stored(
        &self,
        upcoming: &RaceRepository,
        engine: &FeatureEngine<'_>,
        race_id: &str,
    ) -> Result<Option<RacePrediction>> {
        let race = match upcoming.get_race(race_id)? {
            Some(r) => r,
            None => {
                warn!("Race {} not found in the upcoming store", race_id);
                return Ok(None);
            }
        };
        let runners = upcoming.get_runners(race_id)?;
        self.predict_race(engine, &race, &runners)
    }

    /// Predict an unraced field.
    ///
    /// Returns `None` for an empty field or a race of another type.
    pub fn predict_race(
        &self,
        engine: &FeatureEngine<'_>,
        race: &RawRace,
        runners: &[RawRunner],
    ) -> Result<Option<RacePrediction>> {
        let matches_type = race
            .race_type
            .as_deref()
            .map_or(false, |t| t.trim().eq_ignore_ascii_case(self.race_type.trim()));
        if !matches_type {
            warn!(
                "Race {} has type {:?}, model is {}; skipping",
                race.race_id, race.race_type, self.race_type
            );
            return Ok(None);
        }
        if runners.is_empty() {
            warn!("Race {} has no runners, skipping", race.race_id);
            return Ok(None);
        }

        let (filled, defaulted) = self.fill_ratings(race, runners);
        let vectors = engine
            .race_vectors(race, &filled)
            .with_context(|| format!("Failed to build features for race {}", race.race_id))?;

        let scores: Vec<f64> = vectors.iter().map(|fv| self.score(fv)).collect();
        let probabilities = softmax(&scores);
        let ranks = predicted_ranks(&probabilities);

        let mut predictions: Vec<RunnerPrediction> = runners
            .iter()
            .enumerate()
            .map(|(i, runner)| RunnerPrediction {
                runner_id: runner.runner_id.clone(),
                horse_id: runner.horse_id.clone(),
                horse_name: runner.horse_name.clone(),
                number: runner.number,
                score: scores[i],
                win_probability: probabilities[i],
                predicted_rank: ranks[i],
                strength: self.strength(probabilities[i]).map(str::to_string),
                top_features: self.top_contributions(&vectors[i]),
                defaulted: defaulted[i].clone(),
            })
            .collect();
        predictions.sort_by_key(|p| p.predicted_rank);

        let confidence = confidence(
            &probabilities,
            self.config.confidence_high_gap,
            self.config.confidence_medium_gap,
        );
        info!(
            "Race {}: {} runners, top pick {} ({:.1}%), confidence {}",
            race.race_id,
            predictions.len(),
            predictions[0].runner_id,
            predictions[0].win_probability * 100.0,
            confidence
        );

        Ok(Some(RacePrediction {
            race_id: race.race_id.clone(),
            date: race.date,
            course: race.course.clone(),
            race_type: self.race_type.clone(),
            confidence,
            runners: predictions,
        }))
    }

    /// Raw ranking score in model column order.
    fn score(&self, fv: &FeatureVector) -> f64 {
        let model = &self.artifacts.model;
        let values: Vec<Option<f64>> = model.columns.iter().map(|c| fv.get(c)).collect();
        model.score(&model.impute(&values))
    }

    /// Copies of the runners with missing rpr and ts filled.
    ///
    /// Peer statistics use reported ratings only.
    fn fill_ratings(&self, race: &RawRace, runners: &[RawRunner]) -> (Vec<RawRunner>, Vec<Vec<String>>) {
        let class = race.race_class.as_deref();
        let rpr_peers: Vec<Option<f64>> = runners.iter().map(|r| r.rpr).collect();
        let ts_peers: Vec<Option<f64>> = runners.iter().map(|r| r.ts).collect();

        let mut filled = runners.to_vec();
        let mut defaulted = vec![Vec::new(); runners.len()];
        for (i, runner) in filled.iter_mut().enumerate() {
            if runner.rpr.is_none() {
                let (value, source) =
                    smart_default(&rpr_peers, class, &self.config.rpr_by_class, self.config.global_rpr);
                debug!("{}: rpr defaulted to {:.1} ({:?})", runner.runner_id, value, source);
                runner.rpr = Some(value);
                defaulted[i].push("rpr".to_string());
            }
            if runner.ts.is_none() {
                let (value, source) =
                    smart_default(&ts_peers, class, &self.config.ts_by_class, self.config.global_ts);
                debug!("{}: ts defaulted to {:.1} ({:?})", runner.runner_id, value, source);
                runner.ts = Some(value);
                defaulted[i].push("ts".to_string());
            }
        }
        (filled, defaulted)
    }

    fn top_contributions(&self, fv: &FeatureVector) -> Vec<FeatureContribution> {
        let mut contributions: Vec<FeatureContribution> = self
            .artifacts
            .importance
            .iter()
            .filter_map(|fi| {
                let value = fv.get(&fi.feature)?;
                if value == 0.0 || fi.importance == 0.0 {
                    return None;
                }
                Some(FeatureContribution {
                    feature: fi.feature.clone(),
                    value,
                    importance: fi.importance,
                    contribution: fi.importance * value,
                })
            })
            .collect();
        contributions.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
        contributions.truncate(self.config.top_features);
        contributions
    }

    fn strength(&self, probability: f64) -> Option<&'static str> {
        if probability > self.config.strong_pick_probability {
            Some("Strong Pick")
        } else if probability > self.config.good_chance_probability {
            Some("Good Chance")
        } else {
            None
        }
    }
}

/// Normalized exponential with the max subtracted first.
pub fn softmax(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let max_score = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&s| (s - max_score).exp()).collect();
    let exp_sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / exp_sum).collect()
}

/// 1-based ranks by descending probability, ties by input order.
pub fn predicted_ranks(probabilities: &[f64]) -> Vec<u32> {
    let mut idx: Vec<usize> = (0..probabilities.len()).collect();
    idx.sort_by(|&a, &b| probabilities[b].total_cmp(&probabilities[a]));
    let mut ranks = vec![0; probabilities.len()];
    for (rank, &i) in idx.iter().enumerate() {
        ranks[i] = rank as u32 + 1;
    }
    ranks
}

/// Fallback rating for a runner with none reported.
///
/// Order: field median (3+ peers), field mean (1+ peer), class table,
/// global constant.
pub fn smart_default(
    peers: &[Option<f64>],
    race_class: Option<&str>,
    by_class: &[ClassDefault],
    global: f64,
) -> (f64, DefaultSource) {
    let mut reported: Vec<f64> = peers.iter().flatten().copied().collect();
    if reported.len() >= 3 {
        reported.sort_by(f64::total_cmp);
        let mid = reported.len() / 2;
        let median = if reported.len() % 2 == 0 {
            (reported[mid - 1] + reported[mid]) / 2.0
        } else {
            reported[mid]
        };
        return (median, DefaultSource::FieldMedian);
    }
    if !reported.is_empty() {
        let mean = reported.iter().sum::<f64>() / reported.len() as f64;
        return (mean, DefaultSource::FieldMean);
    }
    if let Some(value) = race_class.and_then(|c| class_default(c, by_class)) {
        return (value, DefaultSource::ClassTable);
    }
    (global, DefaultSource::Global)
}

/// Exact class match first, then the first partial match in table
/// order, both case-insensitive.
fn class_default(race_class: &str, by_class: &[ClassDefault]) -> Option<f64> {
    let class = race_class.trim().to_lowercase();
    if class.is_empty() {
        return None;
    }
    by_class
        .iter()
        .find(|d| d.class.to_lowercase() == class)
        .or_else(|| {
            by_class.iter().find(|d| {
                let key = d.class.to_lowercase();
                class.contains(&key) || key.contains(&class)
            })
        })
        .map(|d| d.value)
}

/// Confidence from the gap between the two highest probabilities.
pub fn confidence(probabilities: &[f64], high_gap: f64, medium_gap: f64) -> Confidence {
    if probabilities.len() < 2 {
        return Confidence::Medium;
    }
    let mut sorted = probabilities.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let gap = sorted[0] - sorted[1];
    if gap > high_gap {
        Confidence::High
    } else if gap > medium_gap {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeaturesConfig, StatsConfig};
    use crate::ranking::{RankingModel, Tree, TreeNode};
    use crate::stats::StatsAggregator;

    fn race(race_type: &str) -> RawRace {
        RawRace {
            race_id: "up_1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            course: Some("York".to_string()),
            course_id: None,
            distance_f: Some(8.0),
            going: Some("Good".to_string()),
            surface: Some("Turf".to_string()),
            race_type: Some(race_type.to_string()),
            race_class: Some("Class 4".to_string()),
            prize: None,
            age_band: None,
            pattern: None,
            region: None,
        }
    }

    fn runner(name: &str, rpr: Option<f64>) -> RawRunner {
        RawRunner {
            runner_id: format!("up_1_{name}"),
            race_id: "up_1".to_string(),
            horse_id: name.to_string(),
            horse_name: Some(name.to_uppercase()),
            trainer_id: None,
            jockey_id: None,
            number: None,
            draw: None,
            age: None,
            weight_lbs: None,
            ofr: None,
            rpr,
            ts: Some(60.0),
            headgear: None,
            form: None,
            last_run: None,
        }
    }

    /// Scores 0 / 1 / 2 for rpr up to 70, up to 90, above 90.
    fn rpr_model() -> ModelArtifacts {
        let model = RankingModel {
            columns: vec!["rpr".to_string()],
            medians: vec![90.0],
            trees: vec![Tree {
                nodes: vec![
                    TreeNode::Split {
                        feature: 0,
                        threshold: 70.0,
                        left: 1,
                        right: 2,
                    },
                    TreeNode::Leaf(0.0),
                    TreeNode::Split {
                        feature: 0,
                        threshold: 90.0,
                        left: 3,
                        right: 4,
                    },
                    TreeNode::Leaf(1.0),
                    TreeNode::Leaf(2.0),
                ],
            }],
            best_iteration: 0,
        };
        ModelArtifacts::new(model, &[5.0])
    }

    #[test]
    fn test_softmax() {
        let p = softmax(&[2.0, 1.0, 0.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[0] > p[1] && p[1] > p[2]);

        // Large scores do not overflow
        let p = softmax(&[1000.0, 999.0]);
        assert!(p.iter().all(|x| x.is_finite() && *x > 0.0));
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn test_predicted_ranks_ties_by_input_order() {
        assert_eq!(predicted_ranks(&[0.2, 0.4, 0.2, 0.2]), vec![2, 1, 3, 4]);
    }

    #[test]
    fn test_smart_default_order() {
        let table = PredictorConfig::default().rpr_by_class;

        let (v, s) = smart_default(&[Some(100.0), Some(80.0), Some(60.0), None], None, &table, 90.0);
        assert_eq!((v, s), (80.0, DefaultSource::FieldMedian));

        let (v, s) = smart_default(&[Some(100.0), Some(80.0), None], None, &table, 90.0);
        assert_eq!((v, s), (90.0, DefaultSource::FieldMean));

        let (v, s) = smart_default(&[None, None], Some("class 4"), &table, 90.0);
        assert_eq!((v, s), (85.0, DefaultSource::ClassTable));

        let (v, s) = smart_default(&[None], Some("Class 5 Handicap"), &table, 90.0);
        assert_eq!((v, s), (75.0, DefaultSource::ClassTable));

        let (v, s) = smart_default(&[None], Some("Maiden"), &table, 90.0);
        assert_eq!((v, s), (90.0, DefaultSource::Global));
    }

    #[test]
    fn test_ambiguous_class_takes_first_listed() {
        let table = PredictorConfig::default().rpr_by_class;
        // "1" is part of both "Group 1" and "Class 1"
        let (v, s) = smart_default(&[None], Some("1"), &table, 90.0);
        assert_eq!((v, s), (115.0, DefaultSource::ClassTable));

        let ts = PredictorConfig::default().ts_by_class;
        assert_eq!(smart_default(&[None], Some("1"), &ts, 70.0).0, 90.0);
        assert_eq!(smart_default(&[None], Some("Class 1"), &ts, 70.0).0, 80.0);
    }

    #[test]
    fn test_confidence() {
        assert_eq!(confidence(&[0.5, 0.3, 0.2], 0.15, 0.08), Confidence::High);
        assert_eq!(confidence(&[0.4, 0.3, 0.3], 0.15, 0.08), Confidence::Medium);
        assert_eq!(confidence(&[0.35, 0.33, 0.32], 0.15, 0.08), Confidence::Low);
        assert_eq!(confidence(&[1.0], 0.15, 0.08), Confidence::Medium);
    }

    #[test]
    fn test_predict_race_orders_by_rating() {
        let repo = RaceRepository::in_memory().unwrap();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());
        let predictor = Predictor::new(rpr_model(), "Flat", PredictorConfig::default());

        let runners = vec![
            runner("c", Some(60.0)),
            runner("a", Some(100.0)),
            runner("b", Some(80.0)),
        ];
        let prediction = predictor
            .predict_race(&engine, &race("flat"), &runners)
            .unwrap()
            .unwrap();

        let order: Vec<&str> = prediction.runners.iter().map(|r| r.horse_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        let total: f64 = prediction.runners.iter().map(|r| r.win_probability).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(prediction.runners.iter().all(|r| r.win_probability > 0.0));

        let top = &prediction.runners[0];
        assert_eq!(top.predicted_rank, 1);
        assert_eq!(top.strength.as_deref(), Some("Strong Pick"));
        assert_eq!(top.top_features[0].feature, "rpr");
        assert_eq!(top.top_features[0].contribution, 500.0);
    }

    #[test]
    fn test_missing_rating_uses_field_mean() {
        let repo = RaceRepository::in_memory().unwrap();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());
        let predictor = Predictor::new(rpr_model(), "Flat", PredictorConfig::default());

        let runners = vec![runner("a", Some(100.0)), runner("b", Some(60.0)), runner("x", None)];
        let prediction = predictor
            .predict_race(&engine, &race("Flat"), &runners)
            .unwrap()
            .unwrap();

        let x = prediction.runners.iter().find(|r| r.horse_id == "x").unwrap();
        assert_eq!(x.defaulted, vec!["rpr".to_string()]);
        // Mean of 100 and 60 lands in the middle band
        assert_eq!(x.score, 1.0);
        assert_eq!(x.predicted_rank, 2);
    }

    #[test]
    fn test_other_race_type_is_skipped() {
        let repo = RaceRepository::in_memory().unwrap();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());
        let predictor = Predictor::new(rpr_model(), "Flat", PredictorConfig::default());

        let runners = vec![runner("a", Some(100.0))];
        assert!(predictor
            .predict_race(&engine, &race("Hurdle"), &runners)
            .unwrap()
            .is_none());
        assert!(predictor.predict_race(&engine, &race("Flat"), &[]).unwrap().is_none());
    }
}
