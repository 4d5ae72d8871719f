//! Parallel feature computation feeding one batched writer.
//!
//! Workers run on a rayon pool, each with its own read-only connection,
//! and send plain outcomes through a bounded channel. A single blocking
//! writer task owns the only write connection and commits every
//! `batch_size` races in one transaction.

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::features::{FeatureEngine, RaceFeatures};
use crate::stats::StatsAggregator;
use crate::storage::RaceRepository;

/// Options for one coordinator run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after this many races
    pub limit: Option<usize>,
    /// Override the configured worker count
    pub workers: Option<usize>,
    /// Skip races that already have feature rows
    pub only_missing: bool,
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub seen: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub runners: usize,
    pub targets: usize,
    pub batches: usize,
}

/// What a worker produced for one race.
#[derive(Debug)]
pub enum RaceOutcome {
    Computed(RaceFeatures),
    Skipped(String),
    Failed { race_id: String, error: String },
}

/// Compute and store features for every settled race that needs them.
pub async fn run_features(db_path: &Path, config: &AppConfig, options: RunOptions) -> Result<RunSummary> {
    let writer = RaceRepository::new(db_path).context("Failed to open writer connection")?;
    let race_ids = writer.races_needing_features(options.only_missing, options.limit)?;
    if race_ids.is_empty() {
        info!("No races need features");
        return Ok(RunSummary::default());
    }

    let workers = options
        .workers
        .filter(|&w| w > 0)
        .unwrap_or_else(|| config.pipeline.worker_count());
    let batch_size = config.pipeline.batch_size.max(1);
    let total = race_ids.len();
    info!(
        "Computing features for {} races with {} workers, batches of {}",
        total, workers, batch_size
    );

    let (tx, rx) = mpsc::channel(config.pipeline.channel_capacity.max(1));

    let producer = {
        let db_path = db_path.to_path_buf();
        let config = config.clone();
        tokio::task::spawn_blocking(move || compute_all(db_path, race_ids, workers, &config, tx))
    };
    let writer_task = tokio::task::spawn_blocking(move || write_all(writer, rx, batch_size, total));

    let produced = producer.await.context("Worker pool panicked")?;
    let summary = writer_task.await.context("Writer task panicked")??;
    produced?;

    info!(
        "Features done: {} written, {} skipped, {} failed ({} runners, {} targets, {} batches)",
        summary.written, summary.skipped, summary.failed, summary.runners, summary.targets, summary.batches
    );
    Ok(summary)
}

fn compute_all(
    db_path: PathBuf,
    race_ids: Vec<String>,
    workers: usize,
    config: &AppConfig,
    tx: mpsc::Sender<RaceOutcome>,
) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("features-{i}"))
        .build()
        .context("Failed to build worker pool")?;

    pool.install(|| {
        race_ids.par_iter().for_each_init(
            || RaceRepository::open_read_only(&db_path),
            |repo, race_id| {
                let outcome = match repo {
                    Ok(repo) => compute_race(repo, race_id, config),
                    Err(e) => RaceOutcome::Failed {
                        race_id: race_id.clone(),
                        error: format!("{e:#}"),
                    },
                };
                // A closed channel means the writer already failed
                if tx.blocking_send(outcome).is_err() {
                    debug!("Writer gone, dropping race {}", race_id);
                }
            },
        )
    });
    Ok(())
}

/// Compute one race, containing errors and panics to that race.
pub fn compute_race(repo: &RaceRepository, race_id: &str, config: &AppConfig) -> RaceOutcome {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let stats = StatsAggregator::new(repo, &config.stats);
        let engine = FeatureEngine::new(repo, &stats, &config.features, &config.stats);
        engine.build_race(race_id)
    }));

    match result {
        Ok(Ok(Some(features))) => RaceOutcome::Computed(features),
        Ok(Ok(None)) => RaceOutcome::Skipped(race_id.to_string()),
        Ok(Err(e)) => {
            warn!("Race {} failed: {:#}", race_id, e);
            RaceOutcome::Failed {
                race_id: race_id.to_string(),
                error: format!("{e:#}"),
            }
        }
        Err(payload) => {
            let error = panic_message(payload.as_ref());
            warn!("Race {} panicked: {}", race_id, error);
            RaceOutcome::Failed {
                race_id: race_id.to_string(),
                error,
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn write_all(
    repo: RaceRepository,
    mut rx: mpsc::Receiver<RaceOutcome>,
    batch_size: usize,
    total: usize,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(outcome) = rx.blocking_recv() {
        summary.seen += 1;
        match outcome {
            RaceOutcome::Computed(features) => {
                batch.push(features);
                if batch.len() >= batch_size {
                    flush(&repo, &mut batch, &mut summary)?;
                    info!("Batch {}: {}/{} races seen", summary.batches, summary.seen, total);
                }
            }
            RaceOutcome::Skipped(race_id) => {
                debug!("Skipped race {}", race_id);
                summary.skipped += 1;
            }
            RaceOutcome::Failed { race_id, error } => {
                debug!("Failed race {}: {}", race_id, error);
                summary.failed += 1;
            }
        }
    }
    flush(&repo, &mut batch, &mut summary)?;
    Ok(summary)
}

fn flush(repo: &RaceRepository, batch: &mut Vec<RaceFeatures>, summary: &mut RunSummary) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let counts = repo
        .replace_race_batch(batch)
        .context("Failed to commit feature batch")?;
    summary.written += counts.races;
    summary.runners += counts.runners;
    summary.targets += counts.targets;
    summary.batches += 1;
    batch.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::storage::{RawRace, RawResult, RawRunner};
    use chrono::NaiveDate;

    fn race(race_id: &str, day: u32) -> RawRace {
        RawRace {
            race_id: race_id.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            course: Some("Chester".to_string()),
            course_id: None,
            distance_f: Some(5.0),
            going: Some("Soft".to_string()),
            surface: Some("Turf".to_string()),
            race_type: Some("Flat".to_string()),
            race_class: Some("Class 5".to_string()),
            prize: None,
            age_band: None,
            pattern: None,
            region: None,
        }
    }

    fn runner(race_id: &str, horse: &str, draw: f64) -> RawRunner {
        RawRunner {
            runner_id: format!("{race_id}_{horse}"),
            race_id: race_id.to_string(),
            horse_id: horse.to_string(),
            horse_name: None,
            trainer_id: Some("t1".to_string()),
            jockey_id: Some("j1".to_string()),
            number: None,
            draw: Some(draw),
            age: Some(3.0),
            weight_lbs: Some(126.0),
            ofr: None,
            rpr: Some(70.0 + draw),
            ts: None,
            headgear: None,
            form: Some("21".to_string()),
            last_run: None,
        }
    }

    fn result(race_id: &str, horse: &str, position: u32) -> RawResult {
        RawResult {
            race_id: race_id.to_string(),
            horse_id: horse.to_string(),
            trainer_id: Some("t1".to_string()),
            jockey_id: Some("j1".to_string()),
            position: Some(position),
            beaten_lengths: None,
            time: None,
            sp_dec: Some(4.0),
            prize: None,
            tsr: Some(50.0),
            comment: None,
        }
    }

    fn seed(path: &Path) {
        let repo = RaceRepository::new(path).unwrap();
        for day in 1..=4 {
            let id = format!("r{day}");
            repo.insert_race(&race(&id, day)).unwrap();
            for (i, horse) in ["a", "b", "c"].iter().enumerate() {
                repo.insert_runner(&runner(&id, horse, i as f64 + 1.0)).unwrap();
                repo.insert_result(&result(&id, horse, i as u32 + 1)).unwrap();
            }
        }
        // Results but no runners
        repo.insert_race(&race("ghost", 5)).unwrap();
        repo.insert_result(&result("ghost", "z", 1)).unwrap();
    }

    fn config() -> AppConfig {
        AppConfig {
            pipeline: PipelineConfig {
                workers: 2,
                batch_size: 3,
                channel_capacity: 2,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_twice_replaces_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("racing.db");
        seed(&path);

        let first = run_features(&path, &config(), RunOptions::default()).await.unwrap();
        assert_eq!(first.seen, 5);
        assert_eq!(first.written, 4);
        assert_eq!(first.skipped, 1);
        assert_eq!(first.failed, 0);
        assert_eq!(first.runners, 12);
        assert_eq!(first.targets, 12);
        assert_eq!(first.batches, 2);

        let second = run_features(&path, &config(), RunOptions::default()).await.unwrap();
        assert_eq!(second.written, 4);

        let repo = RaceRepository::open_read_only(&path).unwrap();
        assert_eq!(repo.feature_row_count().unwrap(), 12);
    }

    #[tokio::test]
    async fn test_only_missing_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("racing.db");
        seed(&path);

        let options = RunOptions {
            limit: Some(2),
            ..Default::default()
        };
        let first = run_features(&path, &config(), options).await.unwrap();
        assert_eq!(first.written, 2);

        let options = RunOptions {
            only_missing: true,
            workers: Some(1),
            ..Default::default()
        };
        let rest = run_features(&path, &config(), options).await.unwrap();
        // r3, r4 and the runnerless race
        assert_eq!(rest.seen, 3);
        assert_eq!(rest.written, 2);
    }

    /// A settled race whose only runner row has no id and cannot be read.
    fn add_unreadable_race(path: &Path) {
        let repo = RaceRepository::new(path).unwrap();
        repo.insert_race(&race("broken", 6)).unwrap();
        repo.insert_result(&result("broken", "a", 1)).unwrap();
        drop(repo);
        rusqlite::Connection::open(path)
            .unwrap()
            .execute(
                "INSERT INTO runners (runner_id, race_id, horse_id) VALUES (NULL, 'broken', 'a')",
                [],
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_race_does_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("racing.db");
        seed(&path);
        add_unreadable_race(&path);

        let summary = run_features(&path, &config(), RunOptions::default()).await.unwrap();
        assert_eq!(summary.seen, 6);
        assert_eq!(summary.written, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.runners, 12);

        let repo = RaceRepository::open_read_only(&path).unwrap();
        assert!(repo.load_race_features("broken").unwrap().is_empty());
        for id in ["r1", "r2", "r3", "r4"] {
            assert_eq!(repo.load_race_features(id).unwrap().len(), 3, "race {id}");
        }
    }

    #[test]
    fn test_compute_race_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("racing.db");
        seed(&path);
        add_unreadable_race(&path);

        let repo = RaceRepository::open_read_only(&path).unwrap();
        match compute_race(&repo, "broken", &AppConfig::default()) {
            RaceOutcome::Failed { race_id, error } => {
                assert_eq!(race_id, "broken");
                assert!(!error.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("bad field")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "bad field");
        let payload = panic::catch_unwind(|| panic!("race {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "race 7");
    }

    #[test]
    fn test_compute_race_outcomes() {
        let repo = RaceRepository::in_memory().unwrap();
        repo.insert_race(&race("r1", 1)).unwrap();
        repo.insert_runner(&runner("r1", "a", 1.0)).unwrap();

        match compute_race(&repo, "r1", &AppConfig::default()) {
            RaceOutcome::Computed(features) => assert_eq!(features.runners.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            compute_race(&repo, "missing", &AppConfig::default()),
            RaceOutcome::Skipped(_)
        ));
    }
}
