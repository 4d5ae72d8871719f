//! CLI commands for racing-rank.
//!
//! Thin operator wrappers over the library: dataset status, statistics
//! recompute, feature computation, training and prediction.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::features::FeatureEngine;
use crate::pipeline::{self, RunOptions};
use crate::predictor::{Predictor, RacePrediction};
use crate::ranking::{RankingTrainer, TrainingReport};
use crate::stats::StatsAggregator;
use crate::storage::RaceRepository;

#[derive(Parser)]
#[command(name = "racing-rank")]
#[command(version, about = "Racing-rank: leakage-safe features and race ranking", long_about = None)]
pub struct Cli {
    /// Record store path override
    #[arg(long, global = true, env = "RACING_DB")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show row counts, date range and feature completeness
    Status,

    /// Recompute entity and pair statistics as of a date
    Stats {
        /// Cutoff date (YYYY-MM-DD); only earlier results count
        #[arg(long)]
        as_of: String,
    },

    /// Compute feature and target rows for settled races
    Features {
        /// Stop after this many races
        #[arg(short, long)]
        limit: Option<usize>,

        /// Worker threads (default: cores minus one)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Only races without feature rows
        #[arg(long)]
        only_missing: bool,
    },

    /// Train the ranker for one race type
    Train {
        /// Race type, e.g. Flat, Hurdle, Chase
        #[arg(short, long)]
        race_type: Option<String>,

        /// Share of the latest races held out for evaluation
        #[arg(short, long)]
        test_size: Option<f64>,

        /// Artifact directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Predict an upcoming race
    Predict {
        /// Race id in the upcoming store
        #[arg(value_name = "RACE_ID")]
        race_id: String,

        /// Store holding the upcoming race (default: the record store)
        #[arg(long)]
        db: Option<PathBuf>,

        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// Print the dataset report.
pub async fn run_status(config: &AppConfig) -> Result<()> {
    let repo = RaceRepository::open_read_only(Path::new(&config.database.path))?;
    let report = repo.dataset_report()?;

    println!("Store: {}", config.database.path);
    println!();
    println!("=== Rows ===");
    println!("  {:<16} {:>10}", "races", report.races);
    println!("  {:<16} {:>10}", "runners", report.runners);
    println!("  {:<16} {:>10}", "results", report.results);
    println!("  {:<16} {:>10}", "entity stats", report.entity_stats);
    println!("  {:<16} {:>10}", "combo stats", report.combo_stats);
    println!("  {:<16} {:>10}", "feature rows", report.feature_rows);
    println!("  {:<16} {:>10}", "target rows", report.target_rows);
    println!("  {:<16} {:>10}", "featured races", report.featured_races);
    println!();
    println!(
        "Dates: {} to {}",
        report.first_date.as_deref().unwrap_or("-"),
        report.last_date.as_deref().unwrap_or("-")
    );
    println!();
    println!("=== Feature completeness ===");
    for (column, share) in &report.completeness {
        println!("  {:<28} {:>6.1}%", column, share * 100.0);
    }
    Ok(())
}

/// Recompute statistics snapshots.
pub async fn run_stats(config: &AppConfig, as_of: &str) -> Result<()> {
    let as_of = NaiveDate::parse_from_str(as_of, "%Y-%m-%d")
        .with_context(|| format!("Invalid --as-of date: {}", as_of))?;
    let repo = RaceRepository::new(Path::new(&config.database.path))?;
    let aggregator = StatsAggregator::new(&repo, &config.stats);
    let summary = aggregator.recompute(as_of)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Run the parallel feature coordinator.
pub async fn run_features(
    config: &AppConfig,
    limit: Option<usize>,
    workers: Option<usize>,
    only_missing: bool,
) -> Result<()> {
    let options = RunOptions {
        limit,
        workers,
        only_missing,
    };
    let summary = pipeline::run_features(Path::new(&config.database.path), config, options).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failed > 0 {
        eprintln!("{} races failed; see the log for details", summary.failed);
    }
    Ok(())
}

/// Train and save the ranker.
pub async fn run_train(
    config: &AppConfig,
    race_type: Option<String>,
    test_size: Option<f64>,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let mut trainer_config = config.trainer.clone();
    if let Some(t) = race_type {
        trainer_config.race_type = t;
    }
    if let Some(s) = test_size {
        if s <= 0.0 || s >= 1.0 {
            bail!("--test-size must be between 0 and 1, got {}", s);
        }
        trainer_config.test_size = s;
    }
    if let Some(dir) = output_dir {
        trainer_config.model_dir = dir.to_string_lossy().to_string();
    }

    let repo = RaceRepository::open_read_only(Path::new(&config.database.path))?;
    let report = RankingTrainer::new(trainer_config).train(&repo)?;
    print_training_report(&report);
    Ok(())
}

fn print_training_report(report: &TrainingReport) {
    println!("Race type: {}", report.race_type);
    println!(
        "Train: {} races ({} rows)  Eval: {} races ({} rows)",
        report.train_races, report.train_rows, report.eval_races, report.eval_rows
    );
    println!(
        "Features: {}  Trees: {} (best iteration {})",
        report.n_features, report.n_trees, report.best_iteration
    );
    println!();

    let m = &report.metrics;
    println!("=== Evaluation ===");
    println!("  NDCG@1            {:.4}", m.ndcg_at_1);
    println!("  NDCG@3            {:.4}", m.ndcg_at_3);
    println!("  NDCG@5            {:.4}", m.ndcg_at_5);
    println!("  Top pick win rate {:.2}%", m.top_pick_win_rate * 100.0);
    println!("  Top 3 hit rate    {:.2}%", m.top_3_hit_rate * 100.0);
    println!("  MRR               {:.4}", m.mrr);
    println!("  Spearman          {:.4}", m.spearman);
    println!();

    println!("=== Top pick finishing position ===");
    for (position, count) in &report.top_pick_positions {
        println!("  {:>3}: {}", position, count);
    }
    println!();

    println!("=== Top features ===");
    for fi in &report.top_features {
        println!("  {:<32} {:>12.2}", fi.feature, fi.importance);
    }
    println!();
    println!("Artifacts written to {}", report.model_dir.display());
}

/// Predict one upcoming race.
pub async fn run_predict(
    config: &AppConfig,
    race_id: &str,
    db: Option<PathBuf>,
    format: &str,
) -> Result<()> {
    let history = RaceRepository::open_read_only(Path::new(&config.database.path))?;
    let upcoming_path = db.unwrap_or_else(|| PathBuf::from(&config.database.path));
    let upcoming = RaceRepository::open_read_only(&upcoming_path)?;

    let race = upcoming
        .get_race(race_id)?
        .with_context(|| format!("Race {} not found in {}", race_id, upcoming_path.display()))?;
    let race_type = match race.race_type.as_deref() {
        Some(t) => t.to_string(),
        None => bail!("Race {} has no race type", race_id),
    };

    let predictor = Predictor::load(
        Path::new(&config.trainer.model_dir),
        &race_type,
        config.predictor.clone(),
    )?;
    let aggregator = StatsAggregator::new(&history, &config.stats);
    let engine = FeatureEngine::new(&history, &aggregator, &config.features, &config.stats);

    let prediction = match predictor.predict_stored(&upcoming, &engine, race_id)? {
        Some(p) => p,
        None => bail!("Race {} could not be predicted", race_id),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&prediction)?),
        "table" => print_prediction(&prediction),
        _ => {
            eprintln!("Unknown format: {}. Using JSON.", format);
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
    }
    Ok(())
}

fn print_prediction(prediction: &RacePrediction) {
    println!(
        "Race: {} ({}, {})",
        prediction.race_id,
        prediction.course.as_deref().unwrap_or("-"),
        prediction.date
    );
    println!("Type: {}  Confidence: {}", prediction.race_type, prediction.confidence);
    println!();
    println!("=== Win Probabilities ===");
    for runner in &prediction.runners {
        let name = runner.horse_name.as_deref().unwrap_or(&runner.horse_id);
        let drivers: Vec<String> = runner
            .top_features
            .iter()
            .map(|c| format!("{} {:+.2}", c.feature, c.contribution))
            .collect();
        println!(
            "  {:>2}. {:<24} {:>6.2}%  {:<12} {}",
            runner.predicted_rank,
            name,
            runner.win_probability * 100.0,
            runner.strength.as_deref().unwrap_or(""),
            drivers.join(", ")
        );
        if !runner.defaulted.is_empty() {
            println!("      defaulted: {}", runner.defaulted.join(", "));
        }
    }
}
