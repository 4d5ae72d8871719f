//! Synthetic record stores shared by the integration tests.

#![allow(dead_code)]

use chrono::{Duration, NaiveDate};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use racing_rank::storage::{RaceRepository, RawRace, RawResult, RawRunner};

/// A store in its own temporary directory.
pub struct Fixture {
    _dir: TempDir,
    pub path: PathBuf,
    pub model_dir: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("racing.db");
        let model_dir = dir.path().join("models");
        // Create the schema up front so read-only opens succeed
        RaceRepository::new(&path).expect("create store");
        Self {
            _dir: dir,
            path,
            model_dir,
        }
    }

    pub fn repo(&self) -> RaceRepository {
        RaceRepository::new(&self.path).expect("open store")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(offset)
}

pub fn race(race_id: &str, date: NaiveDate) -> RawRace {
    RawRace {
        race_id: race_id.to_string(),
        date,
        course: Some("Ascot".to_string()),
        course_id: Some("crs_1".to_string()),
        distance_f: Some(6.0),
        going: Some("Good".to_string()),
        surface: Some("Turf".to_string()),
        race_type: Some("Flat".to_string()),
        race_class: Some("Class 3".to_string()),
        prize: Some(10_000.0),
        age_band: None,
        pattern: None,
        region: Some("GB".to_string()),
    }
}

pub fn runner(race_id: &str, horse_id: &str, slot: usize, rpr: Option<f64>) -> RawRunner {
    RawRunner {
        runner_id: format!("{race_id}_{horse_id}"),
        race_id: race_id.to_string(),
        horse_id: horse_id.to_string(),
        horse_name: Some(horse_id.to_uppercase()),
        trainer_id: Some(format!("trn_{}", slot % 2)),
        jockey_id: Some(format!("jky_{}", slot % 3)),
        number: Some(slot as f64 + 1.0),
        draw: Some(slot as f64 + 1.0),
        age: Some(3.0 + (slot % 3) as f64),
        weight_lbs: Some(126.0 + slot as f64),
        ofr: rpr.map(|r| r - 5.0),
        rpr,
        ts: rpr.map(|r| r - 20.0),
        headgear: None,
        form: Some("2-1-3".to_string()),
        last_run: Some("14".to_string()),
    }
}

pub fn result(runner: &RawRunner, position: u32) -> RawResult {
    RawResult {
        race_id: runner.race_id.clone(),
        horse_id: runner.horse_id.clone(),
        trainer_id: runner.trainer_id.clone(),
        jockey_id: runner.jockey_id.clone(),
        position: Some(position),
        beaten_lengths: Some(f64::from(position - 1) * 1.5),
        time: Some("1:12.40".to_string()),
        sp_dec: Some(2.0 + f64::from(position)),
        prize: None,
        tsr: runner.ts,
        comment: Some(if position == 1 { "led, kept on" } else { "held up, never nearer" }.to_string()),
    }
}

/// Insert a settled race whose finishing order follows rpr.
pub fn settled_race(repo: &RaceRepository, race: &RawRace, field: &[(&str, f64)]) {
    repo.insert_race(race).expect("insert race");
    let runners: Vec<RawRunner> = field
        .iter()
        .enumerate()
        .map(|(slot, (horse, rpr))| runner(&race.race_id, horse, slot, Some(*rpr)))
        .collect();
    for r in &runners {
        repo.insert_runner(r).expect("insert runner");
    }
    for r in &runners {
        let position = 1 + field.iter().filter(|(_, other)| *other > r.rpr.unwrap_or(0.0)).count() as u32;
        repo.insert_result(&result(r, position)).expect("insert result");
    }
}

/// `races` settled four-runner races, three days apart, drawn from a
/// pool of eight horses. Entry order varies; the highest rpr always wins.
pub fn seed_history(repo: &RaceRepository, races: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(races);
    for r in 0..races {
        let id = format!("race_{r:03}");
        let horses: Vec<String> = (0..4).map(|i| format!("h{}", (r + i * 2) % 8)).collect();
        let field: Vec<(&str, f64)> = horses
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), 70.0 + 10.0 * ((i + r) % 4) as f64))
            .collect();
        settled_race(repo, &race(&id, day(3 * r as i64)), &field);
        ids.push(id);
    }
    ids
}
