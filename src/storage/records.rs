//! Typed rows produced once at the store boundary.
//!
//! Every numeric source column is coerced through
//! [`crate::parse::number_from_sql`] when these are built; nothing
//! downstream touches raw SQLite values.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::form::NON_FINISH_THRESHOLD;

/// Race-level context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRace {
    pub race_id: String,
    pub date: NaiveDate,
    pub course: Option<String>,
    pub course_id: Option<String>,
    pub distance_f: Option<f64>,
    pub going: Option<String>,
    pub surface: Option<String>,
    pub race_type: Option<String>,
    pub race_class: Option<String>,
    pub prize: Option<f64>,
    pub age_band: Option<String>,
    pub pattern: Option<String>,
    pub region: Option<String>,
}

/// One competitor's entry in a race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRunner {
    pub runner_id: String,
    pub race_id: String,
    pub horse_id: String,
    pub horse_name: Option<String>,
    pub trainer_id: Option<String>,
    pub jockey_id: Option<String>,
    pub number: Option<f64>,
    pub draw: Option<f64>,
    pub age: Option<f64>,
    pub weight_lbs: Option<f64>,
    pub ofr: Option<f64>,
    pub rpr: Option<f64>,
    pub ts: Option<f64>,
    pub headgear: Option<String>,
    pub form: Option<String>,
    /// Free-text days since the previous run, e.g. "21 days".
    pub last_run: Option<String>,
}

/// Settled outcome for a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    pub race_id: String,
    pub horse_id: String,
    pub trainer_id: Option<String>,
    pub jockey_id: Option<String>,
    /// Finishing position, or a non-finish sentinel.
    pub position: Option<u32>,
    pub beaten_lengths: Option<f64>,
    pub time: Option<String>,
    pub sp_dec: Option<f64>,
    pub prize: Option<f64>,
    pub tsr: Option<f64>,
    pub comment: Option<String>,
}

impl RawResult {
    /// True when the runner completed the course.
    pub fn finished(&self) -> bool {
        matches!(self.position, Some(p) if p > 0 && p < NON_FINISH_THRESHOLD)
    }
}

/// A completed past run joined with its race context.
///
/// History queries only return runs that finished, ordered most recent
/// first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub race_id: String,
    pub date: NaiveDate,
    pub course: Option<String>,
    pub distance_f: Option<f64>,
    pub going: Option<String>,
    pub position: u32,
    pub sp_dec: Option<f64>,
    pub tsr: Option<f64>,
    pub comment: Option<String>,
}

impl HistoryRow {
    pub fn won(&self) -> bool {
        self.position == 1
    }

    pub fn placed(&self) -> bool {
        self.position <= 3
    }
}

/// A completed past run at a course, for draw analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRun {
    pub draw: u32,
    pub distance_f: f64,
    pub position: u32,
}
