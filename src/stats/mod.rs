//! Rolling and lifetime performance statistics.
//!
//! Statistics are always computed from completed runs strictly before a
//! cutoff date. A window covers `[as_of - days, as_of)`.

pub mod aggregate;

pub use aggregate::StatsAggregator;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::storage::HistoryRow;

/// Trailing window a statistic is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    Days14,
    Days30,
    Days90,
    Days365,
    Career,
}

impl Window {
    pub const ALL: [Window; 5] = [
        Window::Days14,
        Window::Days30,
        Window::Days90,
        Window::Days365,
        Window::Career,
    ];

    /// Windows persisted for trainer/jockey pairs.
    pub const COMBO: [Window; 3] = [Window::Days90, Window::Days365, Window::Career];

    pub fn days(self) -> Option<i64> {
        match self {
            Window::Days14 => Some(14),
            Window::Days30 => Some(30),
            Window::Days90 => Some(90),
            Window::Days365 => Some(365),
            Window::Career => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Window::Days14 => "14d",
            Window::Days30 => "30d",
            Window::Days90 => "90d",
            Window::Days365 => "365d",
            Window::Career => "career",
        }
    }

    /// Inclusive lower bound of the window for a cutoff date.
    pub fn since(self, as_of: NaiveDate) -> Option<NaiveDate> {
        self.days().map(|d| as_of - Duration::days(d))
    }
}

/// Tracked entity kinds, keyed by their column in `results`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Horse,
    Trainer,
    Jockey,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Horse => "horse",
            EntityKind::Trainer => "trainer",
            EntityKind::Jockey => "jockey",
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            EntityKind::Horse => "horse_id",
            EntityKind::Trainer => "trainer_id",
            EntityKind::Jockey => "jockey_id",
        }
    }
}

/// Distance bands in furlongs, inclusive at both ends.
const DISTANCE_BANDS: [(&str, f64, f64); 6] = [
    ("5-6f", 5.0, 6.0),
    ("7-8f", 7.0, 8.0),
    ("9-10f", 9.0, 10.0),
    ("11-12f", 11.0, 12.0),
    ("13-16f", 13.0, 16.0),
    ("17f+", 17.0, 999.0),
];

/// Band name for a distance, `None` when it falls between bands.
pub fn distance_band(distance_f: f64) -> Option<&'static str> {
    DISTANCE_BANDS
        .iter()
        .find(|(_, lo, hi)| *lo <= distance_f && distance_f <= *hi)
        .map(|(name, _, _)| *name)
}

/// Runs and wins in one specialization bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecEntry {
    pub runs: u32,
    pub wins: u32,
    pub win_rate: f64,
}

pub type SpecMap = BTreeMap<String, SpecEntry>;

/// Aggregated performance of one entity over one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStats {
    pub runs: u32,
    pub wins: u32,
    pub places: u32,
    pub win_rate: f64,
    pub place_rate: f64,
    pub strike_rate: f64,
    /// Mean return per unit stake at starting price.
    pub roi: f64,
    /// Actual wins over wins implied by starting prices.
    pub ae_ratio: f64,
    pub avg_position: Option<f64>,
    pub best_position: Option<u32>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub course_spec: SpecMap,
    pub distance_spec: SpecMap,
    pub going_spec: SpecMap,
}

impl EntityStats {
    /// Aggregate completed runs. The caller filters by entity and window.
    pub fn from_history(rows: &[HistoryRow]) -> Self {
        if rows.is_empty() {
            return Self::default();
        }

        let runs = rows.len() as u32;
        let wins = rows.iter().filter(|r| r.won()).count() as u32;
        let places = rows.iter().filter(|r| r.placed()).count() as u32;
        let win_rate = wins as f64 / runs as f64;

        let profit: f64 = rows
            .iter()
            .filter_map(|r| r.sp_dec.filter(|&sp| sp > 0.0).map(|sp| (r.won(), sp)))
            .map(|(won, sp)| if won { sp - 1.0 } else { -1.0 })
            .sum();
        let expected_wins: f64 = rows
            .iter()
            .filter_map(|r| r.sp_dec.filter(|&sp| sp > 0.0))
            .map(|sp| 1.0 / sp)
            .sum();

        let mut course_spec = SpecMap::new();
        let mut distance_spec = SpecMap::new();
        let mut going_spec = SpecMap::new();
        for row in rows {
            if let Some(course) = row.course.as_deref() {
                bump(&mut course_spec, course, row.won());
            }
            if let Some(band) = row.distance_f.and_then(distance_band) {
                bump(&mut distance_spec, band, row.won());
            }
            if let Some(going) = row.going.as_deref() {
                bump(&mut going_spec, &going.trim().to_lowercase(), row.won());
            }
        }

        Self {
            runs,
            wins,
            places,
            win_rate,
            place_rate: places as f64 / runs as f64,
            strike_rate: win_rate,
            roi: profit / runs as f64,
            ae_ratio: if expected_wins > 0.0 {
                wins as f64 / expected_wins
            } else {
                0.0
            },
            avg_position: Some(
                rows.iter().map(|r| r.position as f64).sum::<f64>() / runs as f64,
            ),
            best_position: rows.iter().map(|r| r.position).min(),
            start_date: rows.iter().map(|r| r.date).min(),
            end_date: rows.iter().map(|r| r.date).max(),
            course_spec,
            distance_spec,
            going_spec,
        }
    }

    /// Win rate at one course, if the entity has run there.
    pub fn course_win_rate(&self, course: &str) -> Option<f64> {
        self.course_spec.get(course).map(|e| e.win_rate)
    }

    /// Win rate in the band containing `distance_f`.
    pub fn distance_band_win_rate(&self, distance_f: f64) -> Option<f64> {
        distance_band(distance_f)
            .and_then(|band| self.distance_spec.get(band))
            .map(|e| e.win_rate)
    }
}

fn bump(map: &mut SpecMap, key: &str, won: bool) {
    let entry = map.entry(key.to_string()).or_default();
    entry.runs += 1;
    if won {
        entry.wins += 1;
    }
    entry.win_rate = entry.wins as f64 / entry.runs as f64;
}
