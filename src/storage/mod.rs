//! SQLite storage for race records, statistics and feature rows
//!
//! Raw tables (races, runners, results) are read-only inputs; statistics
//! and feature tables are derived and fully replaceable.

pub mod records;
pub mod repository;
pub mod schema;

pub use records::{DrawRun, HistoryRow, RawRace, RawResult, RawRunner};
pub use repository::{BatchCounts, DatasetReport, FeatureRow, FeatureTable, RaceRepository};
pub use schema::{create_tables, verify_schema};
