//! SQLite schema definitions.
//!
//! Source tables (filled by the fetch layer):
//! - races: race context
//! - runners: entries with pre-race attributes
//! - results: settled outcomes
//! - horses, trainers, jockeys: named entities
//!
//! Tables owned by this crate:
//! - entity_stats: per-entity windowed statistics
//! - combo_stats: trainer/jockey pair statistics
//! - ml_features: one feature vector per (race, runner)
//! - ml_targets: one label row per settled (race, runner)

use rusqlite::Connection;

use crate::error::{RankError, Result};
use crate::features::FEATURE_COLUMNS;

/// Columns this crate reads from each source table.
pub const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        "races",
        &[
            "race_id", "date", "course", "course_id", "distance_f", "going", "surface",
            "type", "race_class", "prize", "age_band", "pattern", "region",
        ],
    ),
    (
        "runners",
        &[
            "runner_id", "race_id", "horse_id", "trainer_id", "jockey_id", "number",
            "draw", "lbs", "ofr", "rpr", "ts", "headgear", "form",
        ],
    ),
    (
        "results",
        &[
            "race_id", "horse_id", "trainer_id", "jockey_id", "position_int", "ovr_btn",
            "time", "sp_dec", "prize", "tsr", "comment",
        ],
    ),
    ("horses", &["horse_id", "name", "age"]),
];

// runners.age and runners.last_run are read when present

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS races (
            race_id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            course TEXT,
            course_id TEXT,
            distance_f REAL,
            going TEXT,
            surface TEXT,
            type TEXT,
            race_class TEXT,
            prize TEXT,
            age_band TEXT,
            pattern TEXT,
            region TEXT,
            is_abandoned INTEGER DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS runners (
            runner_id TEXT PRIMARY KEY,
            race_id TEXT NOT NULL REFERENCES races(race_id),
            horse_id TEXT NOT NULL,
            trainer_id TEXT,
            jockey_id TEXT,
            number TEXT,
            draw TEXT,
            age TEXT,
            lbs TEXT,
            ofr TEXT,
            rpr TEXT,
            ts TEXT,
            headgear TEXT,
            form TEXT,
            last_run TEXT,
            UNIQUE(race_id, horse_id)
        );

        CREATE TABLE IF NOT EXISTS results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id TEXT NOT NULL REFERENCES races(race_id),
            horse_id TEXT NOT NULL,
            trainer_id TEXT,
            jockey_id TEXT,
            position_int INTEGER,
            ovr_btn TEXT,
            time TEXT,
            sp_dec TEXT,
            prize TEXT,
            tsr TEXT,
            comment TEXT,
            UNIQUE(race_id, horse_id)
        );

        CREATE TABLE IF NOT EXISTS horses (
            horse_id TEXT PRIMARY KEY,
            name TEXT,
            age TEXT,
            sex TEXT
        );

        CREATE TABLE IF NOT EXISTS trainers (
            trainer_id TEXT PRIMARY KEY,
            name TEXT
        );

        CREATE TABLE IF NOT EXISTS jockeys (
            jockey_id TEXT PRIMARY KEY,
            name TEXT
        );

        CREATE TABLE IF NOT EXISTS entity_stats (
            entity_kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            period TEXT NOT NULL,
            as_of TEXT NOT NULL,
            runs INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            places INTEGER NOT NULL,
            win_rate REAL NOT NULL,
            place_rate REAL NOT NULL,
            strike_rate REAL NOT NULL,
            roi REAL NOT NULL,
            ae_ratio REAL NOT NULL,
            avg_position REAL,
            best_position INTEGER,
            start_date TEXT,
            end_date TEXT,
            course_specialization TEXT,
            distance_specialization TEXT,
            going_specialization TEXT,
            PRIMARY KEY (entity_kind, entity_id, period)
        );

        CREATE TABLE IF NOT EXISTS combo_stats (
            trainer_id TEXT NOT NULL,
            jockey_id TEXT NOT NULL,
            period TEXT NOT NULL,
            as_of TEXT NOT NULL,
            runs INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            places INTEGER NOT NULL,
            win_rate REAL NOT NULL,
            place_rate REAL NOT NULL,
            strike_rate REAL NOT NULL,
            roi REAL NOT NULL,
            ae_ratio REAL NOT NULL,
            avg_position REAL,
            best_position INTEGER,
            start_date TEXT,
            end_date TEXT,
            course_specialization TEXT,
            distance_specialization TEXT,
            going_specialization TEXT,
            PRIMARY KEY (trainer_id, jockey_id, period)
        );

        CREATE TABLE IF NOT EXISTS ml_targets (
            race_id TEXT NOT NULL,
            runner_id TEXT NOT NULL,
            horse_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            won INTEGER NOT NULL,
            placed INTEGER NOT NULL,
            top_5 INTEGER NOT NULL,
            beaten_lengths REAL,
            finishing_time TEXT,
            prize_money REAL,
            PRIMARY KEY (race_id, runner_id)
        );
        "#,
    )?;

    conn.execute(&features_table_sql(), [])?;

    // Indexes for the strict-before-date history scans
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_races_date ON races(date);
        CREATE INDEX IF NOT EXISTS idx_races_course ON races(course);
        CREATE INDEX IF NOT EXISTS idx_runners_race ON runners(race_id);
        CREATE INDEX IF NOT EXISTS idx_results_horse ON results(horse_id);
        CREATE INDEX IF NOT EXISTS idx_results_trainer ON results(trainer_id);
        CREATE INDEX IF NOT EXISTS idx_results_jockey ON results(jockey_id);
        CREATE INDEX IF NOT EXISTS idx_results_race ON results(race_id);
        CREATE INDEX IF NOT EXISTS idx_ml_features_race ON ml_features(race_id);
        "#,
    )?;

    Ok(())
}

/// `CREATE TABLE` for the feature table, one REAL column per feature.
fn features_table_sql() -> String {
    let columns: Vec<String> = FEATURE_COLUMNS
        .iter()
        .map(|c| format!("    {c} REAL"))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS ml_features (\n    race_id TEXT NOT NULL,\n    runner_id TEXT NOT NULL,\n    horse_id TEXT NOT NULL,\n{},\n    PRIMARY KEY (race_id, runner_id)\n)",
        columns.join(",\n")
    )
}

/// Check that every column this crate reads exists.
///
/// A missing column is fatal at startup.
pub fn verify_schema(conn: &Connection) -> Result<()> {
    for (table, columns) in REQUIRED_COLUMNS {
        let present = table_columns(conn, table)?;
        for column in columns.iter() {
            if !present.iter().any(|c| c == column) {
                return Err(RankError::SchemaMismatch {
                    table: table.to_string(),
                    column: column.to_string(),
                });
            }
        }
    }

    let present = table_columns(conn, "ml_features")?;
    if !present.is_empty() {
        for column in FEATURE_COLUMNS {
            if !present.iter().any(|c| c == column) {
                return Err(RankError::SchemaMismatch {
                    table: "ml_features".to_string(),
                    column: column.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Source tables as the fetch layer lays them out, age on horses only.
#[cfg(test)]
pub(crate) const SOURCE_TABLES_WITHOUT_RUNNER_EXTRAS: &str = "
    CREATE TABLE races (race_id TEXT PRIMARY KEY, date TEXT, course TEXT, course_id TEXT,
        distance_f REAL, going TEXT, surface TEXT, type TEXT, race_class TEXT, prize TEXT,
        age_band TEXT, pattern TEXT, region TEXT, is_abandoned INTEGER DEFAULT 0);
    CREATE TABLE runners (runner_id TEXT PRIMARY KEY, race_id TEXT, horse_id TEXT,
        trainer_id TEXT, jockey_id TEXT, number TEXT, draw TEXT, lbs TEXT, ofr TEXT,
        rpr TEXT, ts TEXT, headgear TEXT, form TEXT);
    CREATE TABLE results (race_id TEXT, horse_id TEXT, trainer_id TEXT, jockey_id TEXT,
        position_int INTEGER, ovr_btn TEXT, time TEXT, sp_dec TEXT, prize TEXT, tsr TEXT,
        comment TEXT);
    CREATE TABLE horses (horse_id TEXT PRIMARY KEY, name TEXT, age TEXT, sex TEXT);
    CREATE TABLE trainers (trainer_id TEXT PRIMARY KEY, name TEXT);
    CREATE TABLE jockeys (jockey_id TEXT PRIMARY KEY, name TEXT);
";

/// Column names of a table, empty if the table does not exist.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('races', 'runners', 'results', 'horses', 'trainers', 'jockeys',
                  'entity_stats', 'combo_stats', 'ml_features', 'ml_targets')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 10);
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        verify_schema(&conn).unwrap();
    }

    #[test]
    fn test_feature_table_has_every_column() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        let columns = table_columns(&conn, "ml_features").unwrap();
        assert_eq!(columns.len(), FEATURE_COLUMNS.len() + 3);
    }

    #[test]
    fn test_verify_schema_reports_missing_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE races (race_id TEXT, date TEXT);
             CREATE TABLE runners (runner_id TEXT);
             CREATE TABLE results (race_id TEXT);
             CREATE TABLE horses (horse_id TEXT, name TEXT);",
        )
        .unwrap();

        match verify_schema(&conn) {
            Err(RankError::SchemaMismatch { table, column }) => {
                assert_eq!(table, "races");
                assert_eq!(column, "course");
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_runner_age_and_last_run_are_optional() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SOURCE_TABLES_WITHOUT_RUNNER_EXTRAS).unwrap();
        verify_schema(&conn).unwrap();
        create_tables(&conn).unwrap();
        verify_schema(&conn).unwrap();
    }

    #[test]
    fn test_horse_age_is_required() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&SOURCE_TABLES_WITHOUT_RUNNER_EXTRAS.replace("name TEXT, age TEXT", "name TEXT"))
            .unwrap();

        match verify_schema(&conn) {
            Err(RankError::SchemaMismatch { table, column }) => {
                assert_eq!(table, "horses");
                assert_eq!(column, "age");
            }
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }
}
