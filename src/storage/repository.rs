//! SQLite repository for race records, statistics and feature rows

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, ToSql};
use serde::Serialize;
use std::path::Path;

use super::records::{DrawRun, HistoryRow, RawRace, RawResult, RawRunner};
use super::schema::{create_tables, table_columns, verify_schema};
use crate::error::RankError;
use crate::features::{FeatureVector, RaceFeatures, RunnerFeatures, FEATURE_COLUMNS};
use crate::form::NON_FINISH_THRESHOLD;
use crate::parse::{number_from_sql, text_from_sql};
use crate::stats::{EntityKind, EntityStats, Window};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Feature columns checked by the completeness report.
const KEY_FEATURES: [&str; 8] = [
    "horse_win_rate",
    "horse_form_last_5_avg",
    "trainer_win_rate_90d",
    "jockey_win_rate_90d",
    "rpr",
    "horse_rpr_rank",
    "horse_best_tsr",
    "course_distance_draw_bias",
];

/// One labelled training row as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub race_id: String,
    pub runner_id: String,
    pub date: NaiveDate,
    pub position: u32,
    pub values: Vec<Option<f64>>,
}

/// Feature rows for one race type, with the column order they were read in.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

/// Rows written by one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub races: usize,
    pub runners: usize,
    pub targets: usize,
}

/// Row counts and coverage of the store.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub races: i64,
    pub runners: i64,
    pub results: i64,
    pub entity_stats: i64,
    pub combo_stats: i64,
    pub feature_rows: i64,
    pub target_rows: i64,
    pub featured_races: i64,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
    /// Share of feature rows with a value, per key column
    pub completeness: Vec<(String, f64)>,
}

/// Optional runner columns the open store carries. Without `age` the
/// horse's recorded age is read; without `last_run` it is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunnerColumns {
    age: bool,
    last_run: bool,
}

impl RunnerColumns {
    fn detect(conn: &Connection) -> Result<Self> {
        let present = table_columns(conn, "runners")?;
        let has = |name: &str| present.iter().any(|c| c == name);
        Ok(Self {
            age: has("age"),
            last_run: has("last_run"),
        })
    }
}

/// Repository over the record store
pub struct RaceRepository {
    conn: Connection,
    runner_columns: RunnerColumns,
}

impl RaceRepository {
    /// Open (or create) the store for reading and writing
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open(db_path).context("Failed to open database")?;

        // Readers keep working while the single writer commits
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        create_tables(&conn)?;
        verify_schema(&conn)?;
        let runner_columns = RunnerColumns::detect(&conn)?;

        Ok(Self { conn, runner_columns })
    }

    /// Open an existing store read-only. Used by feature workers.
    pub fn open_read_only(db_path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open {} read-only", db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        verify_schema(&conn)?;
        let runner_columns = RunnerColumns::detect(&conn)?;
        Ok(Self { conn, runner_columns })
    }

    /// Create an in-memory repository (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_tables(&conn)?;
        let runner_columns = RunnerColumns::detect(&conn)?;
        Ok(Self { conn, runner_columns })
    }

    // ==================== Insert Operations ====================

    /// Insert a race (upsert)
    pub fn insert_race(&self, race: &RawRace) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO races
            (race_id, date, course, course_id, distance_f, going, surface, type,
             race_class, prize, age_band, pattern, region)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                race.race_id,
                race.date.to_string(),
                race.course,
                race.course_id,
                race.distance_f,
                race.going,
                race.surface,
                race.race_type,
                race.race_class,
                race.prize,
                race.age_band,
                race.pattern,
                race.region,
            ],
        )?;
        Ok(())
    }

    /// Insert a runner (upsert), plus its horse name and age if known
    pub fn insert_runner(&self, runner: &RawRunner) -> Result<()> {
        let mut columns = vec![
            "runner_id", "race_id", "horse_id", "trainer_id", "jockey_id", "number", "draw",
            "lbs", "ofr", "rpr", "ts", "headgear", "form",
        ];
        let mut values: Vec<&dyn ToSql> = vec![
            &runner.runner_id,
            &runner.race_id,
            &runner.horse_id,
            &runner.trainer_id,
            &runner.jockey_id,
            &runner.number,
            &runner.draw,
            &runner.weight_lbs,
            &runner.ofr,
            &runner.rpr,
            &runner.ts,
            &runner.headgear,
            &runner.form,
        ];
        if self.runner_columns.age {
            columns.push("age");
            values.push(&runner.age);
        }
        if self.runner_columns.last_run {
            columns.push("last_run");
            values.push(&runner.last_run);
        }

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO runners ({}) VALUES ({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        self.conn.execute(&sql, params_from_iter(values))?;

        if runner.horse_name.is_some() || runner.age.is_some() {
            self.conn.execute(
                r#"
                INSERT INTO horses (horse_id, name, age) VALUES (?1, ?2, ?3)
                ON CONFLICT(horse_id) DO UPDATE SET
                    name = COALESCE(excluded.name, horses.name),
                    age = COALESCE(excluded.age, horses.age)
                "#,
                params![runner.horse_id, runner.horse_name, runner.age],
            )?;
        }
        Ok(())
    }

    /// Insert a settled result (upsert)
    pub fn insert_result(&self, result: &RawResult) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO results
            (race_id, horse_id, trainer_id, jockey_id, position_int, ovr_btn, time,
             sp_dec, prize, tsr, comment)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                result.race_id,
                result.horse_id,
                result.trainer_id,
                result.jockey_id,
                result.position,
                result.beaten_lengths,
                result.time,
                result.sp_dec,
                result.prize,
                result.tsr,
                result.comment,
            ],
        )?;
        Ok(())
    }

    // ==================== Race Queries ====================

    /// Get one race, `None` if absent or its date is unreadable
    pub fn get_race(&self, race_id: &str) -> Result<Option<RawRace>> {
        let race = self
            .conn
            .query_row(
                r#"
                SELECT race_id, date, course, course_id, distance_f, going, surface, type,
                       race_class, prize, age_band, pattern, region
                FROM races
                WHERE race_id = ?1
                "#,
                [race_id],
                race_from_row,
            )
            .optional()?;
        Ok(race.flatten())
    }

    /// Get runners for a race, in entry order
    pub fn get_runners(&self, race_id: &str) -> Result<Vec<RawRunner>> {
        // Per-race age wins over the horse's recorded age
        let age = if self.runner_columns.age {
            "COALESCE(ru.age, h.age)"
        } else {
            "h.age"
        };
        let last_run = if self.runner_columns.last_run {
            "ru.last_run"
        } else {
            "NULL"
        };
        let sql = format!(
            r#"
            SELECT ru.runner_id, ru.race_id, ru.horse_id, h.name, ru.trainer_id, ru.jockey_id,
                   ru.number, ru.draw, {age}, ru.lbs, ru.ofr, ru.rpr, ru.ts, ru.headgear, ru.form,
                   {last_run}
            FROM runners ru
            LEFT JOIN horses h ON h.horse_id = ru.horse_id
            WHERE ru.race_id = ?1
            ORDER BY ru.rowid
            "#
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let runners = stmt
            .query_map([race_id], |row| {
                Ok(RawRunner {
                    runner_id: required_text(row, 0)?,
                    race_id: required_text(row, 1)?,
                    horse_id: required_text(row, 2)?,
                    horse_name: text_from_sql(row.get_ref(3)?),
                    trainer_id: text_from_sql(row.get_ref(4)?),
                    jockey_id: text_from_sql(row.get_ref(5)?),
                    number: number_from_sql(row.get_ref(6)?),
                    draw: number_from_sql(row.get_ref(7)?),
                    age: number_from_sql(row.get_ref(8)?),
                    weight_lbs: number_from_sql(row.get_ref(9)?),
                    ofr: number_from_sql(row.get_ref(10)?),
                    rpr: number_from_sql(row.get_ref(11)?),
                    ts: number_from_sql(row.get_ref(12)?),
                    headgear: text_from_sql(row.get_ref(13)?),
                    form: text_from_sql(row.get_ref(14)?),
                    last_run: text_from_sql(row.get_ref(15)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(runners)
    }

    /// Get settled results for a race
    pub fn get_results(&self, race_id: &str) -> Result<Vec<RawResult>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT race_id, horse_id, trainer_id, jockey_id, position_int, ovr_btn, time,
                   sp_dec, prize, tsr, comment
            FROM results
            WHERE race_id = ?1
            "#,
        )?;

        let results = stmt
            .query_map([race_id], |row| {
                Ok(RawResult {
                    race_id: required_text(row, 0)?,
                    horse_id: required_text(row, 1)?,
                    trainer_id: text_from_sql(row.get_ref(2)?),
                    jockey_id: text_from_sql(row.get_ref(3)?),
                    position: position_from_sql(row.get_ref(4)?),
                    beaten_lengths: number_from_sql(row.get_ref(5)?),
                    time: text_from_sql(row.get_ref(6)?),
                    sp_dec: number_from_sql(row.get_ref(7)?),
                    prize: number_from_sql(row.get_ref(8)?),
                    tsr: number_from_sql(row.get_ref(9)?),
                    comment: text_from_sql(row.get_ref(10)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(results)
    }

    /// Settled races in date order, optionally only those without features
    pub fn races_needing_features(
        &self,
        only_missing: bool,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let missing = if only_missing {
            "AND ra.race_id NOT IN (SELECT DISTINCT race_id FROM ml_features)"
        } else {
            ""
        };
        let sql = format!(
            r#"
            SELECT ra.race_id
            FROM races ra
            WHERE EXISTS (SELECT 1 FROM results res WHERE res.race_id = ra.race_id)
            {missing}
            ORDER BY ra.date, ra.race_id
            LIMIT ?1
            "#
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map([limit], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ==================== History Queries ====================

    /// Completed runs of one entity strictly before `before`, most recent first
    pub fn entity_history(
        &self,
        kind: EntityKind,
        entity_id: &str,
        before: NaiveDate,
        since: Option<NaiveDate>,
    ) -> Result<Vec<HistoryRow>> {
        let sql = format!(
            r#"
            SELECT res.race_id, ra.date, ra.course, ra.distance_f, ra.going,
                   res.position_int, res.sp_dec, res.tsr, res.comment
            FROM results res
            JOIN races ra ON res.race_id = ra.race_id
            WHERE res.{col} = ?1
              AND ra.date < ?2
              AND (?3 IS NULL OR ra.date >= ?3)
            ORDER BY ra.date DESC, res.race_id DESC
            "#,
            col = kind.id_column()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![entity_id, before.to_string(), since.map(|d| d.to_string())],
                |row| history_from_row(row, 0),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Completed runs of every entity of a kind strictly before `before`
    pub fn history_for_all(
        &self,
        kind: EntityKind,
        before: NaiveDate,
    ) -> Result<Vec<(String, HistoryRow)>> {
        let sql = format!(
            r#"
            SELECT res.{col}, res.race_id, ra.date, ra.course, ra.distance_f, ra.going,
                   res.position_int, res.sp_dec, res.tsr, res.comment
            FROM results res
            JOIN races ra ON res.race_id = ra.race_id
            WHERE res.{col} IS NOT NULL
              AND ra.date < ?1
            ORDER BY res.{col}, ra.date DESC, res.race_id DESC
            "#,
            col = kind.id_column()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([before.to_string()], |row| {
                let id = text_from_sql(row.get_ref(0)?);
                Ok(id.zip(history_from_row(row, 1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Completed runs with one trainer/jockey pair strictly before `before`
    pub fn combo_history(
        &self,
        trainer_id: &str,
        jockey_id: &str,
        before: NaiveDate,
        since: Option<NaiveDate>,
    ) -> Result<Vec<HistoryRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT res.race_id, ra.date, ra.course, ra.distance_f, ra.going,
                   res.position_int, res.sp_dec, res.tsr, res.comment
            FROM results res
            JOIN races ra ON res.race_id = ra.race_id
            WHERE res.trainer_id = ?1
              AND res.jockey_id = ?2
              AND ra.date < ?3
              AND (?4 IS NULL OR ra.date >= ?4)
            ORDER BY ra.date DESC, res.race_id DESC
            "#,
        )?;
        let rows = stmt
            .query_map(
                params![
                    trainer_id,
                    jockey_id,
                    before.to_string(),
                    since.map(|d| d.to_string())
                ],
                |row| history_from_row(row, 0),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Completed runs of every trainer/jockey pair strictly before `before`
    pub fn combo_history_for_all(
        &self,
        before: NaiveDate,
    ) -> Result<Vec<((String, String), HistoryRow)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT res.trainer_id, res.jockey_id, res.race_id, ra.date, ra.course,
                   ra.distance_f, ra.going, res.position_int, res.sp_dec, res.tsr, res.comment
            FROM results res
            JOIN races ra ON res.race_id = ra.race_id
            WHERE res.trainer_id IS NOT NULL
              AND res.jockey_id IS NOT NULL
              AND ra.date < ?1
            ORDER BY res.trainer_id, res.jockey_id, ra.date DESC, res.race_id DESC
            "#,
        )?;
        let rows = stmt
            .query_map([before.to_string()], |row| {
                let pair = text_from_sql(row.get_ref(0)?).zip(text_from_sql(row.get_ref(1)?));
                Ok(pair.zip(history_from_row(row, 2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Completed, drawn runs at a course strictly before `before`
    pub fn draw_runs(&self, course: &str, before: NaiveDate) -> Result<Vec<DrawRun>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ru.draw, ra.distance_f, res.position_int
            FROM results res
            JOIN runners ru ON res.race_id = ru.race_id AND res.horse_id = ru.horse_id
            JOIN races ra ON res.race_id = ra.race_id
            WHERE ra.course = ?1
              AND ra.date < ?2
              AND ru.draw IS NOT NULL
            "#,
        )?;
        let rows = stmt
            .query_map(params![course, before.to_string()], |row| {
                let draw = number_from_sql(row.get_ref(0)?);
                let distance_f = number_from_sql(row.get_ref(1)?);
                let position = position_from_sql(row.get_ref(2)?);
                Ok(match (draw, distance_f, position) {
                    (Some(d), Some(distance_f), Some(position))
                        if d >= 1.0 && position > 0 && position < NON_FINISH_THRESHOLD =>
                    {
                        Some(DrawRun {
                            draw: d as u32,
                            distance_f,
                            position,
                        })
                    }
                    _ => None,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    // ==================== Statistics ====================

    /// Replace every stored record for one (kind, window) in one transaction
    pub fn replace_entity_stats(
        &self,
        kind: EntityKind,
        window: Window,
        as_of: NaiveDate,
        records: &[(String, EntityStats)],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM entity_stats WHERE entity_kind = ?1 AND period = ?2",
            params![kind.as_str(), window.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO entity_stats
                (entity_kind, entity_id, period, as_of, runs, wins, places, win_rate,
                 place_rate, strike_rate, roi, ae_ratio, avg_position, best_position,
                 start_date, end_date, course_specialization, distance_specialization,
                 going_specialization)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?17, ?18, ?19)
                "#,
            )?;
            for (id, stats) in records {
                let mut values = vec![
                    Value::from(kind.as_str().to_string()),
                    Value::from(id.clone()),
                ];
                values.extend(stats_values(window, as_of, stats)?);
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Stored record and its cutoff date for one (kind, id, window)
    pub fn load_entity_stats(
        &self,
        kind: EntityKind,
        entity_id: &str,
        window: Window,
    ) -> Result<Option<(NaiveDate, EntityStats)>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT as_of, runs, wins, places, win_rate, place_rate, strike_rate, roi,
                       ae_ratio, avg_position, best_position, start_date, end_date,
                       course_specialization, distance_specialization, going_specialization
                FROM entity_stats
                WHERE entity_kind = ?1 AND entity_id = ?2 AND period = ?3
                "#,
                params![kind.as_str(), entity_id, window.as_str()],
                stats_from_row,
            )
            .optional()?;
        Ok(record.flatten())
    }

    /// Replace every stored pair record for one window in one transaction
    pub fn replace_combo_stats(
        &self,
        window: Window,
        as_of: NaiveDate,
        records: &[((String, String), EntityStats)],
    ) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM combo_stats WHERE period = ?1",
            [window.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO combo_stats
                (trainer_id, jockey_id, period, as_of, runs, wins, places, win_rate,
                 place_rate, strike_rate, roi, ae_ratio, avg_position, best_position,
                 start_date, end_date, course_specialization, distance_specialization,
                 going_specialization)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                        ?16, ?17, ?18, ?19)
                "#,
            )?;
            for ((trainer_id, jockey_id), stats) in records {
                let mut values = vec![Value::from(trainer_id.clone()), Value::from(jockey_id.clone())];
                values.extend(stats_values(window, as_of, stats)?);
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Stored pair record and its cutoff date
    pub fn load_combo_stats(
        &self,
        trainer_id: &str,
        jockey_id: &str,
        window: Window,
    ) -> Result<Option<(NaiveDate, EntityStats)>> {
        let record = self
            .conn
            .query_row(
                r#"
                SELECT as_of, runs, wins, places, win_rate, place_rate, strike_rate, roi,
                       ae_ratio, avg_position, best_position, start_date, end_date,
                       course_specialization, distance_specialization, going_specialization
                FROM combo_stats
                WHERE trainer_id = ?1 AND jockey_id = ?2 AND period = ?3
                "#,
                params![trainer_id, jockey_id, window.as_str()],
                stats_from_row,
            )
            .optional()?;
        Ok(record.flatten())
    }

    // ==================== Feature Rows ====================

    /// Replace feature and target rows for a batch of races in one transaction
    pub fn replace_race_batch(&self, batch: &[RaceFeatures]) -> Result<BatchCounts> {
        let placeholders: Vec<String> = (1..=FEATURE_COLUMNS.len() + 3)
            .map(|i| format!("?{i}"))
            .collect();
        let insert_features = format!(
            "INSERT INTO ml_features (race_id, runner_id, horse_id, {}) VALUES ({})",
            FEATURE_COLUMNS.join(", "),
            placeholders.join(", ")
        );

        let mut counts = BatchCounts::default();
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut delete_features = tx.prepare("DELETE FROM ml_features WHERE race_id = ?1")?;
            let mut delete_targets = tx.prepare("DELETE FROM ml_targets WHERE race_id = ?1")?;
            let mut insert_features = tx.prepare(&insert_features)?;
            let mut insert_target = tx.prepare(
                r#"
                INSERT INTO ml_targets
                (race_id, runner_id, horse_id, position, won, placed, top_5,
                 beaten_lengths, finishing_time, prize_money)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;

            for race in batch {
                delete_features.execute([&race.race_id])?;
                delete_targets.execute([&race.race_id])?;

                for runner in &race.runners {
                    let mut values = vec![
                        Value::from(runner.race_id.clone()),
                        Value::from(runner.runner_id.clone()),
                        Value::from(runner.horse_id.clone()),
                    ];
                    values.extend(
                        runner
                            .features
                            .values()
                            .into_iter()
                            .map(|v| v.map(Value::Real).unwrap_or(Value::Null)),
                    );
                    insert_features.execute(params_from_iter(values))?;
                    counts.runners += 1;
                }

                for target in &race.targets {
                    insert_target.execute(params![
                        target.race_id,
                        target.runner_id,
                        target.horse_id,
                        target.position,
                        target.won,
                        target.placed,
                        target.top_5,
                        target.beaten_lengths,
                        target.finishing_time,
                        target.prize_money,
                    ])?;
                    counts.targets += 1;
                }
                counts.races += 1;
            }
        }
        tx.commit()?;
        Ok(counts)
    }

    /// Stored feature rows for one race, in runner order
    pub fn load_race_features(&self, race_id: &str) -> Result<Vec<RunnerFeatures>> {
        let sql = format!(
            "SELECT race_id, runner_id, horse_id, {} FROM ml_features WHERE race_id = ?1 ORDER BY rowid",
            FEATURE_COLUMNS.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([race_id], |row| {
                let values: Vec<Option<f64>> = (0..FEATURE_COLUMNS.len())
                    .map(|i| row.get_ref(i + 3).map(number_from_sql))
                    .collect::<std::result::Result<_, _>>()?;
                Ok(RunnerFeatures {
                    race_id: row.get(0)?,
                    runner_id: row.get(1)?,
                    horse_id: row.get(2)?,
                    features: FeatureVector::from_values(&values),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Labelled feature rows for one race type, every stored feature column
    ///
    /// Fails with [`RankError::NonNumericFeature`] if a feature column is
    /// declared or populated as text.
    pub fn load_feature_table(&self, race_type: &str) -> Result<FeatureTable> {
        let columns = self.numeric_feature_columns()?;

        let sql = format!(
            r#"
            SELECT f.race_id, f.runner_id, ra.date, t.position, {}
            FROM ml_features f
            JOIN ml_targets t ON t.race_id = f.race_id AND t.runner_id = f.runner_id
            JOIN races ra ON ra.race_id = f.race_id
            WHERE lower(ra.type) = lower(?1)
            ORDER BY ra.date, f.race_id, f.rowid
            "#,
            columns
                .iter()
                .map(|c| format!("f.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut query = stmt.query([race_type])?;
        let mut rows = Vec::new();
        while let Some(row) = query.next()? {
            let date_text: String = row.get(2)?;
            let date = match NaiveDate::parse_from_str(&date_text, DATE_FORMAT) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let position = match position_from_sql(row.get_ref(3)?) {
                Some(p) => p,
                None => continue,
            };
            let mut values = Vec::with_capacity(columns.len());
            for (i, column) in columns.iter().enumerate() {
                let value = match row.get_ref(i + 4)? {
                    ValueRef::Null => None,
                    ValueRef::Integer(v) => Some(v as f64),
                    ValueRef::Real(v) => Some(v),
                    ValueRef::Text(_) | ValueRef::Blob(_) => {
                        return Err(RankError::NonNumericFeature(column.clone()).into())
                    }
                };
                values.push(value);
            }
            rows.push(FeatureRow {
                race_id: row.get(0)?,
                runner_id: row.get(1)?,
                date,
                position,
                values,
            });
        }

        Ok(FeatureTable { columns, rows })
    }

    /// Feature columns in table order, rejecting any declared as text
    fn numeric_feature_columns(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA table_info(ml_features)")?;
        let declared = stmt
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut columns = Vec::new();
        for (name, decl_type) in declared {
            if matches!(name.as_str(), "race_id" | "runner_id" | "horse_id") {
                continue;
            }
            let t = decl_type.to_uppercase();
            if t.contains("CHAR") || t.contains("TEXT") || t.contains("CLOB") || t.contains("BLOB") {
                return Err(RankError::NonNumericFeature(name).into());
            }
            columns.push(name);
        }
        Ok(columns)
    }

    // ==================== Reporting ====================

    /// Row counts, date range and feature completeness
    pub fn dataset_report(&self) -> Result<DatasetReport> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };

        let (first_date, last_date): (Option<String>, Option<String>) = self.conn.query_row(
            "SELECT MIN(date), MAX(date) FROM races",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let feature_rows = count("SELECT COUNT(*) FROM ml_features")?;
        let present = table_columns(&self.conn, "ml_features")?;
        let mut completeness = Vec::new();
        for column in KEY_FEATURES {
            if !present.iter().any(|c| c == column) {
                continue;
            }
            let filled = count(&format!("SELECT COUNT({column}) FROM ml_features"))?;
            let share = if feature_rows > 0 {
                filled as f64 / feature_rows as f64
            } else {
                0.0
            };
            completeness.push((column.to_string(), share));
        }

        Ok(DatasetReport {
            races: count("SELECT COUNT(*) FROM races")?,
            runners: count("SELECT COUNT(*) FROM runners")?,
            results: count("SELECT COUNT(*) FROM results")?,
            entity_stats: count("SELECT COUNT(*) FROM entity_stats")?,
            combo_stats: count("SELECT COUNT(*) FROM combo_stats")?,
            feature_rows,
            target_rows: count("SELECT COUNT(*) FROM ml_targets")?,
            featured_races: count("SELECT COUNT(DISTINCT race_id) FROM ml_features")?,
            first_date,
            last_date,
            completeness,
        })
    }

    /// Number of stored feature rows
    pub fn feature_row_count(&self) -> Result<i64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ml_features", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ==================== Row Mapping ====================

fn required_text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    text_from_sql(row.get_ref(idx)?).ok_or(rusqlite::Error::InvalidColumnType(
        idx,
        "identifier".to_string(),
        rusqlite::types::Type::Null,
    ))
}

fn parse_date(value: ValueRef<'_>) -> Option<NaiveDate> {
    text_from_sql(value).and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok())
}

/// Finishing position or sentinel, `None` when blank or unparsable.
fn position_from_sql(value: ValueRef<'_>) -> Option<u32> {
    number_from_sql(value)
        .filter(|p| *p >= 0.0)
        .map(|p| p as u32)
}

fn race_from_row(row: &Row<'_>) -> rusqlite::Result<Option<RawRace>> {
    let date = match parse_date(row.get_ref(1)?) {
        Some(d) => d,
        None => return Ok(None),
    };
    Ok(Some(RawRace {
        race_id: required_text(row, 0)?,
        date,
        course: text_from_sql(row.get_ref(2)?),
        course_id: text_from_sql(row.get_ref(3)?),
        distance_f: number_from_sql(row.get_ref(4)?),
        going: text_from_sql(row.get_ref(5)?),
        surface: text_from_sql(row.get_ref(6)?),
        race_type: text_from_sql(row.get_ref(7)?),
        race_class: text_from_sql(row.get_ref(8)?),
        prize: number_from_sql(row.get_ref(9)?),
        age_band: text_from_sql(row.get_ref(10)?),
        pattern: text_from_sql(row.get_ref(11)?),
        region: text_from_sql(row.get_ref(12)?),
    }))
}

/// History row starting at column `offset`; `None` for non-finishers.
fn history_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Option<HistoryRow>> {
    let date = match parse_date(row.get_ref(offset + 1)?) {
        Some(d) => d,
        None => return Ok(None),
    };
    let position = match position_from_sql(row.get_ref(offset + 5)?) {
        Some(p) if p > 0 && p < NON_FINISH_THRESHOLD => p,
        _ => return Ok(None),
    };
    Ok(Some(HistoryRow {
        race_id: required_text(row, offset)?,
        date,
        course: text_from_sql(row.get_ref(offset + 2)?),
        distance_f: number_from_sql(row.get_ref(offset + 3)?),
        going: text_from_sql(row.get_ref(offset + 4)?),
        position,
        sp_dec: number_from_sql(row.get_ref(offset + 6)?),
        tsr: number_from_sql(row.get_ref(offset + 7)?),
        comment: text_from_sql(row.get_ref(offset + 8)?),
    }))
}

fn stats_values(window: Window, as_of: NaiveDate, stats: &EntityStats) -> Result<Vec<Value>> {
    Ok(vec![
        Value::from(window.as_str().to_string()),
        Value::from(as_of.to_string()),
        Value::from(stats.runs as i64),
        Value::from(stats.wins as i64),
        Value::from(stats.places as i64),
        Value::Real(stats.win_rate),
        Value::Real(stats.place_rate),
        Value::Real(stats.strike_rate),
        Value::Real(stats.roi),
        Value::Real(stats.ae_ratio),
        stats.avg_position.map(Value::Real).unwrap_or(Value::Null),
        stats
            .best_position
            .map(|p| Value::from(p as i64))
            .unwrap_or(Value::Null),
        stats
            .start_date
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        stats
            .end_date
            .map(|d| Value::from(d.to_string()))
            .unwrap_or(Value::Null),
        Value::from(serde_json::to_string(&stats.course_spec)?),
        Value::from(serde_json::to_string(&stats.distance_spec)?),
        Value::from(serde_json::to_string(&stats.going_spec)?),
    ])
}

fn stats_from_row(row: &Row<'_>) -> rusqlite::Result<Option<(NaiveDate, EntityStats)>> {
    let as_of = match parse_date(row.get_ref(0)?) {
        Some(d) => d,
        None => return Ok(None),
    };
    let spec = |idx: usize| -> rusqlite::Result<_> {
        Ok(text_from_sql(row.get_ref(idx)?)
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    };
    let stats = EntityStats {
        runs: row.get::<_, i64>(1)? as u32,
        wins: row.get::<_, i64>(2)? as u32,
        places: row.get::<_, i64>(3)? as u32,
        win_rate: row.get(4)?,
        place_rate: row.get(5)?,
        strike_rate: row.get(6)?,
        roi: row.get(7)?,
        ae_ratio: row.get(8)?,
        avg_position: row.get(9)?,
        best_position: row.get::<_, Option<i64>>(10)?.map(|p| p as u32),
        start_date: parse_date(row.get_ref(11)?),
        end_date: parse_date(row.get_ref(12)?),
        course_spec: spec(13)?,
        distance_spec: spec(14)?,
        going_spec: spec(15)?,
    };
    Ok(Some((as_of, stats)))
}
