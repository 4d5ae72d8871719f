//! Statistics aggregator service.
//!
//! Owns the read API used by the feature engine and the batch
//! `recompute` entry point that refreshes persisted snapshots.

use anyhow::Result;
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{EntityKind, EntityStats, Window};
use crate::config::StatsConfig;
use crate::storage::{HistoryRow, RaceRepository};

/// Records written by one recompute.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecomputeSummary {
    pub as_of: Option<NaiveDate>,
    pub horses: usize,
    pub trainers: usize,
    pub jockeys: usize,
    pub combos: usize,
}

/// Computes and serves windowed statistics as of a cutoff date.
pub struct StatsAggregator<'r> {
    repo: &'r RaceRepository,
    combo_min_runs: u32,
}

impl<'r> StatsAggregator<'r> {
    pub fn new(repo: &'r RaceRepository, config: &StatsConfig) -> Self {
        Self {
            repo,
            combo_min_runs: config.combo_min_runs,
        }
    }

    /// Minimum joint runs for a pair to count.
    pub fn combo_min_runs(&self) -> u32 {
        self.combo_min_runs
    }

    /// Statistics for one entity over one window as of `as_of`.
    ///
    /// A persisted snapshot is served only when it was computed for the
    /// same cutoff; otherwise the value is computed from history.
    pub fn stats(
        &self,
        kind: EntityKind,
        entity_id: &str,
        window: Window,
        as_of: NaiveDate,
    ) -> Result<EntityStats> {
        if let Some((snapshot_as_of, stats)) =
            self.repo.load_entity_stats(kind, entity_id, window)?
        {
            if snapshot_as_of == as_of {
                return Ok(stats);
            }
        }
        let history = self
            .repo
            .entity_history(kind, entity_id, as_of, window.since(as_of))?;
        Ok(EntityStats::from_history(&history))
    }

    /// Trainer/jockey pair statistics, `None` below the minimum sample.
    pub fn combo_stats(
        &self,
        trainer_id: &str,
        jockey_id: &str,
        window: Window,
        as_of: NaiveDate,
    ) -> Result<Option<EntityStats>> {
        let stats = match self.repo.load_combo_stats(trainer_id, jockey_id, window)? {
            Some((snapshot_as_of, stats)) if snapshot_as_of == as_of => stats,
            _ => {
                let history = self.repo.combo_history(
                    trainer_id,
                    jockey_id,
                    as_of,
                    window.since(as_of),
                )?;
                EntityStats::from_history(&history)
            }
        };
        Ok((stats.runs >= self.combo_min_runs).then_some(stats))
    }

    /// Completed runs of an entity before `as_of`, most recent first.
    pub fn history(
        &self,
        kind: EntityKind,
        entity_id: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<HistoryRow>> {
        self.repo.entity_history(kind, entity_id, as_of, None)
    }

    /// Rebuild every persisted snapshot as of `as_of`.
    ///
    /// Each (kind, window) set is replaced wholesale. Horses keep the
    /// career window only; pairs keep 90d, 365d and career and only when
    /// they meet the minimum sample.
    pub fn recompute(&self, as_of: NaiveDate) -> Result<RecomputeSummary> {
        info!("Recomputing statistics as of {}", as_of);
        let mut summary = RecomputeSummary {
            as_of: Some(as_of),
            ..Default::default()
        };

        for kind in [EntityKind::Horse, EntityKind::Trainer, EntityKind::Jockey] {
            let grouped = group(self.repo.history_for_all(kind, as_of)?);
            let windows: &[Window] = match kind {
                EntityKind::Horse => &[Window::Career],
                _ => &Window::ALL,
            };

            let mut written = 0;
            for &window in windows {
                let records = aggregate(&grouped, window, as_of, 1);
                written += records.len();
                self.repo.replace_entity_stats(kind, window, as_of, &records)?;
                debug!(
                    "{} {}: {} records",
                    kind.as_str(),
                    window.as_str(),
                    records.len()
                );
            }

            match kind {
                EntityKind::Horse => summary.horses = written,
                EntityKind::Trainer => summary.trainers = written,
                EntityKind::Jockey => summary.jockeys = written,
            }
        }

        let pairs = group(self.repo.combo_history_for_all(as_of)?);
        for window in Window::COMBO {
            let records = aggregate(&pairs, window, as_of, self.combo_min_runs);
            summary.combos += records.len();
            self.repo.replace_combo_stats(window, as_of, &records)?;
        }

        info!(
            "Statistics written: {} horse, {} trainer, {} jockey, {} pair records",
            summary.horses, summary.trainers, summary.jockeys, summary.combos
        );
        Ok(summary)
    }
}

fn group<K: Ord>(rows: Vec<(K, HistoryRow)>) -> BTreeMap<K, Vec<HistoryRow>> {
    let mut grouped: BTreeMap<K, Vec<HistoryRow>> = BTreeMap::new();
    for (key, row) in rows {
        grouped.entry(key).or_default().push(row);
    }
    grouped
}

/// Window statistics per key, dropping keys with fewer than `min_runs`.
fn aggregate<K>(
    grouped: &BTreeMap<K, Vec<HistoryRow>>,
    window: Window,
    as_of: NaiveDate,
    min_runs: u32,
) -> Vec<(K, EntityStats)>
where
    K: Ord + Clone + Send + Sync,
{
    let since = window.since(as_of);
    let entries: Vec<(&K, &Vec<HistoryRow>)> = grouped.iter().collect();
    entries
        .par_iter()
        .filter_map(|(key, rows)| {
            let in_window: Vec<HistoryRow> = rows
                .iter()
                .filter(|r| since.map_or(true, |s| r.date >= s))
                .cloned()
                .collect();
            let stats = EntityStats::from_history(&in_window);
            (stats.runs >= min_runs.max(1)).then(|| ((*key).clone(), stats))
        })
        .collect()
}
