//! Training matrices grouped by race.

use anyhow::Result;
use chrono::NaiveDate;
use ndarray::Array2;
use std::ops::Range;

use crate::error::RankError;
use crate::storage::FeatureRow;

/// Dense, imputed rows with contiguous race groups.
#[derive(Debug, Clone)]
pub struct RankingDataset {
    pub features: Array2<f64>,
    /// Relevance points, higher is better
    pub labels: Vec<f64>,
    pub positions: Vec<u32>,
    pub groups: Vec<Range<usize>>,
    pub race_ids: Vec<String>,
}

impl RankingDataset {
    /// Build from rows sorted so each race is contiguous.
    ///
    /// Missing values are replaced by `medians`.
    pub fn from_rows(rows: &[FeatureRow], medians: &[f64], label_ceiling: u32) -> Self {
        let n_cols = medians.len();
        let mut features = Array2::<f64>::zeros((rows.len(), n_cols));
        for (i, row) in rows.iter().enumerate() {
            for (j, value) in row.values.iter().enumerate().take(n_cols) {
                features[[i, j]] = value.unwrap_or(medians[j]);
            }
        }

        let groups = race_groups(rows);
        let mut labels = vec![0.0; rows.len()];
        let mut race_ids = Vec::with_capacity(groups.len());
        for g in &groups {
            let max_pos = rows[g.clone()].iter().map(|r| r.position).max().unwrap_or(1);
            for i in g.clone() {
                labels[i] = relevance_points(rows[i].position, max_pos, label_ceiling);
            }
            race_ids.push(rows[g.start].race_id.clone());
        }

        Self {
            features,
            labels,
            positions: rows.iter().map(|r| r.position).collect(),
            groups,
            race_ids,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn row(&self, i: usize) -> Vec<f64> {
        self.features.row(i).to_vec()
    }
}

/// `max_position - position + 1`, clipped to `ceiling`.
pub fn relevance_points(position: u32, max_position: u32, ceiling: u32) -> f64 {
    let points = max_position.saturating_sub(position) + 1;
    points.min(ceiling) as f64
}

/// Contiguous index ranges sharing a race id.
pub fn race_groups(rows: &[FeatureRow]) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    for i in 1..=rows.len() {
        if i == rows.len() || rows[i].race_id != rows[start].race_id {
            if i > start {
                groups.push(start..i);
            }
            start = i;
        }
    }
    groups
}

/// Split by date so every evaluation race is no earlier than every
/// training race.
///
/// The cut is placed at the race date found `1 - test_size` of the way
/// through the sorted races; races on that date and later are held out.
pub fn temporal_split(rows: Vec<FeatureRow>, test_size: f64) -> Result<(Vec<FeatureRow>, Vec<FeatureRow>)> {
    let mut race_dates: Vec<(NaiveDate, &str)> = race_groups(&rows)
        .into_iter()
        .map(|g| (rows[g.start].date, rows[g.start].race_id.as_str()))
        .collect();
    race_dates.sort();
    race_dates.dedup();

    if race_dates.len() < 2 {
        return Err(RankError::EmptyDataset(format!(
            "need at least two races to split, found {}",
            race_dates.len()
        ))
        .into());
    }

    let cut = ((race_dates.len() as f64) * (1.0 - test_size)).floor() as usize;
    let split_date = race_dates[cut.clamp(1, race_dates.len() - 1)].0;

    let (train, eval): (Vec<_>, Vec<_>) = rows.into_iter().partition(|r| r.date < split_date);
    if train.is_empty() || eval.is_empty() {
        return Err(RankError::EmptyDataset(format!(
            "temporal split at {} leaves an empty side",
            split_date
        ))
        .into());
    }
    Ok((train, eval))
}

/// Per-column median of present values, 0 for an empty column.
pub fn column_medians(rows: &[FeatureRow], n_cols: usize) -> Vec<f64> {
    (0..n_cols)
        .map(|j| {
            let mut values: Vec<f64> = rows.iter().filter_map(|r| r.values.get(j).copied().flatten()).collect();
            if values.is_empty() {
                return 0.0;
            }
            values.sort_by(f64::total_cmp);
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            }
        })
        .collect()
}
