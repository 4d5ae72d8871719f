//! Speed ratings and running style from recent runs.

use serde::{Deserialize, Serialize};

use crate::storage::HistoryRow;

/// Improvement (in rating points) the recent runs must show.
const SPEED_IMPROVEMENT: f64 = 2.0;

/// Where a horse typically races in the early stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunningStyle {
    Leader,
    Prominent,
    #[default]
    Midfield,
    HeldUp,
}

impl RunningStyle {
    pub fn code(self) -> u8 {
        match self {
            RunningStyle::Leader => 1,
            RunningStyle::Prominent => 2,
            RunningStyle::Midfield => 3,
            RunningStyle::HeldUp => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => RunningStyle::Leader,
            2 => RunningStyle::Prominent,
            4 => RunningStyle::HeldUp,
            _ => RunningStyle::Midfield,
        }
    }

    /// Leaders and prominent racers put pressure on the pace.
    pub fn presses_pace(self) -> bool {
        matches!(self, RunningStyle::Leader | RunningStyle::Prominent)
    }

    /// Classify one race comment by keyword. Unmatched comments are
    /// midfield.
    pub fn classify(comment: Option<&str>) -> Self {
        let comment = match comment {
            Some(c) => c.to_lowercase(),
            None => return RunningStyle::Midfield,
        };
        let has = |words: &[&str]| words.iter().any(|w| comment.contains(w));

        if has(&["led", "front", "made all", "led throughout", "front-ran"]) {
            RunningStyle::Leader
        } else if has(&["prominent", "tracked", "pressed", "close up", "disputed"]) {
            RunningStyle::Prominent
        } else if has(&["held up", "rear", "behind", "switched", "waited"]) {
            RunningStyle::HeldUp
        } else {
            RunningStyle::Midfield
        }
    }

    /// Median style over a set of comments, midfield when there are none.
    ///
    /// An even count takes the lower-middle style when the two middle
    /// codes straddle a half.
    pub fn typical<'a>(comments: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        let mut codes: Vec<u8> = comments
            .into_iter()
            .map(|c| Self::classify(c).code())
            .collect();
        if codes.is_empty() {
            return RunningStyle::Midfield;
        }
        codes.sort_unstable();
        let mid = codes.len() / 2;
        let median = if codes.len() % 2 == 0 {
            (codes[mid - 1] + codes[mid]) / 2
        } else {
            codes[mid]
        };
        Self::from_code(median)
    }
}

/// Speed and pace signals for one horse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaceFeatures {
    pub best_tsr: Option<f64>,
    pub avg_tsr_last_5: Option<f64>,
    pub speed_improving: bool,
    pub running_style: RunningStyle,
}

impl PaceFeatures {
    /// Compute from completed pre-race runs, most recent first.
    ///
    /// `lookback` runs are scanned for speed ratings, of which the first
    /// `comment_runs` also feed the running-style vote.
    pub fn from_history(history: &[HistoryRow], lookback: usize, comment_runs: usize) -> Self {
        let recent = &history[..history.len().min(lookback)];
        let tsr: Vec<f64> = recent.iter().filter_map(|r| r.tsr).collect();

        let best_tsr = tsr.iter().copied().reduce(f64::max);
        let avg_tsr_last_5 = mean(&tsr[..tsr.len().min(5)]);
        let speed_improving = tsr.len() >= 6
            && mean(&tsr[..3]).unwrap_or(0.0) > mean(&tsr[3..6]).unwrap_or(0.0) + SPEED_IMPROVEMENT;

        let running_style = RunningStyle::typical(
            recent
                .iter()
                .take(comment_runs)
                .map(|r| r.comment.as_deref()),
        );

        Self {
            best_tsr,
            avg_tsr_last_5,
            speed_improving,
            running_style,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn run(day: u32, tsr: Option<f64>, comment: Option<&str>) -> HistoryRow {
        HistoryRow {
            race_id: format!("r{day}"),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            course: None,
            distance_f: None,
            going: None,
            position: 4,
            sp_dec: None,
            tsr,
            comment: comment.map(str::to_string),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(RunningStyle::classify(Some("Made all, kept on")), RunningStyle::Leader);
        assert_eq!(RunningStyle::classify(Some("Tracked leaders")), RunningStyle::Prominent);
        assert_eq!(RunningStyle::classify(Some("Held up in rear")), RunningStyle::HeldUp);
        assert_eq!(RunningStyle::classify(Some("Never a factor")), RunningStyle::Midfield);
        assert_eq!(RunningStyle::classify(None), RunningStyle::Midfield);
    }

    #[test]
    fn test_typical_median() {
        let style = RunningStyle::typical([
            Some("made all"),
            Some("led"),
            Some("held up"),
        ]);
        assert_eq!(style, RunningStyle::Leader);

        // (1 + 4) / 2 rounds down to prominent
        let style = RunningStyle::typical([Some("made all"), Some("held up")]);
        assert_eq!(style, RunningStyle::Prominent);

        assert_eq!(RunningStyle::typical(Vec::<Option<&str>>::new()), RunningStyle::Midfield);
    }

    #[test]
    fn test_pace_features() {
        let history = vec![
            run(20, Some(80.0), Some("made all")),
            run(19, Some(78.0), Some("led")),
            run(18, Some(79.0), Some("prominent")),
            run(17, Some(70.0), None),
            run(16, Some(72.0), None),
            run(15, Some(71.0), None),
            run(14, None, None),
        ];
        let pace = PaceFeatures::from_history(&history, 10, 5);

        assert_eq!(pace.best_tsr, Some(80.0));
        assert_eq!(pace.avg_tsr_last_5, Some((80.0 + 78.0 + 79.0 + 70.0 + 72.0) / 5.0));
        assert!(pace.speed_improving);
        assert_eq!(pace.running_style, RunningStyle::Prominent);
    }

    #[test]
    fn test_pace_no_history() {
        let pace = PaceFeatures::from_history(&[], 10, 5);
        assert_eq!(pace, PaceFeatures::default());
    }
}
