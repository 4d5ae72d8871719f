//! Form string parsing.
//!
//! A form string lists recent finishing positions, most recent first
//! ("1-2-P-3"). Letter codes mark non-finishes and map to sentinels at or
//! above [`NON_FINISH_THRESHOLD`] so they sort after any real position.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::parse::first_integer;

/// Positions at or above this value are non-finishes.
pub const NON_FINISH_THRESHOLD: u32 = 900;

/// Margin (in positions) a recent average must beat the older one by.
const TREND_MARGIN: f64 = 0.5;

/// Map a form token to its sentinel.
fn code_value(token: &str) -> Option<u32> {
    match token {
        "F" => Some(999),  // fell
        "U" => Some(998),  // unseated
        "P" => Some(997),  // pulled up
        "R" => Some(996),  // refused
        "BD" => Some(995), // brought down
        "C" => Some(994),  // carried out
        "S" => Some(993),  // slipped
        "RO" => Some(992), // ran out
        "UR" => Some(991), // unseated rider
        "0" => Some(900),  // unplaced outside the first nine
        _ => None,
    }
}

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[-/]").unwrap())
}

/// Numeric signals derived from a form string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormFeatures {
    pub last_position: Option<u32>,
    pub avg_last_3: Option<f64>,
    pub avg_last_5: Option<f64>,
    pub avg_last_10: Option<f64>,
    pub best_last_5: Option<u32>,
    pub worst_last_5: Option<u32>,
    /// Population standard deviation of the last five completed runs.
    pub consistency: Option<f64>,
    pub races_since_win: Option<u32>,
    pub races_since_place: Option<u32>,
    /// 1 improving, -1 declining, 0 stable or not enough runs.
    pub improving_trend: i8,
    pub completed_last_5: u32,
    pub dnf_last_5: u32,
    pub win_rate_last_10: f64,
    pub place_rate_last_10: f64,
}

pub struct FormParser;

impl FormParser {
    /// Parse a form string into positions, most recent first.
    pub fn parse(code: Option<&str>) -> Vec<u32> {
        let code = match code.map(str::trim) {
            Some(c) if !c.is_empty() && c != "-" => c.to_uppercase(),
            _ => return Vec::new(),
        };

        let mut positions = Vec::new();
        for token in separator_re().split(&code) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(v) = code_value(token) {
                positions.push(v);
            } else if let Ok(v) = token.parse::<u32>() {
                positions.push(v);
            } else if let Some(v) = first_integer(token) {
                if let Ok(v) = u32::try_from(v) {
                    positions.push(v);
                }
            }
        }
        positions
    }

    /// Compute recency and consistency features. Never fails.
    pub fn compute_form_features(code: Option<&str>) -> FormFeatures {
        let positions = Self::parse(code);
        if positions.is_empty() {
            return FormFeatures::default();
        }

        let completed: Vec<u32> = positions
            .iter()
            .copied()
            .filter(|&p| p < NON_FINISH_THRESHOLD)
            .collect();
        let last_5: &[u32] = &completed[..completed.len().min(5)];

        let races_since_win = positions
            .iter()
            .position(|&p| p == 1)
            .unwrap_or(positions.len()) as u32;
        let races_since_place = positions
            .iter()
            .position(|&p| p <= 3 && p < NON_FINISH_THRESHOLD)
            .unwrap_or(positions.len()) as u32;

        let improving_trend = if completed.len() >= 6 {
            let recent = mean(&completed[..3]);
            let older = mean(&completed[3..6]);
            if recent < older - TREND_MARGIN {
                1
            } else if recent > older + TREND_MARGIN {
                -1
            } else {
                0
            }
        } else {
            0
        };

        let dnf_last_5 = positions
            .iter()
            .take(5)
            .filter(|&&p| p >= NON_FINISH_THRESHOLD)
            .count() as u32;
        let completed_last_5 = if positions.len() >= 5 {
            5 - dnf_last_5
        } else {
            last_5.len() as u32
        };

        let last_10 = &positions[..positions.len().min(10)];
        let wins_10 = last_10.iter().filter(|&&p| p == 1).count();
        let places_10 = last_10
            .iter()
            .filter(|&&p| p <= 3 && p < NON_FINISH_THRESHOLD)
            .count();

        FormFeatures {
            last_position: positions.first().copied(),
            avg_last_3: mean_opt(&completed[..completed.len().min(3)]),
            avg_last_5: mean_opt(last_5),
            avg_last_10: mean_opt(&completed[..completed.len().min(10)]),
            best_last_5: last_5.iter().min().copied(),
            worst_last_5: last_5.iter().max().copied(),
            consistency: (last_5.len() >= 2).then(|| std_dev(last_5)),
            races_since_win: Some(races_since_win),
            races_since_place: Some(races_since_place),
            improving_trend,
            completed_last_5,
            dnf_last_5,
            win_rate_last_10: wins_10 as f64 / last_10.len() as f64,
            place_rate_last_10: places_10 as f64 / last_10.len() as f64,
        }
    }

    /// Days since the last run from a free-text field ("14", "28 days").
    pub fn parse_last_run_days(raw: Option<&str>) -> Option<u32> {
        raw.and_then(first_integer)
            .and_then(|v| u32::try_from(v).ok())
    }
}

fn mean(values: &[u32]) -> f64 {
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}

fn mean_opt(values: &[u32]) -> Option<f64> {
    (!values.is_empty()).then(|| mean(values))
}

fn std_dev(values: &[u32]) -> f64 {
    let m = mean(values);
    let var = values
        .iter()
        .map(|&v| (v as f64 - m).powi(2))
        .sum::<f64>()
        / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        assert_eq!(FormParser::parse(Some("1-2-3-4-5")), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_parse_non_finishers() {
        let parsed = FormParser::parse(Some("P-P-U-2-1"));
        assert_eq!(parsed.len(), 5);
        assert!(parsed[..3].iter().all(|&p| p > NON_FINISH_THRESHOLD));
        assert_eq!(&parsed[3..], &[2, 1]);
    }

    #[test]
    fn test_parse_empty() {
        assert!(FormParser::parse(Some("")).is_empty());
        assert!(FormParser::parse(None).is_empty());
        assert!(FormParser::parse(Some("-")).is_empty());
        assert_eq!(FormParser::compute_form_features(None), FormFeatures::default());
        assert_eq!(
            FormParser::compute_form_features(Some("")),
            FormFeatures::default()
        );
    }

    #[test]
    fn test_parse_mixed_case_and_seasons() {
        assert_eq!(FormParser::parse(Some("bd/2-ur-1st")), vec![995, 2, 991, 1]);
    }

    #[test]
    fn test_features_simple() {
        let f = FormParser::compute_form_features(Some("1-2-3-4-5"));
        assert_eq!(f.last_position, Some(1));
        assert_eq!(f.avg_last_3, Some(2.0));
        assert_eq!(f.avg_last_5, Some(3.0));
        assert_eq!(f.best_last_5, Some(1));
        assert_eq!(f.worst_last_5, Some(5));
        assert!((f.consistency.unwrap() - 2.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(f.races_since_win, Some(0));
        assert_eq!(f.races_since_place, Some(0));
        assert_eq!(f.completed_last_5, 5);
        assert_eq!(f.dnf_last_5, 0);
        assert!((f.win_rate_last_10 - 0.2).abs() < 1e-12);
        assert!((f.place_rate_last_10 - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_features_with_dnf() {
        let f = FormParser::compute_form_features(Some("P-P-U-2-1"));
        assert_eq!(f.last_position, Some(997));
        assert_eq!(f.dnf_last_5, 3);
        assert_eq!(f.completed_last_5, 2);
        assert_eq!(f.races_since_win, Some(4));
        assert_eq!(f.races_since_place, Some(3));
        assert_eq!(f.avg_last_3, Some(1.5));
    }

    #[test]
    fn test_never_won() {
        let f = FormParser::compute_form_features(Some("4-5-6"));
        assert_eq!(f.races_since_win, Some(3));
        assert_eq!(f.races_since_place, Some(3));
        assert_eq!(f.consistency, Some((2.0_f64 / 3.0).sqrt()));
    }

    #[test]
    fn test_improving_trend() {
        let improving = FormParser::compute_form_features(Some("1-2-1-6-7-5"));
        assert_eq!(improving.improving_trend, 1);

        let declining = FormParser::compute_form_features(Some("7-8-6-1-2-1"));
        assert_eq!(declining.improving_trend, -1);

        let stable = FormParser::compute_form_features(Some("3-3-3-3-3-3"));
        assert_eq!(stable.improving_trend, 0);

        let short = FormParser::compute_form_features(Some("1-1-1-9-9"));
        assert_eq!(short.improving_trend, 0);
    }

    #[test]
    fn test_parse_last_run_days() {
        assert_eq!(FormParser::parse_last_run_days(Some("14")), Some(14));
        assert_eq!(FormParser::parse_last_run_days(Some("28 days")), Some(28));
        assert_eq!(FormParser::parse_last_run_days(Some("")), None);
        assert_eq!(FormParser::parse_last_run_days(None), None);
    }
}
