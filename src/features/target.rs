//! Target labels for settled runners.

use serde::{Deserialize, Serialize};

use crate::storage::{RawResult, RawRunner};

/// Finishing outcome used as a training label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLabel {
    pub race_id: String,
    pub runner_id: String,
    pub horse_id: String,
    pub position: u32,
    pub won: bool,
    pub placed: bool,
    pub top_5: bool,
    pub beaten_lengths: Option<f64>,
    pub finishing_time: Option<String>,
    pub prize_money: Option<f64>,
}

impl TargetLabel {
    /// Label for a runner, `None` unless it has a finishing position.
    pub fn from_result(runner: &RawRunner, result: Option<&RawResult>) -> Option<Self> {
        let result = result.filter(|r| r.finished())?;
        let position = result.position?;
        Some(Self {
            race_id: runner.race_id.clone(),
            runner_id: runner.runner_id.clone(),
            horse_id: runner.horse_id.clone(),
            position,
            won: position == 1,
            placed: position <= 3,
            top_5: position <= 5,
            beaten_lengths: result.beaten_lengths,
            finishing_time: result.time.clone(),
            prize_money: result.prize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> RawRunner {
        RawRunner {
            runner_id: "run_1".to_string(),
            race_id: "race_1".to_string(),
            horse_id: "hrs_1".to_string(),
            horse_name: None,
            trainer_id: None,
            jockey_id: None,
            number: Some(1.0),
            draw: None,
            age: None,
            weight_lbs: None,
            ofr: None,
            rpr: None,
            ts: None,
            headgear: None,
            form: None,
            last_run: None,
        }
    }

    fn result(position: Option<u32>) -> RawResult {
        RawResult {
            race_id: "race_1".to_string(),
            horse_id: "hrs_1".to_string(),
            trainer_id: None,
            jockey_id: None,
            position,
            beaten_lengths: Some(2.5),
            time: Some("1:12.40".to_string()),
            sp_dec: Some(6.0),
            prize: Some(1500.0),
            tsr: None,
            comment: None,
        }
    }

    #[test]
    fn test_flags() {
        let label = TargetLabel::from_result(&runner(), Some(&result(Some(3)))).unwrap();
        assert_eq!(label.position, 3);
        assert!(!label.won);
        assert!(label.placed);
        assert!(label.top_5);
        assert_eq!(label.beaten_lengths, Some(2.5));
        assert_eq!(label.prize_money, Some(1500.0));
    }

    #[test]
    fn test_no_label_without_finish() {
        assert!(TargetLabel::from_result(&runner(), None).is_none());
        assert!(TargetLabel::from_result(&runner(), Some(&result(None))).is_none());
        assert!(TargetLabel::from_result(&runner(), Some(&result(Some(997)))).is_none());
    }
}
