//! Per-runner feature stage and race assembly.

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, warn};

use super::encode::{
    encode_going, encode_headgear, encode_race_class, encode_race_type, encode_surface,
};
use super::field::apply_field_relative;
use super::pace::PaceFeatures;
use super::{DrawTable, FeatureVector, RaceFeatures, RunnerFeatures, TargetLabel};
use crate::config::{FeaturesConfig, StatsConfig};
use crate::form::FormParser;
use crate::stats::{EntityKind, EntityStats, StatsAggregator, Window};
use crate::storage::{HistoryRow, RaceRepository, RawRace, RawRunner};

/// Builds feature vectors for one race at a time.
///
/// Every lookup is made as of the race date, so nothing from the race
/// day or later reaches a vector.
pub struct FeatureEngine<'a> {
    repo: &'a RaceRepository,
    stats: &'a StatsAggregator<'a>,
    features: FeaturesConfig,
    pace_lookback: usize,
    pace_comment_runs: usize,
}

impl<'a> FeatureEngine<'a> {
    pub fn new(
        repo: &'a RaceRepository,
        stats: &'a StatsAggregator<'a>,
        features: &FeaturesConfig,
        stats_config: &StatsConfig,
    ) -> Self {
        Self {
            repo,
            stats,
            features: features.clone(),
            pace_lookback: stats_config.pace_lookback,
            pace_comment_runs: stats_config.pace_comment_runs,
        }
    }

    /// Features and targets for a stored race.
    ///
    /// Returns `None` when the race is unknown or has no runners.
    pub fn build_race(&self, race_id: &str) -> Result<Option<RaceFeatures>> {
        let race = match self.repo.get_race(race_id)? {
            Some(r) => r,
            None => {
                warn!("Race {} not found or has no readable date", race_id);
                return Ok(None);
            }
        };
        let runners = self.repo.get_runners(race_id)?;
        if runners.is_empty() {
            warn!("Race {} has no runners, skipping", race_id);
            return Ok(None);
        }

        let vectors = self.race_vectors(&race, &runners)?;
        let results = self.repo.get_results(race_id)?;

        let mut rows = Vec::with_capacity(runners.len());
        let mut targets = Vec::new();
        for (runner, features) in runners.iter().zip(vectors) {
            let result = results.iter().find(|r| r.horse_id == runner.horse_id);
            if let Some(target) = TargetLabel::from_result(runner, result) {
                targets.push(target);
            }
            rows.push(RunnerFeatures {
                race_id: race.race_id.clone(),
                runner_id: runner.runner_id.clone(),
                horse_id: runner.horse_id.clone(),
                features,
            });
        }

        Ok(Some(RaceFeatures {
            race_id: race.race_id,
            runners: rows,
            targets,
        }))
    }

    /// Both stages for a field, in runner order.
    pub fn race_vectors(&self, race: &RawRace, runners: &[RawRunner]) -> Result<Vec<FeatureVector>> {
        let mut vectors = runners
            .iter()
            .map(|runner| self.runner_features(race, runner))
            .collect::<Result<Vec<_>>>()?;
        self.apply_field_stage(race, &mut vectors)?;
        Ok(vectors)
    }

    /// Field-relative stage, including draw bias at the race's course.
    pub fn apply_field_stage(&self, race: &RawRace, vectors: &mut [FeatureVector]) -> Result<()> {
        let draws = self.draw_table(race)?;
        apply_field_relative(vectors, &draws, &self.features);
        Ok(())
    }

    fn draw_table(&self, race: &RawRace) -> Result<DrawTable> {
        match (race.course.as_deref(), race.distance_f) {
            (Some(course), Some(distance_f)) => {
                let runs = self.repo.draw_runs(course, race.date)?;
                Ok(DrawTable::from_runs(
                    &runs,
                    distance_f,
                    self.features.draw_distance_tolerance_f,
                    self.features.draw_min_sample,
                ))
            }
            _ => Ok(DrawTable::default()),
        }
    }

    /// Per-runner stage. Missing upstream data leaves single features
    /// `None`; only store failures are errors.
    pub fn runner_features(&self, race: &RawRace, runner: &RawRunner) -> Result<FeatureVector> {
        let as_of = race.date;
        let mut f = FeatureVector::default();

        // Horse history
        let history = self.stats.history(EntityKind::Horse, &runner.horse_id, as_of)?;
        self.horse_history(&mut f, race, runner, &history);

        // Form string
        let form = FormParser::compute_form_features(runner.form.as_deref());
        f.horse_form_last_position = form.last_position.map(f64::from);
        f.horse_form_last_3_avg = form.avg_last_3;
        f.horse_form_last_5_avg = form.avg_last_5;
        f.horse_form_last_10_avg = form.avg_last_10;
        f.horse_form_best_last_5 = form.best_last_5.map(f64::from);
        f.horse_form_worst_last_5 = form.worst_last_5.map(f64::from);
        f.horse_form_improving = Some(f64::from(form.improving_trend));
        f.horse_consistency = form.consistency;
        f.races_since_win = form.races_since_win.map(f64::from);
        f.races_since_place = form.races_since_place.map(f64::from);
        f.form_completed_last_5 = Some(f64::from(form.completed_last_5));
        f.form_dnf_last_5 = Some(f64::from(form.dnf_last_5));
        f.form_win_rate_last_10 = Some(form.win_rate_last_10);
        f.form_place_rate_last_10 = Some(form.place_rate_last_10);

        // Ratings and pace
        let pace = PaceFeatures::from_history(&history, self.pace_lookback, self.pace_comment_runs);
        f.horse_best_rating = runner.ofr;
        f.horse_best_tsr = pace.best_tsr;
        f.horse_avg_tsr_last_5 = pace.avg_tsr_last_5;
        f.speed_improving = Some(if pace.speed_improving { 1.0 } else { 0.0 });
        f.typical_running_style = Some(f64::from(pace.running_style.code()));

        // Trainer and jockey
        if let Some(id) = runner.trainer_id.as_deref() {
            let h = self.handler(EntityKind::Trainer, id, race)?;
            f.trainer_win_rate_14d = Some(h.win_rate_14d);
            f.trainer_win_rate_30d = Some(h.win_rate_30d);
            f.trainer_win_rate_90d = Some(h.win_rate_90d);
            f.trainer_win_rate_365d = Some(h.win_rate_365d);
            f.trainer_strike_rate = Some(h.strike_rate);
            f.trainer_roi = Some(h.roi);
            f.trainer_ae_ratio = Some(h.ae_ratio);
            f.trainer_course_win_rate = h.course_win_rate;
            f.trainer_distance_win_rate = h.distance_win_rate;
        }
        if let Some(id) = runner.jockey_id.as_deref() {
            let h = self.handler(EntityKind::Jockey, id, race)?;
            f.jockey_win_rate_14d = Some(h.win_rate_14d);
            f.jockey_win_rate_30d = Some(h.win_rate_30d);
            f.jockey_win_rate_90d = Some(h.win_rate_90d);
            f.jockey_win_rate_365d = Some(h.win_rate_365d);
            f.jockey_strike_rate = Some(h.strike_rate);
            f.jockey_roi = Some(h.roi);
            f.jockey_ae_ratio = Some(h.ae_ratio);
            f.jockey_course_win_rate = h.course_win_rate;
            f.jockey_distance_win_rate = h.distance_win_rate;
        }

        // Trainer/jockey pair
        if let (Some(t), Some(j)) = (runner.trainer_id.as_deref(), runner.jockey_id.as_deref()) {
            if let Some(combo) = self.stats.combo_stats(t, j, Window::Career, as_of)? {
                f.combo_win_rate = Some(combo.win_rate);
                f.combo_strike_rate = Some(combo.strike_rate);
                f.combo_runs = Some(f64::from(combo.runs));
                f.combo_roi = Some(combo.roi);
            }
        }

        // Race context
        f.distance_f = race.distance_f;
        f.going_encoded = Some(encode_going(race.going.as_deref()));
        f.surface_encoded = Some(encode_surface(race.surface.as_deref()));
        f.race_type_encoded = Some(encode_race_type(race.race_type.as_deref()));
        f.race_class_encoded = encode_race_class(race.race_class.as_deref());
        f.prize_money = race.prize;

        // Runner
        f.runner_number = runner.number;
        f.draw = runner.draw;
        f.weight_lbs = runner.weight_lbs;
        f.ofr = runner.ofr;
        f.rpr = runner.rpr;
        f.ts = runner.ts;
        f.headgear_encoded = Some(encode_headgear(runner.headgear.as_deref()));

        debug!("Built per-runner features for {} in {}", runner.runner_id, race.race_id);
        Ok(f)
    }

    fn horse_history(
        &self,
        f: &mut FeatureVector,
        race: &RawRace,
        runner: &RawRunner,
        history: &[HistoryRow],
    ) {
        let career = EntityStats::from_history(history);
        f.horse_age = runner.age;
        f.horse_career_runs = Some(f64::from(career.runs));
        f.horse_career_wins = Some(f64::from(career.wins));
        f.horse_win_rate = Some(career.win_rate);
        f.horse_place_rate = Some(career.place_rate);
        f.horse_avg_position = career.avg_position;

        if let Some(course) = race.course.as_deref() {
            let (runs, wins) = tally(history, |r| r.course.as_deref() == Some(course));
            f.horse_course_wins = Some(f64::from(wins));
            f.horse_course_win_rate = Some(rate(wins, runs));
        }

        if let Some(distance_f) = race.distance_f {
            let tolerance = self.features.distance_tolerance_f;
            let (runs, wins) = tally(history, |r| {
                r.distance_f
                    .map_or(false, |d| (d - distance_f).abs() <= tolerance)
            });
            f.horse_distance_win_rate = Some(rate(wins, runs));
        }

        if let Some(going) = race.going.as_deref() {
            let going = going.trim().to_lowercase();
            let (runs, wins) = tally(history, |r| {
                r.going
                    .as_deref()
                    .map_or(false, |g| g.trim().to_lowercase() == going)
            });
            f.horse_going_win_rate = Some(rate(wins, runs));
        }

        f.horse_days_since_last = match history.first() {
            Some(last) => Some(days_between(last.date, race.date)),
            None => FormParser::parse_last_run_days(runner.last_run.as_deref()).map(f64::from),
        };
    }

    fn handler(&self, kind: EntityKind, id: &str, race: &RawRace) -> Result<HandlerFeatures> {
        let as_of = race.date;
        let win_rate = |window| -> Result<f64> {
            Ok(self.stats.stats(kind, id, window, as_of)?.win_rate)
        };
        let recent = self.stats.stats(kind, id, Window::Days90, as_of)?;
        let career = self.stats.stats(kind, id, Window::Career, as_of)?;

        Ok(HandlerFeatures {
            win_rate_14d: win_rate(Window::Days14)?,
            win_rate_30d: win_rate(Window::Days30)?,
            win_rate_90d: recent.win_rate,
            win_rate_365d: win_rate(Window::Days365)?,
            strike_rate: recent.strike_rate,
            roi: recent.roi,
            ae_ratio: recent.ae_ratio,
            course_win_rate: race
                .course
                .as_deref()
                .map(|c| career.course_win_rate(c).unwrap_or(0.0)),
            distance_win_rate: race
                .distance_f
                .map(|d| recent.distance_band_win_rate(d).unwrap_or(0.0)),
        })
    }
}

struct HandlerFeatures {
    win_rate_14d: f64,
    win_rate_30d: f64,
    win_rate_90d: f64,
    win_rate_365d: f64,
    strike_rate: f64,
    roi: f64,
    ae_ratio: f64,
    course_win_rate: Option<f64>,
    distance_win_rate: Option<f64>,
}

fn tally(history: &[HistoryRow], pred: impl Fn(&HistoryRow) -> bool) -> (u32, u32) {
    history
        .iter()
        .filter(|r| pred(r))
        .fold((0, 0), |(runs, wins), r| (runs + 1, wins + u32::from(r.won())))
}

fn rate(wins: u32, runs: u32) -> f64 {
    if runs == 0 {
        0.0
    } else {
        f64::from(wins) / f64::from(runs)
    }
}

fn days_between(earlier: NaiveDate, later: NaiveDate) -> f64 {
    (later - earlier).num_days() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RawResult;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn race(race_id: &str, day: &str) -> RawRace {
        RawRace {
            race_id: race_id.to_string(),
            date: date(day),
            course: Some("Ascot".to_string()),
            course_id: None,
            distance_f: Some(6.0),
            going: Some("Good".to_string()),
            surface: Some("Turf".to_string()),
            race_type: Some("Flat".to_string()),
            race_class: Some("Class 4".to_string()),
            prize: Some(5000.0),
            age_band: None,
            pattern: None,
            region: None,
        }
    }

    fn runner(race_id: &str, horse: &str, rpr: Option<f64>) -> RawRunner {
        RawRunner {
            runner_id: format!("{race_id}_{horse}"),
            race_id: race_id.to_string(),
            horse_id: horse.to_string(),
            horse_name: None,
            trainer_id: Some("trn_1".to_string()),
            jockey_id: Some("jky_1".to_string()),
            number: Some(1.0),
            draw: Some(2.0),
            age: Some(4.0),
            weight_lbs: Some(130.0),
            ofr: Some(80.0),
            rpr,
            ts: None,
            headgear: Some("b".to_string()),
            form: Some("1-3-2".to_string()),
            last_run: Some("21 days".to_string()),
        }
    }

    fn result(race_id: &str, horse: &str, position: u32, comment: &str) -> RawResult {
        RawResult {
            race_id: race_id.to_string(),
            horse_id: horse.to_string(),
            trainer_id: Some("trn_1".to_string()),
            jockey_id: Some("jky_1".to_string()),
            position: Some(position),
            beaten_lengths: None,
            time: None,
            sp_dec: Some(3.0),
            prize: None,
            tsr: Some(70.0),
            comment: Some(comment.to_string()),
        }
    }

    fn seeded() -> RaceRepository {
        let repo = RaceRepository::in_memory().unwrap();
        let mut past = race("p1", "2024-01-10");
        past.going = Some("GOOD".to_string());
        repo.insert_race(&past).unwrap();
        repo.insert_runner(&runner("p1", "h1", Some(90.0))).unwrap();
        repo.insert_result(&result("p1", "h1", 1, "made all")).unwrap();

        repo.insert_race(&race("today", "2024-02-01")).unwrap();
        repo.insert_runner(&runner("today", "h1", Some(100.0))).unwrap();
        repo.insert_runner(&runner("today", "h2", Some(80.0))).unwrap();
        repo.insert_result(&result("today", "h1", 2, "led")).unwrap();
        repo.insert_result(&result("today", "h2", 1, "held up")).unwrap();
        repo
    }

    #[test]
    fn test_horse_history_features() {
        let repo = seeded();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());

        let built = engine.build_race("today").unwrap().unwrap();
        let h1 = &built.runners[0].features;
        assert_eq!(h1.horse_career_runs, Some(1.0));
        assert_eq!(h1.horse_win_rate, Some(1.0));
        assert_eq!(h1.horse_course_wins, Some(1.0));
        assert_eq!(h1.horse_going_win_rate, Some(1.0));
        assert_eq!(h1.horse_days_since_last, Some(22.0));
        assert_eq!(h1.typical_running_style, Some(1.0));
        assert_eq!(h1.horse_best_tsr, Some(70.0));

        let h2 = &built.runners[1].features;
        assert_eq!(h2.horse_career_runs, Some(0.0));
        assert_eq!(h2.horse_win_rate, Some(0.0));
        assert_eq!(h2.horse_avg_position, None);
        assert_eq!(h2.horse_days_since_last, Some(21.0));
    }

    #[test]
    fn test_same_day_results_are_not_used() {
        let repo = seeded();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());

        let built = engine.build_race("today").unwrap().unwrap();
        let h1 = &built.runners[0].features;
        // Only p1 counts for the trainer, not either result from today
        assert_eq!(h1.trainer_win_rate_90d, Some(1.0));
        assert_eq!(h1.trainer_course_win_rate, Some(1.0));
        assert_eq!(h1.combo_runs, None);
    }

    #[test]
    fn test_targets_and_field_stage() {
        let repo = seeded();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());

        let built = engine.build_race("today").unwrap().unwrap();
        assert_eq!(built.runners.len(), 2);
        assert_eq!(built.targets.len(), 2);
        assert!(built.targets[1].won);

        let ranks: Vec<_> = built
            .runners
            .iter()
            .map(|r| r.features.horse_rpr_rank)
            .collect();
        assert_eq!(ranks, vec![Some(1.0), Some(2.0)]);
        assert_eq!(built.runners[0].features.going_encoded, Some(4.0));
        assert_eq!(built.runners[0].features.race_class_encoded, Some(4.0));
        assert_eq!(built.runners[0].features.headgear_encoded, Some(1.0));
    }

    #[test]
    fn test_missing_race_and_empty_field() {
        let repo = seeded();
        repo.insert_race(&race("empty", "2024-03-01")).unwrap();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());

        assert!(engine.build_race("nope").unwrap().is_none());
        assert!(engine.build_race("empty").unwrap().is_none());
    }

    #[test]
    fn test_no_handler_ids() {
        let repo = seeded();
        let stats = StatsAggregator::new(&repo, &StatsConfig::default());
        let engine = FeatureEngine::new(&repo, &stats, &FeaturesConfig::default(), &StatsConfig::default());

        let mut anon = runner("today", "h9", None);
        anon.trainer_id = None;
        anon.jockey_id = None;
        let f = engine.runner_features(&race("today", "2024-02-01"), &anon).unwrap();
        assert_eq!(f.trainer_win_rate_90d, None);
        assert_eq!(f.jockey_course_win_rate, None);
        assert_eq!(f.combo_win_rate, None);
    }
}
