//! Fixed lookup tables for race-context categoricals.
//!
//! Unknown or missing tokens fall back to a default code rather than
//! failing.

use crate::parse::first_integer;

pub const DEFAULT_GOING: f64 = 4.0;
pub const DEFAULT_SURFACE: f64 = 1.0;
pub const DEFAULT_RACE_TYPE: f64 = 1.0;

/// Encode going, softest = 1 through hardest = 7.
pub fn encode_going(going: Option<&str>) -> f64 {
    let going = match going {
        Some(g) => g.trim().to_lowercase(),
        None => return DEFAULT_GOING,
    };
    match going.as_str() {
        "heavy" => 1.0,
        "soft" => 2.0,
        "good to soft" => 3.0,
        "good" => 4.0,
        "good to firm" => 5.0,
        "firm" => 6.0,
        "hard" => 7.0,
        // All-weather descriptions
        "standard" => 4.0,
        "slow" => 3.0,
        _ => DEFAULT_GOING,
    }
}

/// Encode surface (turf 1, synthetic 2, dirt 3).
pub fn encode_surface(surface: Option<&str>) -> f64 {
    let surface = match surface {
        Some(s) => s.trim().to_lowercase(),
        None => return DEFAULT_SURFACE,
    };
    match surface.as_str() {
        "turf" => 1.0,
        "aw" | "tapeta" | "polytrack" => 2.0,
        "dirt" => 3.0,
        _ => DEFAULT_SURFACE,
    }
}

/// Encode race type (flat 1, chase 2, hurdle 3, bumper 4).
pub fn encode_race_type(race_type: Option<&str>) -> f64 {
    let race_type = match race_type {
        Some(t) => t.trim().to_lowercase(),
        None => return DEFAULT_RACE_TYPE,
    };
    match race_type.as_str() {
        "flat" => 1.0,
        "chase" => 2.0,
        "hurdle" => 3.0,
        "nhf" | "bumper" => 4.0,
        _ => DEFAULT_RACE_TYPE,
    }
}

/// Class number from strings like "Class 4"; `None` for pattern races.
pub fn encode_race_class(race_class: Option<&str>) -> Option<f64> {
    race_class.and_then(first_integer).map(|n| n as f64)
}

/// Headgear present (any non-empty code) = 1.
pub fn encode_headgear(headgear: Option<&str>) -> f64 {
    match headgear.map(str::trim) {
        Some(h) if !h.is_empty() => 1.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_going() {
        assert_eq!(encode_going(Some("Heavy")), 1.0);
        assert_eq!(encode_going(Some("Good To Soft")), 3.0);
        assert_eq!(encode_going(Some("good")), 4.0);
        assert_eq!(encode_going(Some("Firm")), 6.0);
        assert_eq!(encode_going(Some("Standard")), 4.0);
        assert_eq!(encode_going(Some("Slow")), 3.0);
        assert_eq!(encode_going(Some("Yielding")), DEFAULT_GOING);
        assert_eq!(encode_going(None), DEFAULT_GOING);
    }

    #[test]
    fn test_encode_surface() {
        assert_eq!(encode_surface(Some("Turf")), 1.0);
        assert_eq!(encode_surface(Some("Tapeta")), 2.0);
        assert_eq!(encode_surface(Some("Polytrack")), 2.0);
        assert_eq!(encode_surface(Some("Dirt")), 3.0);
        assert_eq!(encode_surface(Some("Fibresand")), DEFAULT_SURFACE);
    }

    #[test]
    fn test_encode_race_type() {
        assert_eq!(encode_race_type(Some("Flat")), 1.0);
        assert_eq!(encode_race_type(Some("Chase")), 2.0);
        assert_eq!(encode_race_type(Some("Hurdle")), 3.0);
        assert_eq!(encode_race_type(Some("NH Flat")), DEFAULT_RACE_TYPE);
        assert_eq!(encode_race_type(Some("bumper")), 4.0);
    }

    #[test]
    fn test_encode_race_class() {
        assert_eq!(encode_race_class(Some("Class 4")), Some(4.0));
        assert_eq!(encode_race_class(Some("Group 1")), Some(1.0));
        assert_eq!(encode_race_class(Some("Listed")), None);
        assert_eq!(encode_race_class(None), None);
    }

    #[test]
    fn test_encode_headgear() {
        assert_eq!(encode_headgear(Some("b")), 1.0);
        assert_eq!(encode_headgear(Some(" ")), 0.0);
        assert_eq!(encode_headgear(None), 0.0);
    }
}
