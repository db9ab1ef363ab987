//! Priority scoring (spec §4.4).
//!
//! `score = 0.5 * E + 0.4 * (cvss / 10) + 0.1 * R`, where `E` is the
//! exploited-in-the-wild flag and `R` decays linearly to zero over a year
//! from the reference date.

use chrono::{DateTime, Utc};

const EXPLOITED_WEIGHT: f64 = 0.5;
const CVSS_WEIGHT: f64 = 0.4;
const RECENCY_WEIGHT: f64 = 0.1;
const RECENCY_HORIZON_DAYS: f64 = 365.0;

/// Pure inputs to the Scorer, decoupled from the `Vulnerability` struct so
/// the formula stays independently testable (spec §8: "Scorer determinism").
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub cvss_score: Option<f64>,
    pub exploited_in_the_wild: bool,
    pub reference_date: Option<DateTime<Utc>>,
}

/// Computes `priority_score`, rounded to 4 decimals, always within [0, 1].
pub fn score(inputs: ScoreInputs, now: DateTime<Utc>) -> f64 {
    let e = if inputs.exploited_in_the_wild { 1.0 } else { 0.0 };
    let cvss = inputs.cvss_score.unwrap_or(0.0).clamp(0.0, 10.0);

    let r = match inputs.reference_date {
        Some(date) => {
            let age_days = (now - date).num_seconds() as f64 / 86_400.0;
            let age_days = age_days.max(0.0);
            (1.0 - age_days / RECENCY_HORIZON_DAYS).clamp(0.0, 1.0)
        }
        None => 0.0,
    };

    let raw = EXPLOITED_WEIGHT * e + CVSS_WEIGHT * (cvss / 10.0) + RECENCY_WEIGHT * r;
    (raw.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn max_score_at_zero_age_full_cvss_exploited() {
        let now = Utc::now();
        let inputs = ScoreInputs {
            cvss_score: Some(10.0),
            exploited_in_the_wild: true,
            reference_date: Some(now),
        };
        assert_eq!(score(inputs, now), 1.0);
    }

    #[test]
    fn zero_score_old_unexploited_no_cvss() {
        let now = Utc::now();
        let inputs = ScoreInputs {
            cvss_score: Some(0.0),
            exploited_in_the_wild: false,
            reference_date: Some(now - Duration::days(400)),
        };
        assert_eq!(score(inputs, now), 0.0);
    }

    #[test]
    fn missing_reference_date_yields_zero_recency() {
        let now = Utc::now();
        let inputs = ScoreInputs {
            cvss_score: Some(5.0),
            exploited_in_the_wild: false,
            reference_date: None,
        };
        assert_eq!(score(inputs, now), 0.2);
    }

    #[test]
    fn scenario_one_nvd_recent_insert() {
        let now = Utc::now();
        let published = now - Duration::days(1);
        let inputs = ScoreInputs {
            cvss_score: Some(9.8),
            exploited_in_the_wild: false,
            reference_date: Some(published),
        };
        let expected = {
            let r = (1.0 - 1.0 / 365.0_f64).clamp(0.0, 1.0);
            ((0.4 * 0.98 + 0.1 * r) * 10_000.0).round() / 10_000.0
        };
        assert_eq!(score(inputs, now), expected);
    }

    #[test]
    fn exploitation_contributes_exactly_half() {
        let now = Utc::now();
        let reference = now - Duration::days(100);
        let without = score(
            ScoreInputs {
                cvss_score: Some(7.5),
                exploited_in_the_wild: false,
                reference_date: Some(reference),
            },
            now,
        );
        let with = score(
            ScoreInputs {
                cvss_score: Some(7.5),
                exploited_in_the_wild: true,
                reference_date: Some(reference),
            },
            now,
        );
        assert!((with - without - 0.5).abs() < 1e-9);
    }
}
