//! CVSS v3.x vector string parsing and validation.
//!
//! The catalog stores `cvss_vector` as an opaque string (spec §3); this
//! module only validates the shape upstream fetchers hand us and extracts
//! the metrics a caller might want to inspect, it does not recompute a
//! base score from the vector (the Scorer works from `cvss_score` alone,
//! per spec §4.4).

use winnow::ascii::alpha1;
use winnow::combinator::{preceded, repeat, separated_pair};
use winnow::token::take_while;
use winnow::{ModalResult, Parser};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvssVersion {
    V30,
    V31,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvssVector {
    pub version: CvssVersion,
    pub metrics: Vec<(String, String)>,
}

impl CvssVector {
    pub fn metric(&self, key: &str) -> Option<&str> {
        self.metrics
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

fn version(input: &mut &str) -> ModalResult<CvssVersion> {
    preceded(
        "CVSS:",
        take_while(3.., |c: char| c.is_ascii_digit() || c == '.'),
    )
    .verify_map(|v: &str| match v {
        "3.0" => Some(CvssVersion::V30),
        "3.1" => Some(CvssVersion::V31),
        _ => None,
    })
    .parse_next(input)
}

fn metric_pair(input: &mut &str) -> ModalResult<(String, String)> {
    separated_pair(
        alpha1.map(|s: &str| s.to_string()),
        ':',
        take_while(1.., |c: char| c.is_ascii_alphanumeric()).map(|s: &str| s.to_string()),
    )
    .parse_next(input)
}

fn metrics(input: &mut &str) -> ModalResult<Vec<(String, String)>> {
    repeat(1.., preceded('/', metric_pair)).parse_next(input)
}

/// Parses a CVSS v3.0/v3.1 vector string of the form
/// `CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H`.
///
/// Returns `None` for anything that doesn't fit the shape; callers treat
/// an unparseable vector as "keep the string, skip structured validation"
/// rather than a hard failure, since it only gates optional cross-checks.
pub fn parse_vector(raw: &str) -> Option<CvssVector> {
    let mut input = raw.trim();
    let version = version.parse_next(&mut input).ok()?;
    let metrics = metrics.parse_next(&mut input).ok()?;
    if !input.is_empty() {
        return None;
    }
    Some(CvssVector { version, metrics })
}

/// Whether the mandatory base-metric group is present: AV, AC, PR, UI, S,
/// C, I, A. This is informational only, used to flag a suspicious vector
/// for logging rather than to reject the record it came from.
pub fn has_complete_base_metrics(vector: &CvssVector) -> bool {
    const REQUIRED: [&str; 8] = ["AV", "AC", "PR", "UI", "S", "C", "I", "A"];
    REQUIRED.iter().all(|key| vector.metric(key).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_v31_vector() {
        let v = parse_vector("CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H").unwrap();
        assert_eq!(v.version, CvssVersion::V31);
        assert_eq!(v.metric("AV"), Some("N"));
        assert_eq!(v.metric("A"), Some("H"));
        assert!(has_complete_base_metrics(&v));
    }

    #[test]
    fn parses_v30_vector() {
        let v = parse_vector("CVSS:3.0/AV:L/AC:H/PR:L/UI:R/S:C/C:L/I:L/A:N").unwrap();
        assert_eq!(v.version, CvssVersion::V30);
    }

    #[test]
    fn rejects_unsupported_version() {
        assert!(parse_vector("CVSS:2.0/AV:N/AC:L/Au:N/C:C/I:C/A:C").is_none());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_vector("not a vector").is_none());
    }

    #[test]
    fn incomplete_base_metrics_flagged() {
        let v = parse_vector("CVSS:3.1/AV:N/AC:L").unwrap();
        assert!(!has_complete_base_metrics(&v));
    }
}
