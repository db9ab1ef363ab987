use serde::{Deserialize, Serialize};
use std::fmt;

/// CVSS v3 severity band (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Derives a severity band from a CVSS v3 base score, per spec §3:
    /// 9.0-10.0 CRITICAL, 7.0-8.9 HIGH, 4.0-6.9 MEDIUM, 0.1-3.9 LOW,
    /// absent/0.0 UNKNOWN.
    pub fn from_cvss_score(score: Option<f64>) -> Self {
        match score {
            Some(s) if s >= 9.0 => Severity::Critical,
            Some(s) if s >= 7.0 => Severity::High,
            Some(s) if s >= 4.0 => Severity::Medium,
            Some(s) if s > 0.0 => Severity::Low,
            _ => Severity::Unknown,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Ok(Severity::Critical),
            "HIGH" => Ok(Severity::High),
            "MEDIUM" => Ok(Severity::Medium),
            "LOW" => Ok(Severity::Low),
            "UNKNOWN" => Ok(Severity::Unknown),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_match_spec_boundaries() {
        assert_eq!(Severity::from_cvss_score(Some(10.0)), Severity::Critical);
        assert_eq!(Severity::from_cvss_score(Some(9.0)), Severity::Critical);
        assert_eq!(Severity::from_cvss_score(Some(8.9)), Severity::High);
        assert_eq!(Severity::from_cvss_score(Some(7.0)), Severity::High);
        assert_eq!(Severity::from_cvss_score(Some(6.9)), Severity::Medium);
        assert_eq!(Severity::from_cvss_score(Some(4.0)), Severity::Medium);
        assert_eq!(Severity::from_cvss_score(Some(3.9)), Severity::Low);
        assert_eq!(Severity::from_cvss_score(Some(0.1)), Severity::Low);
        assert_eq!(Severity::from_cvss_score(Some(0.0)), Severity::Unknown);
        assert_eq!(Severity::from_cvss_score(None), Severity::Unknown);
    }
}
