use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single-row materialization of catalog aggregates (spec §3, §4.8). Only
/// the Stats refresher writes it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsCache {
    pub total: i64,
    pub exploited: i64,
    pub critical: i64,
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub unknown: i64,
    pub published_last_7_days: i64,
    pub last_calculated_at: DateTime<Utc>,
}

impl StatsCache {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            exploited: 0,
            critical: 0,
            high: 0,
            medium: 0,
            low: 0,
            unknown: 0,
            published_last_7_days: 0,
            last_calculated_at: now,
        }
    }
}
