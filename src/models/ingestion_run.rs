use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Observability record for a single fetch/merge execution (spec §3).
/// Created in `Running` at job start and terminalized once; never mutated
/// thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionRunStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: Uuid,
    pub source: String,
    pub status: IngestionRunStatus,
    pub records_fetched: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub records_failed: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_summary: Option<String>,
}

impl IngestionRun {
    pub fn start(source: impl Into<String>, id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source: source.into(),
            status: IngestionRunStatus::Running,
            records_fetched: 0,
            records_inserted: 0,
            records_updated: 0,
            records_failed: 0,
            started_at: now,
            completed_at: None,
            duration_seconds: None,
            error_summary: None,
        }
    }

    pub fn finish(&mut self, status: IngestionRunStatus, now: DateTime<Utc>, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_seconds = Some((now - self.started_at).num_milliseconds() as f64 / 1000.0);
        self.error_summary = error;
    }
}
