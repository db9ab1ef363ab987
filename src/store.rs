//! The Store abstraction (spec §4.1): the only shared mutable resource in
//! the system. All mutations are scoped to a single `cve_id` or to a
//! named table (`IngestionRun`, `StatsCache`).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::merger::{MergeOutcome, StoredRow};
use crate::models::{IngestionRun, IngestionRunStatus, LlmTask, PriorityClass, StatsCache};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// A closure that turns the prior row (if any) into a new row plus the
/// outcome to report, run inside the Store's per-CVE atomic section. Boxed
/// so `Store` stays object-safe despite the generic-looking operation.
pub type MergeFn = Box<dyn FnOnce(Option<StoredRow>) -> (StoredRow, MergeOutcome) + Send>;

/// Free-text search ordering, mirroring the index list in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    PriorityScore,
    PublishedAt,
    ModifiedAt,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub cve_id_prefix: Option<String>,
    pub text: Option<String>,
    pub sort: Option<SortKey>,
    pub limit: i64,
}

/// Candidate-selection filter for the LLM queue drain (spec §4.7).
#[derive(Debug, Clone, Copy)]
pub struct LlmCandidateFilter {
    pub priority_class: PriorityClass,
    pub limit: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Applies `merge` to the current row for `cve_id` inside a
    /// serializable, row-scoped section, persists the result, and reports
    /// the outcome (spec §4.1: "Upserts are serializable per cve_id").
    async fn upsert_vulnerability(&self, cve_id: &str, merge: MergeFn) -> Result<MergeOutcome>;

    async fn get_vulnerability(&self, cve_id: &str) -> Result<Option<StoredRow>>;

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<StoredRow>>;

    async fn list_candidates_for_llm(&self, filter: LlmCandidateFilter) -> Result<Vec<StoredRow>>;

    async fn mark_llm_processed(
        &self,
        cve_id: &str,
        simple_title: &str,
        simple_description: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn mark_llm_failed(&self, cve_id: &str, error: &str, at: DateTime<Utc>) -> Result<()>;

    async fn enqueue_llm_task(&self, cve_id: &str, priority_class: PriorityClass, at: DateTime<Utc>) -> Result<()>;

    async fn drain_llm_tasks(&self, priority_class: PriorityClass, limit: i64) -> Result<Vec<LlmTask>>;

    async fn start_ingestion_run(&self, source: &str, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    async fn finish_ingestion_run(
        &self,
        id: Uuid,
        status: IngestionRunStatus,
        counts: IngestionCounts,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()>;

    async fn get_ingestion_run(&self, id: Uuid) -> Result<Option<IngestionRun>>;

    async fn read_stats(&self) -> Result<StatsCache>;

    async fn write_stats(&self, stats: StatsCache) -> Result<()>;

    /// Aggregates the full catalog into a fresh `StatsCache` snapshot
    /// (spec §4.8: "one aggregation query... in a single transaction").
    /// Deliberately separate from `search`, whose `limit` is meant for
    /// paginated reads and is not a substitute for a full-table scan.
    async fn compute_stats(&self, now: DateTime<Utc>) -> Result<StatsCache>;

    /// Checkpoint persistence for incremental fetchers (spec §4.2).
    async fn get_checkpoint(&self, source: &str) -> Result<Option<String>>;

    async fn set_checkpoint(&self, source: &str, value: &str) -> Result<()>;

    /// All rows currently asserting exploitation, for the KEV full-snapshot
    /// reconciliation pass (spec §3, §4.3).
    async fn list_exploited(&self) -> Result<Vec<StoredRow>>;

    async fn save_rows(&self, rows: Vec<StoredRow>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionCounts {
    pub records_fetched: i64,
    pub records_inserted: i64,
    pub records_updated: i64,
    pub records_failed: i64,
}
