//! In-memory `Store` implementation used by integration tests so the
//! pipeline can be exercised without a live Postgres instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{OpenThreatError, Result};
use crate::merger::{MergeOutcome, StoredRow};
use crate::models::{IngestionRun, IngestionRunStatus, LlmTask, LlmTaskState, PriorityClass, StatsCache};

use super::{IngestionCounts, LlmCandidateFilter, MergeFn, SearchFilter, SortKey, Store};

#[derive(Default)]
struct Inner {
    rows: HashMap<String, StoredRow>,
    runs: HashMap<Uuid, IngestionRun>,
    checkpoints: HashMap<String, String>,
    llm_tasks: HashMap<String, LlmTask>,
    stats: Option<StatsCache>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_vulnerability(&self, cve_id: &str, merge: MergeFn) -> Result<MergeOutcome> {
        let mut inner = self.inner.lock().await;
        let prior = inner.rows.get(cve_id).cloned();
        let (new_row, outcome) = merge(prior);
        inner.rows.insert(cve_id.to_string(), new_row);
        Ok(outcome)
    }

    async fn get_vulnerability(&self, cve_id: &str) -> Result<Option<StoredRow>> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(cve_id).cloned())
    }

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<StoredRow>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<StoredRow> = inner
            .rows
            .values()
            .filter(|row| {
                filter
                    .cve_id_prefix
                    .as_ref()
                    .is_none_or(|prefix| row.vulnerability.cve_id.starts_with(prefix.as_str()))
            })
            .filter(|row| match &filter.text {
                None => true,
                Some(text) => {
                    let needle = text.to_lowercase();
                    row.vulnerability.cve_id.to_lowercase().contains(&needle)
                        || row
                            .vulnerability
                            .title
                            .as_deref()
                            .unwrap_or_default()
                            .to_lowercase()
                            .contains(&needle)
                        || row
                            .vulnerability
                            .description
                            .as_deref()
                            .unwrap_or_default()
                            .to_lowercase()
                            .contains(&needle)
                }
            })
            .cloned()
            .collect();

        match filter.sort {
            Some(SortKey::PriorityScore) => rows.sort_by(|a, b| {
                b.vulnerability
                    .priority_score
                    .partial_cmp(&a.vulnerability.priority_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            }),
            Some(SortKey::PublishedAt) => {
                rows.sort_by(|a, b| b.vulnerability.published_at.cmp(&a.vulnerability.published_at))
            }
            Some(SortKey::ModifiedAt) => {
                rows.sort_by(|a, b| b.vulnerability.modified_at.cmp(&a.vulnerability.modified_at))
            }
            None => {}
        }

        if filter.limit > 0 {
            rows.truncate(filter.limit as usize);
        }
        Ok(rows)
    }

    async fn list_candidates_for_llm(&self, filter: LlmCandidateFilter) -> Result<Vec<StoredRow>> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<StoredRow> = inner
            .llm_tasks
            .values()
            .filter(|task| {
                task.priority_class == filter.priority_class && task.state == LlmTaskState::Pending
            })
            .filter_map(|task| inner.rows.get(&task.cve_id).cloned())
            .collect();
        candidates.truncate(filter.limit.max(0) as usize);
        Ok(candidates)
    }

    async fn mark_llm_processed(
        &self,
        cve_id: &str,
        simple_title: &str,
        simple_description: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(row) = inner.rows.get_mut(cve_id) {
            row.vulnerability.simple_title = Some(simple_title.to_string());
            row.vulnerability.simple_description = Some(simple_description.to_string());
            row.vulnerability.llm_processed = true;
            row.vulnerability.llm_processed_at = Some(at);
            row.vulnerability.updated_at = at;
        }
        if let Some(task) = inner.llm_tasks.get_mut(cve_id) {
            task.state = LlmTaskState::Done;
        }
        Ok(())
    }

    async fn mark_llm_failed(&self, cve_id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.llm_tasks.get_mut(cve_id) {
            task.attempts += 1;
            task.last_error = Some(error.to_string());
            if task.attempts >= 3 {
                task.state = LlmTaskState::Failed;
            }
        }
        let _ = at;
        Ok(())
    }

    async fn enqueue_llm_task(&self, cve_id: &str, priority_class: PriorityClass, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .llm_tasks
            .entry(cve_id.to_string())
            .and_modify(|task| task.coalesce(priority_class, at))
            .or_insert_with(|| LlmTask::new(cve_id, priority_class, at));
        Ok(())
    }

    async fn drain_llm_tasks(&self, priority_class: PriorityClass, limit: i64) -> Result<Vec<LlmTask>> {
        let mut inner = self.inner.lock().await;
        let mut drained = Vec::new();
        for task in inner.llm_tasks.values_mut() {
            if task.priority_class == priority_class && task.state == LlmTaskState::Pending {
                task.state = LlmTaskState::InProgress;
                drained.push(task.clone());
                if drained.len() as i64 >= limit {
                    break;
                }
            }
        }
        Ok(drained)
    }

    async fn start_ingestion_run(&self, source: &str, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.runs.insert(id, IngestionRun::start(source, id, now));
        Ok(())
    }

    async fn finish_ingestion_run(
        &self,
        id: Uuid,
        status: IngestionRunStatus,
        counts: IngestionCounts,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| OpenThreatError::InvariantViolation(format!("unknown ingestion run {id}")))?;
        run.records_fetched = counts.records_fetched;
        run.records_inserted = counts.records_inserted;
        run.records_updated = counts.records_updated;
        run.records_failed = counts.records_failed;
        run.finish(status, now, error);
        Ok(())
    }

    async fn get_ingestion_run(&self, id: Uuid) -> Result<Option<IngestionRun>> {
        let inner = self.inner.lock().await;
        Ok(inner.runs.get(&id).cloned())
    }

    async fn read_stats(&self) -> Result<StatsCache> {
        let inner = self.inner.lock().await;
        Ok(inner.stats.unwrap_or_else(|| StatsCache::empty(Utc::now())))
    }

    async fn write_stats(&self, stats: StatsCache) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.stats = Some(stats);
        Ok(())
    }

    async fn compute_stats(&self, now: DateTime<Utc>) -> Result<StatsCache> {
        let inner = self.inner.lock().await;
        let mut stats = StatsCache::empty(now);
        for row in inner.rows.values() {
            let v = &row.vulnerability;
            stats.total += 1;
            if v.exploited_in_the_wild {
                stats.exploited += 1;
            }
            match v.severity {
                crate::models::Severity::Critical => stats.critical += 1,
                crate::models::Severity::High => stats.high += 1,
                crate::models::Severity::Medium => stats.medium += 1,
                crate::models::Severity::Low => stats.low += 1,
                crate::models::Severity::Unknown => stats.unknown += 1,
            }
            if let Some(published_at) = v.published_at {
                if (now - published_at).num_days() <= 7 {
                    stats.published_last_7_days += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().await;
        Ok(inner.checkpoints.get(source).cloned())
    }

    async fn set_checkpoint(&self, source: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.insert(source.to_string(), value.to_string());
        Ok(())
    }

    async fn list_exploited(&self) -> Result<Vec<StoredRow>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.vulnerability.exploited_in_the_wild)
            .cloned()
            .collect())
    }

    async fn save_rows(&self, rows: Vec<StoredRow>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for row in rows {
            inner.rows.insert(row.vulnerability.cve_id.clone(), row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::{merge_one, FieldProvenance};
    use crate::models::NormalizedRecord;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut rec = NormalizedRecord::new("CVE-2024-9999", "nvd_recent");
        rec.cvss_score = Some(5.0);

        let outcome = store
            .upsert_vulnerability("CVE-2024-9999", Box::new(move |prior| merge_one(prior, rec, "nvd_recent", now)))
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Inserted);

        let fetched = store.get_vulnerability("CVE-2024-9999").await.unwrap();
        assert!(fetched.is_some());
        let _ = FieldProvenance::default();
    }

    #[tokio::test]
    async fn llm_coalescing_keeps_highest_class() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .enqueue_llm_task("CVE-2024-1", PriorityClass::Low, now)
            .await
            .unwrap();
        store
            .enqueue_llm_task("CVE-2024-1", PriorityClass::High, now)
            .await
            .unwrap();

        let drained = store.drain_llm_tasks(PriorityClass::High, 10).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].cve_id, "CVE-2024-1");
    }
}
