//! Wires a `Fetcher` to the `Merger` and `Store` as a single `Job` (spec
//! §2's data flow: Scheduler → Fetch job → Worker pool → Fetcher →
//! Merger/Scorer upserts → LLM enqueue). Kept out of `fetchers.rs` and
//! `merger.rs` so those stay pure components with no Store or Worker
//! dependency, mirroring the source codebase's separation between its
//! `vulnix` scanning logic and the `jobs.rs` glue that schedules it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OpenThreatConfig;
use crate::error::Result;
use crate::fetchers::bsi_cert::BsiCertFetcher;
use crate::fetchers::nvd::{CisaKevFetcher, NvdRecentFetcher};
use crate::fetchers::Fetcher;
use crate::llm::{Generator, LlmDrainJob};
use crate::merger::{self, MergeOutcome};
use crate::models::{IngestionRunStatus, PriorityClass};
use crate::scheduler::JobBuilder;
use crate::stats::StatsRefreshJob;
use crate::store::{IngestionCounts, Store};
use crate::worker::{CancelToken, Job};

/// A `Job` that runs one fetch-merge cycle for a single upstream source,
/// tracking an `IngestionRun` and enqueuing LLM tasks for rows that
/// qualify (spec §4.3 step 6).
pub struct FetchJob<F: Fetcher> {
    job_name: &'static str,
    fetcher: Arc<F>,
    store: Arc<dyn Store>,
    reconcile_kev: bool,
}

impl<F: Fetcher> FetchJob<F> {
    pub fn new(job_name: &'static str, fetcher: Arc<F>, store: Arc<dyn Store>) -> Self {
        Self { job_name, fetcher, store, reconcile_kev: false }
    }

    /// After a successful run, clears `exploited_in_the_wild` on any row
    /// whose only signal was this source and which this run's snapshot no
    /// longer lists (spec §3, §4.3: `cisa_kev` is a full-snapshot source).
    pub fn with_kev_reconciliation(mut self) -> Self {
        self.reconcile_kev = true;
        self
    }
}

#[async_trait]
impl<F: Fetcher> Job for FetchJob<F> {
    fn name(&self) -> &str {
        self.job_name
    }

    async fn run(&self, cancel: &CancelToken) -> Result<()> {
        let source = self.fetcher.source_tag();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.store.start_ingestion_run(source, run_id, started_at).await?;

        let checkpoint = self.store.get_checkpoint(source).await?;
        let mut counts = IngestionCounts::default();

        let outcome = run_fetch_and_merge(self.fetcher.as_ref(), self.store.as_ref(), checkpoint, cancel, &mut counts).await;

        let finished_at = Utc::now();
        match outcome {
            Ok((new_checkpoint, snapshot_cve_ids)) => {
                if let Some(checkpoint) = new_checkpoint {
                    self.store.set_checkpoint(source, &checkpoint).await?;
                }
                if self.reconcile_kev {
                    reconcile_kev_snapshot(self.store.as_ref(), &snapshot_cve_ids).await?;
                }
                self.store
                    .finish_ingestion_run(run_id, IngestionRunStatus::Success, counts, finished_at, None)
                    .await?;
                info!(job = self.job_name, source, inserted = counts.records_inserted, updated = counts.records_updated, failed = counts.records_failed, "fetch-merge run succeeded");
                Ok(())
            }
            Err(e) => {
                self.store
                    .finish_ingestion_run(run_id, IngestionRunStatus::Failed, counts, finished_at, Some(e.to_string()))
                    .await?;
                warn!(job = self.job_name, source, error = %e, "fetch-merge run failed, checkpoint not advanced");
                Err(e)
            }
        }
    }
}

/// Runs the fetch, then merges every record in stream order (spec §5:
/// "per-CVE upserts in a single run are strictly ordered by consumption
/// order"), checking `cancel` between records. On cancellation the
/// checkpoint from the fetch is discarded so the next run re-fetches the
/// same window (spec §8 scenario 5).
async fn run_fetch_and_merge<F: Fetcher + ?Sized>(
    fetcher: &F,
    store: &dyn Store,
    checkpoint: Option<String>,
    cancel: &CancelToken,
    counts: &mut IngestionCounts,
) -> Result<(Option<String>, std::collections::HashSet<String>)> {
    let output = fetcher.fetch(checkpoint, cancel).await?;
    counts.records_fetched = output.records.len() as i64;
    let source = fetcher.source_tag();
    let mut snapshot_cve_ids = std::collections::HashSet::new();

    for record in output.records {
        if cancel.is_cancelled() {
            return Err(crate::error::OpenThreatError::Cancelled);
        }
        if record.cve_id.trim().is_empty() {
            counts.records_failed += 1;
            continue;
        }

        let cve_id = record.cve_id.clone();
        snapshot_cve_ids.insert(cve_id.clone());
        let now = Utc::now();
        let before_after = Arc::new(std::sync::Mutex::new(None));
        let before_after_in_closure = before_after.clone();
        let outcome = store
            .upsert_vulnerability(
                &cve_id,
                Box::new(move |prior| {
                    let before = prior.as_ref().map(|r| r.vulnerability.clone());
                    let (row, outcome) = merger::merge_one(prior, record, source, now);
                    *before_after_in_closure.lock().expect("mutex not poisoned") = Some((before, row.vulnerability.clone()));
                    (row, outcome)
                }),
            )
            .await?;

        match outcome {
            MergeOutcome::Inserted => counts.records_inserted += 1,
            MergeOutcome::Updated => counts.records_updated += 1,
            MergeOutcome::Unchanged => {}
        }

        let (before, after) = before_after
            .lock()
            .expect("mutex not poisoned")
            .take()
            .expect("merge closure always runs before upsert_vulnerability returns");
        if let Some(class) = merger::llm_enqueue_decision(outcome, before.as_ref(), &after, now) {
            store.enqueue_llm_task(&cve_id, class, now).await?;
        }
    }

    Ok((output.new_checkpoint, snapshot_cve_ids))
}

/// Full-snapshot reconciliation for `cisa_kev` (spec §3, §4.3): after a
/// successful KEV run, any row whose only exploitation signal was
/// `cisa_kev` and which the snapshot no longer lists has its flag cleared.
pub async fn reconcile_kev_snapshot(store: &dyn Store, snapshot_cve_ids: &std::collections::HashSet<String>) -> Result<()> {
    let mut exploited = store.list_exploited().await?;
    let now = Utc::now();
    merger::reset_kev_absentees(&mut exploited, snapshot_cve_ids, now);
    store.save_rows(exploited).await
}

/// `clean-cache` (spec §4.5): currently a liveness no-op, since the Store
/// abstraction exposes no unbounded in-memory cache to evict. Kept as a
/// named job so the schedule table and CLI surface stay accurate if a
/// cache is introduced later.
struct CleanCacheJob {
    store: Arc<dyn Store>,
}

#[async_trait]
impl Job for CleanCacheJob {
    fn name(&self) -> &str {
        "clean-cache"
    }

    async fn run(&self, _cancel: &CancelToken) -> Result<()> {
        let _ = self.store.read_stats().await?;
        Ok(())
    }
}

/// Builds the name → `Job` registry shared by the Scheduler's automatic
/// dispatch and `openthreatctl`'s manual trigger path, so enqueuing
/// `fetch-nvd-recent` by hand runs exactly the job the schedule would
/// have fired.
pub fn build_job_registry(cfg: &OpenThreatConfig, store: Arc<dyn Store>, generator: Option<Arc<dyn Generator>>) -> HashMap<&'static str, JobBuilder> {
    let mut builders: HashMap<&'static str, JobBuilder> = HashMap::new();

    let nvd_api_key = cfg.fetchers.nvd_api_key.clone();
    let s = store.clone();
    builders.insert(
        "fetch-nvd-recent",
        Arc::new(move || Arc::new(FetchJob::new("fetch-nvd-recent", Arc::new(NvdRecentFetcher::new(nvd_api_key.clone())), s.clone())) as Arc<dyn Job>),
    );

    let nvd_api_key = cfg.fetchers.nvd_api_key.clone();
    let s = store.clone();
    builders.insert(
        "fetch-cisa-kev",
        Arc::new(move || {
            Arc::new(FetchJob::new("fetch-cisa-kev", Arc::new(CisaKevFetcher::new(nvd_api_key.clone())), s.clone()).with_kev_reconciliation()) as Arc<dyn Job>
        }),
    );

    let bsi_feed_url = cfg.fetchers.bsi_feed_url.clone();
    let s = store.clone();
    builders.insert(
        "fetch-bsi-cert",
        Arc::new(move || {
            let fetcher = match &bsi_feed_url {
                Some(url) => BsiCertFetcher::with_feed_url(url.clone()),
                None => BsiCertFetcher::new(),
            };
            Arc::new(FetchJob::new("fetch-bsi-cert", Arc::new(fetcher), s.clone())) as Arc<dyn Job>
        }),
    );

    let s = store.clone();
    builders.insert("refresh-stats", Arc::new(move || Arc::new(StatsRefreshJob::new(s.clone())) as Arc<dyn Job>));

    let s = store.clone();
    builders.insert("clean-cache", Arc::new(move || Arc::new(CleanCacheJob { store: s.clone() }) as Arc<dyn Job>));

    for (name, class) in [
        ("llm-drain-new", PriorityClass::High),
        ("llm-drain-high", PriorityClass::High),
        ("llm-drain-medium", PriorityClass::Medium),
        ("llm-drain-low", PriorityClass::Low),
    ] {
        let s = store.clone();
        let generator = generator.clone();
        builders.insert(name, Arc::new(move || Arc::new(LlmDrainJob::new(name, class, s.clone(), generator.clone())) as Arc<dyn Job>));
    }

    builders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::FetchOutput;
    use crate::models::NormalizedRecord;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticFetcher {
        tag: &'static str,
        records: Vec<NormalizedRecord>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        fn source_tag(&self) -> &'static str {
            self.tag
        }

        async fn fetch(&self, _checkpoint: Option<String>, _cancel: &CancelToken) -> Result<FetchOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchOutput {
                records: self.records.clone(),
                new_checkpoint: Some("checkpoint-1".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn fetch_job_inserts_and_enqueues_llm_task() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut record = NormalizedRecord::new("CVE-2024-9001", "nvd_recent");
        record.cvss_score = Some(9.8);
        record.published_at = Some(Utc::now());

        let fetcher = Arc::new(StaticFetcher {
            tag: "nvd_recent",
            records: vec![record],
            calls: AtomicUsize::new(0),
        });
        let job = FetchJob::new("fetch-nvd-recent", fetcher, store.clone());
        job.run(&CancelToken::new()).await.unwrap();

        let row = store.get_vulnerability("CVE-2024-9001").await.unwrap().unwrap();
        assert_eq!(row.vulnerability.severity, crate::models::Severity::Critical);

        let tasks = store
            .drain_llm_tasks(crate::models::PriorityClass::High, 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].cve_id, "CVE-2024-9001");

        let checkpoint = store.get_checkpoint("nvd_recent").await.unwrap();
        assert_eq!(checkpoint.as_deref(), Some("checkpoint-1"));
    }

    #[tokio::test]
    async fn kev_reconciliation_clears_absent_exploited_rows() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let mut stale = NormalizedRecord::new("CVE-2024-8001", "cisa_kev");
        stale.exploited_in_the_wild = true;
        stale.cvss_score = Some(5.0);
        let stale_fetcher = Arc::new(StaticFetcher {
            tag: "cisa_kev",
            records: vec![stale],
            calls: AtomicUsize::new(0),
        });
        FetchJob::new("fetch-cisa-kev", stale_fetcher, store.clone())
            .with_kev_reconciliation()
            .run(&CancelToken::new())
            .await
            .unwrap();

        let empty_snapshot: Arc<StaticFetcher> = Arc::new(StaticFetcher {
            tag: "cisa_kev",
            records: vec![],
            calls: AtomicUsize::new(0),
        });
        FetchJob::new("fetch-cisa-kev", empty_snapshot, store.clone())
            .with_kev_reconciliation()
            .run(&CancelToken::new())
            .await
            .unwrap();

        let row = store.get_vulnerability("CVE-2024-8001").await.unwrap().unwrap();
        assert!(!row.vulnerability.exploited_in_the_wild);
    }

    /// Wraps a `MemoryStore`, cancelling `token` once `upsert_vulnerability`
    /// has completed `cancel_after` calls, to deterministically exercise
    /// mid-run cancellation (spec §8 scenario 5) without racing a
    /// separately-scheduled task against the merge loop.
    struct CancellingStore {
        inner: MemoryStore,
        token: CancelToken,
        cancel_after: usize,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl Store for CancellingStore {
        async fn upsert_vulnerability(&self, cve_id: &str, merge: crate::store::MergeFn) -> Result<MergeOutcome> {
            let outcome = self.inner.upsert_vulnerability(cve_id, merge).await?;
            if self.upserts.fetch_add(1, Ordering::SeqCst) + 1 >= self.cancel_after {
                self.token.cancel();
            }
            Ok(outcome)
        }

        async fn get_vulnerability(&self, cve_id: &str) -> Result<Option<crate::merger::StoredRow>> {
            self.inner.get_vulnerability(cve_id).await
        }

        async fn search(&self, filter: &crate::store::SearchFilter) -> Result<Vec<crate::merger::StoredRow>> {
            self.inner.search(filter).await
        }

        async fn list_candidates_for_llm(&self, filter: crate::store::LlmCandidateFilter) -> Result<Vec<crate::merger::StoredRow>> {
            self.inner.list_candidates_for_llm(filter).await
        }

        async fn mark_llm_processed(&self, cve_id: &str, simple_title: &str, simple_description: &str, at: chrono::DateTime<Utc>) -> Result<()> {
            self.inner.mark_llm_processed(cve_id, simple_title, simple_description, at).await
        }

        async fn mark_llm_failed(&self, cve_id: &str, error: &str, at: chrono::DateTime<Utc>) -> Result<()> {
            self.inner.mark_llm_failed(cve_id, error, at).await
        }

        async fn enqueue_llm_task(&self, cve_id: &str, priority_class: PriorityClass, at: chrono::DateTime<Utc>) -> Result<()> {
            self.inner.enqueue_llm_task(cve_id, priority_class, at).await
        }

        async fn drain_llm_tasks(&self, priority_class: PriorityClass, limit: i64) -> Result<Vec<crate::models::LlmTask>> {
            self.inner.drain_llm_tasks(priority_class, limit).await
        }

        async fn start_ingestion_run(&self, source: &str, id: Uuid, now: chrono::DateTime<Utc>) -> Result<()> {
            self.inner.start_ingestion_run(source, id, now).await
        }

        async fn finish_ingestion_run(
            &self,
            id: Uuid,
            status: IngestionRunStatus,
            counts: IngestionCounts,
            now: chrono::DateTime<Utc>,
            error: Option<String>,
        ) -> Result<()> {
            self.inner.finish_ingestion_run(id, status, counts, now, error).await
        }

        async fn get_ingestion_run(&self, id: Uuid) -> Result<Option<crate::models::IngestionRun>> {
            self.inner.get_ingestion_run(id).await
        }

        async fn read_stats(&self) -> Result<crate::models::StatsCache> {
            self.inner.read_stats().await
        }

        async fn write_stats(&self, stats: crate::models::StatsCache) -> Result<()> {
            self.inner.write_stats(stats).await
        }

        async fn compute_stats(&self, now: chrono::DateTime<Utc>) -> Result<crate::models::StatsCache> {
            self.inner.compute_stats(now).await
        }

        async fn get_checkpoint(&self, source: &str) -> Result<Option<String>> {
            self.inner.get_checkpoint(source).await
        }

        async fn set_checkpoint(&self, source: &str, value: &str) -> Result<()> {
            self.inner.set_checkpoint(source, value).await
        }

        async fn list_exploited(&self) -> Result<Vec<crate::merger::StoredRow>> {
            self.inner.list_exploited().await
        }

        async fn save_rows(&self, rows: Vec<crate::merger::StoredRow>) -> Result<()> {
            self.inner.save_rows(rows).await
        }
    }

    #[tokio::test]
    async fn cancellation_mid_run_stops_checkpoint_advance_and_reports_failed() {
        let cancel = CancelToken::new();
        let store: Arc<dyn Store> = Arc::new(CancellingStore {
            inner: MemoryStore::new(),
            token: cancel.clone(),
            cancel_after: 10,
            upserts: AtomicUsize::new(0),
        });

        let records: Vec<NormalizedRecord> = (0..50)
            .map(|i| NormalizedRecord::new(format!("CVE-2024-{:04}", i), "nvd_recent"))
            .collect();
        let fetcher = Arc::new(StaticFetcher {
            tag: "nvd_recent",
            records,
            calls: AtomicUsize::new(0),
        });

        let job = FetchJob::new("fetch-nvd-recent", fetcher, store.clone());
        let err = job.run(&cancel).await.unwrap_err();
        assert!(matches!(err, crate::error::OpenThreatError::Cancelled));

        assert_eq!(store.get_checkpoint("nvd_recent").await.unwrap(), None);
        let inserted = store
            .search(&crate::store::SearchFilter {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap()
            .len();
        assert_eq!(inserted, 10);
    }

    #[tokio::test]
    async fn records_missing_cve_id_are_counted_as_failed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(StaticFetcher {
            tag: "bsi_cert",
            records: vec![NormalizedRecord::new("", "bsi_cert")],
            calls: AtomicUsize::new(0),
        });
        let mut counts = IngestionCounts::default();
        let (_checkpoint, _snapshot) = run_fetch_and_merge(fetcher.as_ref(), store.as_ref(), None, &CancelToken::new(), &mut counts)
            .await
            .unwrap();
        assert_eq!(counts.records_failed, 1);
        assert_eq!(counts.records_inserted, 0);
    }
}
