//! The programmatic job-trigger interface (spec §6): the single surface
//! `openthreatctl` and any future HTTP front end call through. Thin
//! wrapper over `WorkerPool` and `Scheduler` so neither needs to know
//! about a CLI or RPC transport.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{OpenThreatError, Result};
use crate::scheduler::{JobBuilder, ScheduledJobView, Scheduler};
use crate::worker::status::{self, WorkerSnapshot};
use crate::worker::{TaskStatus, WorkerPool};

/// Enqueues named jobs and reports on their progress. Built from the same
/// `JobBuilder` registry the Scheduler uses, so manually triggering
/// `fetch-nvd-recent` runs exactly the job the schedule would have fired.
pub struct Trigger {
    pool: WorkerPool,
    scheduler: Arc<Scheduler>,
    builders: HashMap<&'static str, JobBuilder>,
}

impl Trigger {
    pub fn new(pool: WorkerPool, scheduler: Arc<Scheduler>, builders: HashMap<&'static str, JobBuilder>) -> Self {
        Self { pool, scheduler, builders }
    }

    /// Builds and submits the named job, returning its task id. Rejects
    /// names outside the registered builder set rather than silently
    /// accepting arbitrary strings (spec §6).
    pub async fn enqueue_job(&self, name: &str) -> Result<Uuid> {
        let builder = self
            .builders
            .get(name)
            .ok_or_else(|| OpenThreatError::UnknownJob(name.to_string()))?;
        let job = builder();
        Ok(self.pool.submit(job).await)
    }

    pub async fn get_task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.pool.status(task_id).await
    }

    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        self.pool.cancel(task_id).await
    }

    pub async fn list_workers(&self) -> Vec<(String, WorkerSnapshot)> {
        status::list().await
    }

    pub async fn list_scheduled_jobs(&self) -> Vec<ScheduledJobView> {
        self.scheduler.list_scheduled(&self.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as OtResult;
    use crate::store::{MemoryStore, Store};
    use crate::worker::{CancelToken, Job, WorkerPoolConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopJob {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Job for NoopJob {
        fn name(&self) -> &str {
            "demo-job"
        }

        async fn run(&self, _cancel: &CancelToken) -> OtResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn make_trigger() -> (Trigger, Arc<AtomicU32>) {
        let (pool, _dispatcher) = WorkerPool::spawn(WorkerPoolConfig::default());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(Scheduler::bootstrap(store, false).await.unwrap());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_for_builder = calls.clone();
        let mut builders: HashMap<&'static str, JobBuilder> = HashMap::new();
        builders.insert(
            "demo-job",
            Arc::new(move || Arc::new(NoopJob { calls: calls_for_builder.clone() }) as Arc<dyn Job>),
        );
        (Trigger::new(pool, scheduler, builders), calls)
    }

    #[tokio::test]
    async fn enqueue_job_runs_the_registered_builder() {
        let (trigger, calls) = make_trigger().await;
        let task_id = trigger.enqueue_job("demo-job").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(trigger.get_task_status(task_id).await.is_some());
    }

    #[tokio::test]
    async fn enqueue_job_rejects_unregistered_names() {
        let (trigger, _calls) = make_trigger().await;
        let err = trigger.enqueue_job("nonexistent-job").await.unwrap_err();
        assert!(matches!(err, OpenThreatError::UnknownJob(_)));
    }
}
