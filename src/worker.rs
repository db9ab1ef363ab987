//! Bounded worker pool (spec §4.6): executes jobs handed to it by the
//! Scheduler or an external trigger, with per-job timeouts, a task-state
//! registry, retries, and per-job-name serialization.

pub mod status;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{OpenThreatError, Result};

/// Cooperative cancellation signal threaded through fetchers and job
/// bodies. Checked at every suspension point (spec §5): upstream calls,
/// Store calls, and iteration boundaries between emitted records.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub task_id: Uuid,
    pub job_name: String,
    pub state: TaskState,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TaskStatus {
    fn pending(task_id: Uuid, job_name: &str) -> Self {
        Self {
            task_id,
            job_name: job_name.to_string(),
            state: TaskState::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// A unit of work the pool can execute. Implementors must check `cancel`
/// at every iteration boundary (spec §5).
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: &CancelToken) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub hard_timeout: Duration,
    pub soft_timeout: Duration,
    pub retry: WorkerRetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            hard_timeout: Duration::from_secs(60 * 60),
            soft_timeout: Duration::from_secs(55 * 60),
            retry: WorkerRetryPolicy::default(),
        }
    }
}

/// Retry policy for job execution failures (spec §4.6): up to 3 attempts,
/// base 30s, factor 2, jitter +/-20%. Distinct from the fetcher-level HTTP
/// retry policy in `fetchers::RetryPolicy`.
#[derive(Debug, Clone, Copy)]
pub struct WorkerRetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for WorkerRetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl WorkerRetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        let spread = base * self.jitter;
        let jittered = rand::thread_rng().gen_range((base - spread).max(0.0)..=(base + spread));
        Duration::from_secs_f64(jittered)
    }
}

struct QueuedJob {
    task_id: Uuid,
    job: Arc<dyn Job>,
}

struct Shared {
    registry: Mutex<HashMap<Uuid, TaskStatus>>,
    running_names: Mutex<HashSet<String>>,
    pending_by_name: Mutex<HashMap<String, Uuid>>,
    config: WorkerPoolConfig,
}

/// Bounded pool of N workers draining a single FIFO queue. Jobs sharing a
/// name never run concurrently; distinct names run with parallelism up to
/// `concurrency` (spec §4.6).
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    cancel_tokens: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
}

impl WorkerPool {
    pub fn spawn(config: WorkerPoolConfig) -> (Self, JoinHandle<()>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            running_names: Mutex::new(HashSet::new()),
            pending_by_name: Mutex::new(HashMap::new()),
            config,
        });
        let pool = Self {
            shared: shared.clone(),
            queue_tx,
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
        };
        let dispatcher = tokio::spawn(Self::dispatch_loop(shared, queue_rx, pool.cancel_tokens.clone()));
        (pool, dispatcher)
    }

    /// Enqueues `job`; a manual re-fire while a job of the same name is
    /// already running is coalesced (spec §4.5: the pending trigger is
    /// dropped, noted in logs).
    pub async fn submit(&self, job: Arc<dyn Job>) -> Uuid {
        let name = job.name().to_string();
        let mut pending = self.shared.pending_by_name.lock().await;
        let running = self.shared.running_names.lock().await;
        if running.contains(&name) {
            if let Some(existing) = pending.get(&name) {
                info!(job = %name, task_id = %existing, "duplicate trigger coalesced, job already running");
                return *existing;
            }
        }
        drop(running);

        let task_id = Uuid::new_v4();
        pending.insert(name.clone(), task_id);
        drop(pending);

        self.shared
            .registry
            .lock()
            .await
            .insert(task_id, TaskStatus::pending(task_id, &name));
        let _ = self.queue_tx.send(QueuedJob { task_id, job });
        task_id
    }

    pub async fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.shared.registry.lock().await.get(&task_id).cloned()
    }

    pub async fn cancel(&self, task_id: Uuid) -> bool {
        if let Some(token) = self.cancel_tokens.lock().await.get(&task_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn active_task_count(&self) -> usize {
        self.shared.running_names.lock().await.len()
    }

    /// Signals cancellation to every task currently tracked with a live
    /// `CancelToken`, for cooperative shutdown. Jobs still honor their own
    /// checkpoint discipline; this only asks them to stop at their next
    /// cancellation check.
    pub async fn cancel_all(&self) {
        for token in self.cancel_tokens.lock().await.values() {
            token.cancel();
        }
    }

    async fn dispatch_loop(
        shared: Arc<Shared>,
        mut queue_rx: mpsc::UnboundedReceiver<QueuedJob>,
        cancel_tokens: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
    ) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(shared.config.concurrency));
        let mut deferred: VecDeque<QueuedJob> = VecDeque::new();
        let wake = Arc::new(Notify::new());

        loop {
            let queued = if let Some(job) = deferred.pop_front() {
                job
            } else {
                match queue_rx.recv().await {
                    Some(job) => job,
                    None => break,
                }
            };

            let name = queued.job.name().to_string();
            {
                let mut running = shared.running_names.lock().await;
                if running.contains(&name) {
                    deferred.push_back(queued);
                    let wake_spawn = wake.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        wake_spawn.notify_one();
                    });
                    wake.notified().await;
                    continue;
                }
                running.insert(name.clone());
            }
            Self::publish_status(&shared).await;

            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let shared = shared.clone();
            let cancel_tokens = cancel_tokens.clone();
            let task_id = queued.task_id;
            tokio::spawn(async move {
                let token = CancelToken::new();
                cancel_tokens.lock().await.insert(task_id, token.clone());
                Self::execute(&shared, task_id, queued.job, &token).await;
                cancel_tokens.lock().await.remove(&task_id);
                shared.running_names.lock().await.remove(&name);
                // Only the execution's own entry is cleared, never a newer one:
                // while this job is running, submit() coalesces into this
                // task_id rather than inserting a replacement for the name.
                let mut pending = shared.pending_by_name.lock().await;
                if pending.get(&name) == Some(&task_id) {
                    pending.remove(&name);
                }
                drop(pending);
                Self::publish_status(&shared).await;
                drop(permit);
            });
        }
    }

    /// Publishes the pool's current occupancy to the process-wide status
    /// board backing `ListWorkers` (spec §6), under the fixed key
    /// `"default"` since this pipeline runs a single pool.
    async fn publish_status(shared: &Arc<Shared>) {
        let active_tasks = shared.running_names.lock().await.len();
        status::record(
            "default",
            status::WorkerSnapshot {
                active_tasks,
                registered_tasks: shared.config.concurrency,
            },
        )
        .await;
    }

    async fn execute(shared: &Arc<Shared>, task_id: Uuid, job: Arc<dyn Job>, cancel: &CancelToken) {
        let retry = shared.config.retry;
        let mut attempt = 0;

        loop {
            attempt += 1;
            {
                let mut registry = shared.registry.lock().await;
                if let Some(status) = registry.get_mut(&task_id) {
                    status.state = TaskState::Started;
                    status.attempt = attempt;
                    status.started_at = Some(Utc::now());
                }
            }

            let soft = shared.config.soft_timeout;
            let hard = shared.config.hard_timeout;
            let cancel_for_soft = cancel.clone();
            let soft_canceller = tokio::spawn(async move {
                tokio::time::sleep(soft).await;
                cancel_for_soft.cancel();
            });

            let result = tokio::time::timeout(hard, job.run(cancel)).await;
            soft_canceller.abort();

            let outcome = match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(OpenThreatError::Cancelled),
            };

            match outcome {
                Ok(()) => {
                    let mut registry = shared.registry.lock().await;
                    if let Some(status) = registry.get_mut(&task_id) {
                        status.state = TaskState::Success;
                        status.finished_at = Some(Utc::now());
                    }
                    info!(job = %job.name(), %task_id, attempt, "job succeeded");
                    return;
                }
                Err(e) => {
                    let retryable = e.retryable() && attempt < retry.max_attempts;
                    {
                        let mut registry = shared.registry.lock().await;
                        if let Some(status) = registry.get_mut(&task_id) {
                            status.last_error = Some(e.to_string());
                            status.state = if retryable { TaskState::Retry } else { TaskState::Failure };
                            if !retryable {
                                status.finished_at = Some(Utc::now());
                            }
                        }
                    }
                    if !retryable {
                        error!(job = %job.name(), %task_id, attempt, error = %e, "job failed, not retrying");
                        return;
                    }
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(job = %job.name(), %task_id, attempt, error = %e, ?delay, "job failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingJob {
        calls: Arc<AtomicU32>,
        name: &'static str,
        fail_until: u32,
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _cancel: &CancelToken) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_until {
                return Err(OpenThreatError::TransientUpstream("boom".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let (pool, _dispatcher) = WorkerPool::spawn(WorkerPoolConfig {
            retry: WorkerRetryPolicy {
                base: Duration::from_millis(1),
                factor: 1.0,
                jitter: 0.0,
                max_attempts: 3,
            },
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let job = Arc::new(CountingJob {
            calls: calls.clone(),
            name: "flaky",
            fail_until: 2,
        });

        let task_id = pool.submit(job).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = pool.status(task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn same_name_jobs_are_serialized() {
        let (pool, _dispatcher) = WorkerPool::spawn(WorkerPoolConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let job_a = Arc::new(CountingJob {
            calls: calls.clone(),
            name: "solo",
            fail_until: 0,
        });
        let job_b = Arc::new(CountingJob {
            calls: calls.clone(),
            name: "solo",
            fail_until: 0,
        });

        let t1 = pool.submit(job_a).await;
        let t2 = pool.submit(job_b).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.status(t1).await.unwrap().state, TaskState::Success);
        assert_eq!(pool.status(t2).await.unwrap().state, TaskState::Success);
    }

    struct SlowJob {
        calls: Arc<AtomicU32>,
        name: &'static str,
        run_for: Duration,
    }

    #[async_trait]
    impl Job for SlowJob {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, _cancel: &CancelToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.run_for).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn re_fire_while_job_is_actively_executing_is_coalesced_not_double_run() {
        let (pool, _dispatcher) = WorkerPool::spawn(WorkerPoolConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let job = Arc::new(SlowJob {
            calls: calls.clone(),
            name: "slow",
            run_for: Duration::from_millis(150),
        });

        let t1 = pool.submit(job.clone()).await;
        // give dispatch_loop time to dequeue and mark "slow" running, well
        // before the job's 150ms body completes.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let t2 = pool.submit(job).await;

        assert_eq!(t1, t2, "a re-fire during active execution must return the running task's id");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "the job body must run exactly once, not once per submit");
        assert_eq!(pool.status(t1).await.unwrap().state, TaskState::Success);
    }
}
