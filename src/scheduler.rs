//! Cron-like scheduler (spec §4.5): owns a sorted set of `{job_name,
//! next_fire_utc}` and hands due jobs to the Worker pool on each tick.
//! Missed-fire state survives restarts via the Store's checkpoint table,
//! the same mechanism fetchers use for their own checkpoints (spec §4.1).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;
use crate::worker::{Job, TaskState, WorkerPool};

#[derive(Debug, Clone, Copy)]
pub enum JobSchedule {
    Interval(StdDuration),
    DailyAt { hour: u32, minute: u32 },
}

impl JobSchedule {
    fn next_after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            JobSchedule::Interval(interval) => {
                from + Duration::from_std(*interval).unwrap_or(Duration::zero())
            }
            JobSchedule::DailyAt { hour, minute } => {
                let candidate = from
                    .date_naive()
                    .and_hms_opt(*hour, *minute, 0)
                    .expect("valid hour/minute")
                    .and_utc();
                if candidate > from {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
        }
    }
}

pub struct ScheduledJobSpec {
    pub name: &'static str,
    pub schedule: JobSchedule,
}

/// The nine named jobs of spec §4.5, in table order.
pub const JOB_TABLE: &[ScheduledJobSpec] = &[
    ScheduledJobSpec {
        name: "fetch-nvd-recent",
        schedule: JobSchedule::Interval(StdDuration::from_secs(2 * 3600)),
    },
    ScheduledJobSpec {
        name: "fetch-cisa-kev",
        schedule: JobSchedule::DailyAt { hour: 9, minute: 0 },
    },
    ScheduledJobSpec {
        name: "fetch-bsi-cert",
        schedule: JobSchedule::DailyAt { hour: 8, minute: 0 },
    },
    ScheduledJobSpec {
        name: "refresh-stats",
        schedule: JobSchedule::Interval(StdDuration::from_secs(15 * 60)),
    },
    ScheduledJobSpec {
        name: "clean-cache",
        schedule: JobSchedule::DailyAt { hour: 3, minute: 0 },
    },
    ScheduledJobSpec {
        name: "llm-drain-new",
        schedule: JobSchedule::Interval(StdDuration::from_secs(5 * 60)),
    },
    ScheduledJobSpec {
        name: "llm-drain-high",
        schedule: JobSchedule::Interval(StdDuration::from_secs(10 * 60)),
    },
    ScheduledJobSpec {
        name: "llm-drain-medium",
        schedule: JobSchedule::Interval(StdDuration::from_secs(30 * 60)),
    },
    ScheduledJobSpec {
        name: "llm-drain-low",
        schedule: JobSchedule::Interval(StdDuration::from_secs(2 * 3600)),
    },
];

fn checkpoint_key(job_name: &str) -> String {
    format!("scheduler:{job_name}")
}

struct JobState {
    next_fire_utc: DateTime<Utc>,
    last_task_id: Option<Uuid>,
}

/// A function that builds a fresh `Job` instance for a scheduled job name.
/// Kept separate from `JOB_TABLE` so the scheduler has no compile-time
/// dependency on the fetcher/merger/LLM wiring the daemon assembles.
pub type JobBuilder = Arc<dyn Fn() -> Arc<dyn Job> + Send + Sync>;

pub struct ScheduledJobView {
    pub name: &'static str,
    pub next_fire_utc: DateTime<Utc>,
    pub last_result: Option<TaskState>,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    state: Mutex<HashMap<&'static str, JobState>>,
}

impl Scheduler {
    /// Loads each job's persisted last-fire checkpoint and computes its
    /// initial `next_fire_utc`. A job with no checkpoint, or whose
    /// scheduled time was missed while the process was down, fires once
    /// immediately when `run_missed_on_startup` is set (spec §4.5).
    pub async fn bootstrap(store: Arc<dyn Store>, run_missed_on_startup: bool) -> Result<Self> {
        let now = Utc::now();
        let mut state = HashMap::new();
        for spec in JOB_TABLE {
            let persisted = store.get_checkpoint(&checkpoint_key(spec.name)).await?;
            let next_fire_utc = match persisted.as_deref().and_then(|s| DateTime::parse_from_rfc3339(s).ok()) {
                Some(last_fire) => {
                    let scheduled_next = spec.schedule.next_after(last_fire.with_timezone(&Utc));
                    if run_missed_on_startup && scheduled_next <= now {
                        now
                    } else {
                        scheduled_next
                    }
                }
                None => now,
            };
            state.insert(
                spec.name,
                JobState {
                    next_fire_utc,
                    last_task_id: None,
                },
            );
        }
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Returns job names due at `now`, advancing their `next_fire_utc` and
    /// persisting the fire time as each job's checkpoint.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        let mut state = self.state.lock().await;
        let mut due = Vec::new();
        for spec in JOB_TABLE {
            let Some(job_state) = state.get_mut(spec.name) else {
                continue;
            };
            if job_state.next_fire_utc <= now {
                due.push(spec.name);
                job_state.next_fire_utc = spec.schedule.next_after(now);
                if let Err(e) = self.store.set_checkpoint(&checkpoint_key(spec.name), &now.to_rfc3339()).await {
                    warn!(job = spec.name, error = %e, "failed to persist scheduler checkpoint");
                }
            }
        }
        due
    }

    async fn record_dispatch(&self, name: &str, task_id: Uuid) {
        if let Some(job_state) = self.state.lock().await.get_mut(name) {
            job_state.last_task_id = Some(task_id);
        }
    }

    pub async fn list_scheduled(&self, pool: &WorkerPool) -> Vec<ScheduledJobView> {
        let state = self.state.lock().await;
        let mut views = Vec::with_capacity(JOB_TABLE.len());
        for spec in JOB_TABLE {
            let Some(job_state) = state.get(spec.name) else {
                continue;
            };
            let last_result = match job_state.last_task_id {
                Some(task_id) => pool.status(task_id).await.map(|s| s.state),
                None => None,
            };
            views.push(ScheduledJobView {
                name: spec.name,
                next_fire_utc: job_state.next_fire_utc,
                last_result,
            });
        }
        views
    }

    /// Ticks at `tick_interval`, dispatching due jobs to `pool` using the
    /// builder registered under each job's name in `builders`. A job with
    /// no registered builder is skipped with a warning rather than
    /// panicking the loop.
    pub async fn run(self: Arc<Self>, pool: WorkerPool, tick_interval: StdDuration, builders: HashMap<&'static str, JobBuilder>) {
        info!(jobs = JOB_TABLE.len(), "scheduler started");
        loop {
            tokio::time::sleep(tick_interval).await;
            let now = Utc::now();
            for name in self.due_jobs(now).await {
                match builders.get(name) {
                    Some(builder) => {
                        let job = builder();
                        let task_id = pool.submit(job).await;
                        self.record_dispatch(name, task_id).await;
                    }
                    None => warn!(job = name, "no job builder registered, skipping fire"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc::now().date_naive().and_hms_opt(hour, minute, 0).unwrap().and_utc()
    }

    #[test]
    fn daily_schedule_rolls_to_tomorrow_once_passed() {
        let schedule = JobSchedule::DailyAt { hour: 9, minute: 0 };
        let from = at(10, 0);
        let next = schedule.next_after(from);
        assert!(next > from);
        assert_eq!(next.format("%H:%M").to_string(), "09:00");
    }

    #[test]
    fn interval_schedule_advances_by_fixed_duration() {
        let schedule = JobSchedule::Interval(StdDuration::from_secs(900));
        let from = Utc::now();
        let next = schedule.next_after(from);
        assert_eq!((next - from).num_seconds(), 900);
    }

    #[tokio::test]
    async fn bootstrap_with_no_checkpoints_fires_every_job_immediately() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::bootstrap(store, true).await.unwrap();
        let due = scheduler.due_jobs(Utc::now()).await;
        assert_eq!(due.len(), JOB_TABLE.len());
    }

    #[tokio::test]
    async fn job_not_yet_due_is_skipped() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::bootstrap(store, false).await.unwrap();
        let now = Utc::now();
        scheduler.due_jobs(now).await;
        let due_again = scheduler.due_jobs(now).await;
        assert!(due_again.is_empty());
    }
}
