use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Bounded concurrency of the worker pool (spec §4.6); overridable via
    /// `OPENTHREAT__WORKER__CONCURRENCY` or `WORKER_CONCURRENCY`.
    pub concurrency: usize,

    #[serde(with = "humantime_serde")]
    pub soft_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub hard_timeout: Duration,

    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            soft_timeout: Duration::from_secs(55 * 60),
            hard_timeout: Duration::from_secs(60 * 60),
            max_retries: 3,
        }
    }
}
