//! Self-observability tick (SPEC_FULL.md §10 ambient stack): periodically
//! logs process memory and database pool occupancy at debug level so an
//! operator can correlate a slow ingest run with resource pressure without
//! standing up a separate metrics exporter.

use std::time::Duration;

use sqlx::PgPool;
use tokio::time::interval;
use tracing::debug;

use crate::worker::status;

/// Runs forever, logging a snapshot every `period`. Intended to be spawned
/// once at daemon startup and left to run for the process lifetime.
pub async fn memory_monitor_task(pool: PgPool, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        log_snapshot(&pool).await;
    }
}

async fn log_snapshot(pool: &PgPool) {
    if let Ok(contents) = tokio::fs::read_to_string("/proc/self/status").await {
        let mut vm_rss = None;
        let mut vm_size = None;
        let mut vm_peak = None;
        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("VmRSS:") {
                vm_rss = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("VmSize:") {
                vm_size = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("VmPeak:") {
                vm_peak = Some(value.trim().to_string());
            }
        }
        debug!(
            vm_rss = vm_rss.as_deref().unwrap_or("?"),
            vm_size = vm_size.as_deref().unwrap_or("?"),
            vm_peak = vm_peak.as_deref().unwrap_or("?"),
            "memory usage"
        );
    }

    let pool_size = pool.size() as usize;
    let idle_count = pool.num_idle();
    debug!(pool_size, idle_count, active = pool_size.saturating_sub(idle_count), "db pool usage");

    for (name, snapshot) in status::list().await {
        debug!(pool = %name, active_tasks = snapshot.active_tasks, registered_tasks = snapshot.registered_tasks, "worker pool status");
    }

    if let Ok(contents) = tokio::fs::read_to_string("/proc/self/stat").await {
        if let Some(num_threads) = contents.split_whitespace().nth(19) {
            debug!(num_threads, "thread count");
        }
    }
}
