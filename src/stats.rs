//! Stats cache refresher (spec §4.8): a single scheduled job that
//! materializes the aggregate counts of §3's `StatsCache` so read paths
//! never scan the full table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::Result;
use crate::store::Store;
use crate::worker::{CancelToken, Job};

/// The `refresh-stats` job (spec §4.5): recomputes and writes the stats
/// cache in one atomic pair of calls. Aggregation itself is delegated to
/// `Store::compute_stats`, which issues a single aggregate query rather
/// than paging the full table through this job.
pub struct StatsRefreshJob {
    store: Arc<dyn Store>,
}

impl StatsRefreshJob {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for StatsRefreshJob {
    fn name(&self) -> &str {
        "refresh-stats"
    }

    async fn run(&self, _cancel: &CancelToken) -> Result<()> {
        let now = Utc::now();
        let stats = self.store.compute_stats(now).await?;
        info!(total = stats.total, exploited = stats.exploited, "refreshing stats cache");
        self.store.write_stats(stats).await
    }
}
