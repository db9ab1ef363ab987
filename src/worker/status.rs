//! Process-wide worker status board, read by the `ListWorkers` job-trigger
//! interface (spec §6). Mirrors the global `OnceLock<Arc<RwLock<...>>>`
//! pattern the source codebase uses for its build/CVE/cache status boards.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Default)]
pub struct WorkerSnapshot {
    pub active_tasks: usize,
    pub registered_tasks: usize,
}

static WORKER_STATUS: OnceLock<Arc<RwLock<HashMap<String, WorkerSnapshot>>>> = OnceLock::new();

fn status_map() -> &'static Arc<RwLock<HashMap<String, WorkerSnapshot>>> {
    WORKER_STATUS.get_or_init(|| Arc::new(RwLock::new(HashMap::new())))
}

pub async fn record(name: &str, snapshot: WorkerSnapshot) {
    status_map().write().await.insert(name.to_string(), snapshot);
}

pub async fn list() -> Vec<(String, WorkerSnapshot)> {
    status_map()
        .read()
        .await
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
