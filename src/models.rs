pub mod ingestion_run;
pub mod llm_task;
pub mod normalized_record;
pub mod ordered_set;
pub mod reference;
pub mod severity;
pub mod stats_cache;
pub mod vulnerability;

pub use ingestion_run::{IngestionRun, IngestionRunStatus};
pub use llm_task::{LlmTask, LlmTaskState, PriorityClass};
pub use normalized_record::NormalizedRecord;
pub use ordered_set::OrderedCappedSet;
pub use reference::Reference;
pub use severity::Severity;
pub use stats_cache::StatsCache;
pub use vulnerability::Vulnerability;
