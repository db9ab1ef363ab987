use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Enrichment-queue tier determining drain frequency (spec §4.7).
/// Ordering matters: `max(existing, new)` on coalescing relies on the
/// derive order below (`Low < Medium < High`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmTaskState {
    Pending,
    InProgress,
    Done,
    Failed,
}

/// Durable work item for the LLM enrichment queue (spec §3). At most one
/// pending task exists per `cve_id`; re-enqueue coalesces upward only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmTask {
    pub cve_id: String,
    pub priority_class: PriorityClass,
    pub state: LlmTaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl LlmTask {
    pub fn new(cve_id: impl Into<String>, priority_class: PriorityClass, now: DateTime<Utc>) -> Self {
        Self {
            cve_id: cve_id.into(),
            priority_class,
            state: LlmTaskState::Pending,
            attempts: 0,
            last_error: None,
            enqueued_at: now,
        }
    }

    /// Coalesces a re-enqueue into this task: class is only raised, never
    /// lowered, and a failed/done task is revived to pending.
    pub fn coalesce(&mut self, new_class: PriorityClass, now: DateTime<Utc>) {
        if new_class > self.priority_class {
            self.priority_class = new_class;
        }
        if matches!(self.state, LlmTaskState::Failed | LlmTaskState::Done) {
            self.state = LlmTaskState::Pending;
            self.attempts = 0;
            self.enqueued_at = now;
        }
    }

    /// Priority class for a merged record per the selection rules (spec §4.7).
    pub fn classify(
        exploited_in_the_wild: bool,
        severity: super::Severity,
        published_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PriorityClass {
        use super::Severity;

        let age_days = published_at.map(|p| (now - p).num_days());

        if exploited_in_the_wild || severity == Severity::Critical || age_days.is_some_and(|d| d <= 7) {
            return PriorityClass::High;
        }
        if severity == Severity::High || age_days.is_some_and(|d| d <= 30) {
            return PriorityClass::Medium;
        }
        PriorityClass::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn coalesce_never_downgrades_class() {
        let now = Utc::now();
        let mut task = LlmTask::new("CVE-2024-0001", PriorityClass::High, now);
        task.coalesce(PriorityClass::Low, now);
        assert_eq!(task.priority_class, PriorityClass::High);
    }

    #[test]
    fn coalesce_upgrades_class() {
        let now = Utc::now();
        let mut task = LlmTask::new("CVE-2024-0001", PriorityClass::Low, now);
        task.coalesce(PriorityClass::High, now);
        assert_eq!(task.priority_class, PriorityClass::High);
    }

    #[test]
    fn classify_exploited_is_always_high() {
        let now = Utc::now();
        let class = LlmTask::classify(true, super::super::Severity::Low, None, now);
        assert_eq!(class, PriorityClass::High);
    }

    #[test]
    fn classify_recency_buckets() {
        let now = Utc::now();
        let fresh = now - Duration::days(3);
        let stale = now - Duration::days(400);
        assert_eq!(
            LlmTask::classify(false, super::super::Severity::Unknown, Some(fresh), now),
            PriorityClass::High
        );
        assert_eq!(
            LlmTask::classify(false, super::super::Severity::Unknown, Some(stale), now),
            PriorityClass::Low
        );
    }
}
