use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    /// How often the scheduler loop wakes to check job due times (spec §4.5).
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Whether a job whose scheduled time was missed while the process was
    /// down fires once at startup (spec §4.5 missed-fire policy).
    pub run_missed_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(30),
            run_missed_on_startup: true,
        }
    }
}
