use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Widens the NVD token bucket from 6s to 0.6s between requests
    /// when set (spec §6).
    pub nvd_api_key: Option<String>,

    pub bsi_feed_url: Option<String>,

    #[serde(with = "humantime_serde")]
    pub nvd_recent_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub cisa_kev_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub bsi_cert_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            nvd_api_key: None,
            bsi_feed_url: None,
            nvd_recent_interval: Duration::from_secs(2 * 3600),
            cisa_kev_interval: Duration::from_secs(24 * 3600),
            bsi_cert_interval: Duration::from_secs(24 * 3600),
        }
    }
}
