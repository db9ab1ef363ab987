//! Upstream source fetchers (spec §4.2). Each fetcher polls one source on
//! its own cadence and yields `NormalizedRecord`s plus an updated
//! checkpoint; it never retains records after handing them to the Merger.

pub mod bsi_cert;
pub mod cisa_kev;
pub mod nvd;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{OpenThreatError, Result};
use crate::models::NormalizedRecord;
use crate::worker::CancelToken;

/// Output of a single fetch invocation. Records are already normalized;
/// `new_checkpoint` is `None` for snapshot sources that don't checkpoint
/// (spec §4.2: `cisa_kev` has "None").
#[derive(Debug)]
pub struct FetchOutput {
    pub records: Vec<NormalizedRecord>,
    pub new_checkpoint: Option<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source_tag(&self) -> &'static str;

    async fn fetch(&self, checkpoint: Option<String>, cancel: &CancelToken) -> Result<FetchOutput>;
}

/// Exponential backoff with full jitter, base 1s cap 60s, 5 attempts
/// (spec §4.2). Shared by every fetcher's HTTP retry loop.
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const HTTP_DEFAULT: RetryPolicy = RetryPolicy {
        base: Duration::from_secs(1),
        cap: Duration::from_secs(60),
        max_attempts: 5,
    };

    /// Full-jitter backoff delay for the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.cap.as_secs_f64());
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }

    /// Runs `op`, retrying transient failures up to `max_attempts` times.
    /// A 429 response should set `retry_after` on the error via
    /// `OpenThreatError::RateLimited`, which this honors in place of the
    /// computed jittered delay.
    pub async fn run<T, F, Fut>(&self, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(OpenThreatError::Cancelled);
            }
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.retryable() || attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = e
                        .retry_after_secs()
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.delay_for_attempt(attempt));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Per-source token bucket rate limiter (spec §4.2, §5: "one bucket per
/// source shared across... threads").
pub struct TokenBucket {
    state: Mutex<BucketState>,
    min_interval: Duration,
}

struct BucketState {
    last_permit_at: Option<Instant>,
}

impl TokenBucket {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState { last_permit_at: None }),
            min_interval,
        }
    }

    /// NVD's rate limit widens with an API key (spec §6: `NVD_API_KEY`
    /// raises the bucket to 50 req/30s, i.e. 0.6s between requests).
    pub fn nvd(has_api_key: bool) -> Self {
        if has_api_key {
            Self::new(Duration::from_millis(600))
        } else {
            Self::new(Duration::from_secs(6))
        }
    }

    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_permit_at {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        state.last_permit_at = Some(Instant::now());
    }
}

pub type SharedTokenBucket = Arc<TokenBucket>;
