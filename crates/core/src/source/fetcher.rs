//! Bounded retry loop around a [`TicketSource`].
//!
//! Every attempt, retries included, first takes a slot from the shared
//! [`TokenBucketLimiter`]. A 429 is not a failure: its `Retry-After` becomes a
//! limiter-wide cooldown and the request is issued again once it expires.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use super::{SourceError, TicketPage, TicketSource};
use crate::metrics;
use crate::rate_limiter::TokenBucketLimiter;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page {page} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        page: u32,
        attempts: u32,
        last_error: String,
    },

    #[error("page {page} still rate limited after {waits} cooldowns")]
    RateLimitExhausted { page: u32, waits: u32 },

    #[error("page {page} failed: {message}")]
    Permanent { page: u32, message: String },
}

/// Retry knobs for one page request.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Attempts per page for transient failures, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Separate budget for 429 cooldowns so a throttling source cannot stall
    /// a run forever.
    pub max_rate_limit_waits: u32,
    /// Upper bound applied to any `Retry-After` before it becomes a cooldown.
    pub max_retry_after: Duration,
    /// Deadline for a single call.
    pub call_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            max_rate_limit_waits: 10,
            max_retry_after: Duration::from_secs(300),
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl FetchPolicy {
    /// Delay after the `failures`-th transient failure: exponential, capped,
    /// plus up to 25% random jitter (the result never exceeds the cap).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (delay + jitter).min(self.backoff_max)
    }
}

pub struct PageFetcher {
    source: Arc<dyn TicketSource>,
    limiter: Arc<TokenBucketLimiter>,
    policy: FetchPolicy,
    page_size: u32,
}

impl PageFetcher {
    pub fn new(
        source: Arc<dyn TicketSource>,
        limiter: Arc<TokenBucketLimiter>,
        policy: FetchPolicy,
        page_size: u32,
    ) -> Self {
        Self {
            source,
            limiter,
            policy,
            page_size,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch one page, retrying transient failures and sitting out 429 cooldowns.
    pub async fn fetch_page(&self, tenant_id: &str, page: u32) -> Result<TicketPage, FetchError> {
        let mut failures = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            self.limiter.acquire_slot().await;

            let call = self.source.fetch_page(tenant_id, page, self.page_size);
            let result = match tokio::time::timeout(self.policy.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Transient(format!(
                    "request timed out after {:?}",
                    self.policy.call_timeout
                ))),
            };

            match result {
                Ok(page) => return Ok(page),
                Err(SourceError::RateLimited { retry_after }) => {
                    rate_limit_waits += 1;
                    metrics::FETCH_RETRIES
                        .with_label_values(&["rate_limited"])
                        .inc();
                    if rate_limit_waits > self.policy.max_rate_limit_waits {
                        return Err(FetchError::RateLimitExhausted {
                            page,
                            waits: rate_limit_waits - 1,
                        });
                    }
                    let cooldown = retry_after.min(self.policy.max_retry_after);
                    if cooldown < retry_after {
                        warn!(tenant_id, page, ?retry_after, ?cooldown, "Retry-After above ceiling, clamped");
                    } else {
                        warn!(tenant_id, page, ?retry_after, "Source rate limited, cooling down");
                    }
                    self.limiter.note_external_cooldown(cooldown).await;
                }
                Err(SourceError::Transient(message)) => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        return Err(FetchError::RetriesExhausted {
                            page,
                            attempts: failures,
                            last_error: message,
                        });
                    }
                    metrics::FETCH_RETRIES.with_label_values(&["transient"]).inc();
                    let delay = self.policy.backoff(failures);
                    warn!(
                        tenant_id,
                        page,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient fetch failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(SourceError::Permanent(message)) => {
                    return Err(FetchError::Permanent { page, message });
                }
            }
        }
    }
}
