//! Process-wide token bucket for calls to the external ticket source.
//!
//! One limiter is shared by every tenant and every fetch loop. All state sits
//! behind a single mutex so concurrent acquires never lose a refill or a
//! consumed token.

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::metrics;

/// Guards against float drift leaving the bucket a hair short of a token
/// after sleeping exactly the computed wait.
const TOKEN_EPSILON: f64 = 1e-9;

/// Hard ceiling on an upstream-imposed cooldown, whatever the caller passes.
const MAX_EXTERNAL_COOLDOWN: Duration = Duration::from_secs(3600);

/// Outbound request budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained budget shared by the whole process.
    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    /// Bucket capacity. With the default of 1 no rolling minute can ever see
    /// more than `requests_per_minute` grants.
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_rpm() -> u32 {
    60
}

fn default_burst() -> u32 {
    1
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_rpm(),
            burst: default_burst(),
        }
    }
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub requests_per_minute: u32,
    pub tokens_available: f64,
    pub cooldown_remaining_ms: Option<u64>,
    pub next_available_in_ms: Option<u64>,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
    /// Deadline imposed by the upstream (429 `Retry-After`).
    cooldown_until: Option<Instant>,
}

impl Bucket {
    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.tokens_at(now);
        self.last_refill = now;
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn wait_for_token(&self, tokens: f64) -> Option<Duration> {
        if tokens + TOKEN_EPSILON >= 1.0 {
            None
        } else {
            let secs = (1.0 - tokens) / self.refill_rate;
            Some(Duration::from_millis((secs * 1000.0).ceil() as u64))
        }
    }

    /// Consume a token, or report how long until one could be consumed.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(remaining) = self.cooldown_remaining(now) {
            return Err(remaining);
        }
        self.cooldown_until = None;
        self.refill(now);

        match self.wait_for_token(self.tokens) {
            None => {
                self.tokens = (self.tokens - 1.0).max(0.0);
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }
}

/// Token bucket limiter shared across all ingestion runs.
pub struct TokenBucketLimiter {
    requests_per_minute: u32,
    bucket: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    /// Create a limiter. The bucket starts full.
    pub fn new(config: &RateLimitConfig) -> Self {
        let rpm = config.requests_per_minute.max(1);
        let capacity = f64::from(config.burst.clamp(1, rpm));
        Self {
            requests_per_minute: rpm,
            bucket: Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                refill_rate: f64::from(rpm) / 60.0,
                last_refill: Instant::now(),
                cooldown_until: None,
            }),
        }
    }

    /// Suspend until a slot is granted. Returns the total time spent waiting.
    ///
    /// The mutex is never held while sleeping; after each sleep the caller
    /// competes for the bucket again.
    pub async fn acquire_slot(&self) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                match bucket.try_acquire(Instant::now()) {
                    Ok(()) => break,
                    Err(wait) => wait,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting");
            tokio::time::sleep(wait).await;
        }

        let waited = started.elapsed();
        metrics::RATE_LIMITER_WAIT_SECONDS.observe(waited.as_secs_f64());
        waited
    }

    /// Block every caller until `duration` from now has passed.
    ///
    /// A shorter cooldown never cuts an existing longer one short. Durations
    /// above one hour are clamped.
    pub async fn note_external_cooldown(&self, duration: Duration) {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let until = now
            .checked_add(duration.min(MAX_EXTERNAL_COOLDOWN))
            .unwrap_or(now);
        if bucket.cooldown_until.map_or(true, |current| until > current) {
            bucket.cooldown_until = Some(until);
        }
    }

    /// Read the limiter without consuming a token.
    pub async fn status(&self) -> RateLimitStatus {
        let bucket = self.bucket.lock().await;
        let now = Instant::now();
        let tokens = bucket.tokens_at(now);
        let cooldown = bucket.cooldown_remaining(now);
        let token_wait = bucket.wait_for_token(tokens);
        let next = match (cooldown, token_wait) {
            (Some(c), Some(t)) => Some(c.max(t)),
            (c, t) => c.or(t),
        };

        RateLimitStatus {
            requests_per_minute: self.requests_per_minute,
            tokens_available: tokens,
            cooldown_remaining_ms: cooldown.map(|d| d.as_millis() as u64),
            next_available_in_ms: next.map(|d| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn limiter(rpm: u32, burst: u32) -> TokenBucketLimiter {
        TokenBucketLimiter::new(&RateLimitConfig {
            requests_per_minute: rpm,
            burst,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_slot_is_immediate() {
        let limiter = limiter(60, 1);
        let waited = limiter.acquire_slot().await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_slot_waits_for_refill() {
        let limiter = limiter(60, 1);
        limiter.acquire_slot().await;

        let start = Instant::now();
        limiter.acquire_slot().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_allows_immediate_grants_up_to_capacity() {
        let limiter = limiter(60, 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire_slot().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_never_exceeds_budget() {
        let limiter = Arc::new(limiter(60, 1));
        let grants = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            let grants = Arc::clone(&grants);
            handles.push(tokio::spawn(async move {
                for _ in 0..8 {
                    limiter.acquire_slot().await;
                    grants.lock().await.push(Instant::now());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut grants = grants.lock().await.clone();
        grants.sort();
        assert_eq!(grants.len(), 160);
        // the first grant is at the start, then one per second
        assert!(grants[159] - start >= Duration::from_secs(159));

        for (i, first) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|t| **t - *first < Duration::from_secs(60))
                .count();
            assert!(in_window <= 60, "window starting at {i} had {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_cooldown_blocks_even_with_tokens() {
        let limiter = limiter(60, 5);
        limiter.note_external_cooldown(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire_slot().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_cooldown_does_not_shrink_longer() {
        let limiter = limiter(60, 1);
        limiter.note_external_cooldown(Duration::from_secs(10)).await;
        limiter.note_external_cooldown(Duration::from_secs(2)).await;

        let status = limiter.status().await;
        assert!(status.cooldown_remaining_ms.unwrap() > 9_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_cooldown_is_capped() {
        let limiter = limiter(60, 1);
        limiter
            .note_external_cooldown(Duration::from_secs(u64::MAX / 2))
            .await;
        limiter.note_external_cooldown(Duration::MAX).await;

        let remaining = limiter.status().await.cooldown_remaining_ms.unwrap();
        assert!(remaining <= 3_600_000);
        assert!(remaining > 3_590_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_does_not_consume() {
        let limiter = limiter(60, 1);
        for _ in 0..5 {
            let status = limiter.status().await;
            assert!(status.tokens_available >= 1.0);
            assert!(status.next_available_in_ms.is_none());
        }

        limiter.acquire_slot().await;
        let status = limiter.status().await;
        assert!(status.tokens_available < 1.0);
        assert_eq!(status.next_available_in_ms, Some(1000));
        assert_eq!(status.requests_per_minute, 60);
    }
}
