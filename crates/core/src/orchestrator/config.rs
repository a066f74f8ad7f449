//! Ingestion run configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::source::FetchPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Lifetime of the per-tenant lock without a refresh.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// How often a running job extends its lock. Must be below the TTL.
    #[serde(default = "default_lock_refresh")]
    pub lock_refresh_secs: u64,

    /// Attempts per page for transient failures, the first one included.
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// 429 cooldowns tolerated per page before the run gives up.
    #[serde(default = "default_max_rate_limit_waits")]
    pub max_rate_limit_waits: u32,

    /// Ceiling on a single upstream `Retry-After`; longer values are clamped.
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_secs: u64,

    /// Soft-delete stored tickets that a complete run did not see.
    #[serde(default = "default_reconcile_deletions")]
    pub reconcile_deletions: bool,
}

fn default_lock_ttl() -> u64 {
    60
}

fn default_lock_refresh() -> u64 {
    20
}

fn default_max_fetch_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_max_rate_limit_waits() -> u32 {
    10
}

fn default_max_retry_after() -> u64 {
    300
}

fn default_reconcile_deletions() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            lock_refresh_secs: default_lock_refresh(),
            max_fetch_attempts: default_max_fetch_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            max_rate_limit_waits: default_max_rate_limit_waits(),
            max_retry_after_secs: default_max_retry_after(),
            reconcile_deletions: default_reconcile_deletions(),
        }
    }
}

impl IngestConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.lock_refresh_secs)
    }

    /// Retry policy for page fetches, with `call_timeout` per attempt.
    pub fn fetch_policy(&self, call_timeout: Duration) -> FetchPolicy {
        FetchPolicy {
            max_attempts: self.max_fetch_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_rate_limit_waits: self.max_rate_limit_waits,
            max_retry_after: Duration::from_secs(self.max_retry_after_secs),
            call_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.lock_ttl(), Duration::from_secs(60));
        assert_eq!(config.lock_refresh_interval(), Duration::from_secs(20));
        assert!(config.reconcile_deletions);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: IngestConfig = toml::from_str("max_fetch_attempts = 2").unwrap();
        assert_eq!(config.max_fetch_attempts, 2);
        assert_eq!(config.lock_ttl_secs, 60);
        assert_eq!(config.backoff_max_ms, 30_000);
    }

    #[test]
    fn test_fetch_policy() {
        let config = IngestConfig {
            max_fetch_attempts: 3,
            backoff_base_ms: 100,
            ..Default::default()
        };
        let policy = config.fetch_policy(Duration::from_secs(7));
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base, Duration::from_millis(100));
        assert_eq!(policy.call_timeout, Duration::from_secs(7));
        assert_eq!(policy.max_retry_after, Duration::from_secs(300));
    }
}
