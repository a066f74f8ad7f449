use super::{types::Config, ConfigError};

/// Validate configuration.
///
/// Serde enforces presence of the `[source]` section; this checks the values
/// that would otherwise break the control plane at runtime.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    if config.source.base_url.trim().is_empty() {
        return Err(invalid("source.base_url cannot be empty"));
    }
    if !(1..=100).contains(&config.source.page_size) {
        return Err(invalid("source.page_size must be between 1 and 100"));
    }

    let rate = &config.rate_limit;
    if rate.requests_per_minute == 0 {
        return Err(invalid("rate_limit.requests_per_minute must be at least 1"));
    }
    if rate.burst == 0 || rate.burst > rate.requests_per_minute {
        return Err(invalid(
            "rate_limit.burst must be between 1 and rate_limit.requests_per_minute",
        ));
    }

    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 || breaker.failure_threshold > breaker.window_size {
        return Err(invalid(
            "circuit_breaker.failure_threshold must be between 1 and circuit_breaker.window_size",
        ));
    }

    let ingest = &config.ingest;
    if ingest.lock_refresh_secs == 0 || ingest.lock_refresh_secs >= ingest.lock_ttl_secs {
        return Err(invalid(
            "ingest.lock_refresh_secs must be non-zero and shorter than ingest.lock_ttl_secs",
        ));
    }
    if ingest.max_fetch_attempts == 0 {
        return Err(invalid("ingest.max_fetch_attempts must be at least 1"));
    }

    if config.notify.max_attempts == 0 || config.notify.max_in_flight == 0 {
        return Err(invalid(
            "notify.max_attempts and notify.max_in_flight must be at least 1",
        ));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}
