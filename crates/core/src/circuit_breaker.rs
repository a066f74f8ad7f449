//! Failure-windowed circuit breaker guarding notification delivery.
//!
//! The breaker never runs a background timer: an OPEN breaker whose timeout
//! has elapsed moves to HALF_OPEN when the next call arrives.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::metrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes considered.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Failures within the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Time spent OPEN before a trial call is allowed.
    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,
}

fn default_window_size() -> usize {
    10
}

fn default_failure_threshold() -> usize {
    5
}

fn default_open_timeout() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// Rejected without calling through.
    #[error("circuit open, retry after {retry_after:?}")]
    Open { retry_after: Duration },

    #[error(transparent)]
    Inner(E),
}

/// Observable breaker state. Reading it never counts as a call.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: usize,
    pub success_count: usize,
    pub recent_failure_rate: f64,
    pub opened_at: Option<DateTime<Utc>>,
    pub retry_after_secs: Option<u64>,
}

struct Inner {
    state: CircuitState,
    /// Most recent outcome at the back; `true` is a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Permission to perform one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Permit {
    Normal,
    Trial,
}

/// An admitted call whose outcome has not been recorded yet.
///
/// Dropping it unsettled means the caller's future was cancelled mid-call.
/// An abandoned trial counts as a failed one so HALF_OPEN cannot wedge; an
/// abandoned normal call leaves no trace in the window.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.permit, success);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled && self.permit == Permit::Trial {
            warn!(breaker = %self.breaker.name, "Trial call abandoned, reopening");
            self.breaker.record(Permit::Trial, false);
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                opened_at_wall: None,
                trial_in_flight: false,
            }),
        }
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.config.open_timeout_secs)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data is a few plain fields; a panic while holding the
        // lock cannot leave them half-updated in a harmful way.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` through the breaker.
    ///
    /// While OPEN (and not yet due for a trial) `f` is never polled and the
    /// call fails immediately with [`CircuitError::Open`].
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = Admission {
            breaker: self,
            permit: self.admit()?,
            settled: false,
        };
        let result = f().await;
        admission.settle(result.is_ok());
        result.map_err(CircuitError::Inner)
    }

    fn admit<E>(&self) -> Result<Permit, CircuitError<E>> {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let due = opened_at + self.open_timeout();
                if now >= due {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial)
                } else {
                    Err(CircuitError::Open {
                        retry_after: due - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(CircuitError::Open {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::Trial)
                }
            }
        }
    }

    fn record(&self, permit: Permit, success: bool) {
        let mut inner = self.lock();

        match (permit, inner.state) {
            (Permit::Trial, CircuitState::HalfOpen) => {
                inner.trial_in_flight = false;
                if success {
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.opened_at_wall = None;
                    self.transition(&mut inner, CircuitState::Closed);
                } else {
                    self.open(&mut inner);
                }
            }
            (Permit::Normal, CircuitState::Closed) => {
                if inner.window.len() == self.config.window_size {
                    inner.window.pop_front();
                }
                inner.window.push_back(!success);

                let failures = inner.window.iter().filter(|failed| **failed).count();
                if failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            // Outcome of a call admitted before the state changed (e.g. a
            // slow CLOSED call finishing after another opened the circuit,
            // or a reset). It no longer describes the current state.
            _ => {}
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.opened_at = Some(Instant::now());
        inner.opened_at_wall = Some(Utc::now());
        self.transition(inner, CircuitState::Open);
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        metrics::CIRCUIT_TRANSITIONS
            .with_label_values(&[to.as_str()])
            .inc();
        if to == CircuitState::Open {
            warn!(breaker = %self.name, from = from.as_str(), "Circuit opened");
        } else {
            info!(breaker = %self.name, from = from.as_str(), to = to.as_str(), "Circuit state changed");
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of the breaker without side effects.
    pub fn status(&self) -> CircuitStatus {
        let inner = self.lock();
        let failure_count = inner.window.iter().filter(|failed| **failed).count();
        let success_count = inner.window.len() - failure_count;
        let recent_failure_rate = if inner.window.is_empty() {
            0.0
        } else {
            failure_count as f64 / inner.window.len() as f64
        };
        let retry_after_secs = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                (opened_at + self.open_timeout())
                    .saturating_duration_since(Instant::now())
                    .as_secs(),
            ),
            _ => None,
        };

        CircuitStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count,
            success_count,
            recent_failure_rate,
            opened_at: inner.opened_at_wall,
            retry_after_secs,
        }
    }

    /// Force the breaker back to CLOSED with an empty window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.window.clear();
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.trial_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
    }
}
