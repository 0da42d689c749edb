//! Circuit breakers for outbound calls
//!
//! Every outbound provider and alert call (Stripe list, Google OAuth
//! token, Apple JWS verify, Recurly list, PagerDuty events, outbound
//! webhooks) runs through a named breaker from the process-wide registry.
//!
//! State machine:
//! - CLOSED: calls pass; consecutive failures count up, a success resets
//!   the counter; reaching `failure_threshold` opens the breaker.
//! - OPEN: calls fail immediately. Once `reset_timeout` has elapsed since
//!   the last failure, the next call is admitted as a probe and the
//!   breaker moves to HALF_OPEN with successes counted from zero.
//! - HALF_OPEN: up to `half_open_max_attempts` probes are admitted; any
//!   failure reopens the breaker, `half_open_max_attempts` successes
//!   close it.
//!
//! Breaker state is per-process; independent workers learn about a sick
//! dependency on their own.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum BreakerError {
    #[error("Circuit breaker '{name}' is open")]
    Open { name: String },
}

/// Error surface of [`CircuitBreaker::call`]
#[derive(Error, Debug)]
pub enum CallError<E> {
    #[error(transparent)]
    Rejected(#[from] BreakerError),

    #[error("Wrapped call failed: {0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_admitted: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

/// A single named breaker
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                half_open_admitted: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit or reject a call. Handles the OPEN → HALF_OPEN transition
    /// when the reset timeout has elapsed.
    pub fn try_acquire(&self) -> Result<(), BreakerError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    debug!(breaker = %self.name, "admitting half-open probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_admitted = 1;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max_attempts {
                    inner.half_open_admitted += 1;
                    Ok(())
                } else {
                    Err(BreakerError::Open {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_attempts {
                    debug!(breaker = %self.name, "closing after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.half_open_admitted = 0;
                    inner.half_open_successes = 0;
                }
            }
            // A success reported while open (late completion) is ignored
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures = inner.failure_count, "opening circuit");
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.half_open_admitted = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Run an async operation under this breaker
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, CallError<E>>
    where
        F: Future<Output = std::result::Result<T, E>>,
    {
        self.try_acquire()?;
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CallError::Inner(err))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            half_open_successes: inner.half_open_successes,
            seconds_since_last_failure: inner.last_failure.map(|at| at.elapsed().as_secs()),
        }
    }
}

/// Point-in-time view for the admin read endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub half_open_successes: u32,
    pub seconds_since_last_failure: Option<u64>,
}

/// Process-wide registry keyed by breaker name
#[derive(Clone, Default)]
pub struct BreakerRegistry {
    breakers: Arc<dashmap::DashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a breaker, creating it with the given config on first use
    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Fetch a breaker with default parameters
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, BreakerConfig::default())
    }

    /// Status of every registered breaker, for the admin endpoint
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
