//! Circuit breaker for external services.
//!
//! Stops a batch from burning quota against a service that keeps failing.
//! The breaker is consulted before any tokens are taken or units charged.
//!
//! ```text
//! CLOSED --[N failures]--> OPEN --[recovery timeout]--> HALF_OPEN
//!   ^                        ^                              |
//!   |                        +---------[failure]------------+
//!   +------------------[M successes]------------------------+
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive tripping failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successful probes in half-open state needed to close again.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
}

/// Snapshot of a breaker for status output.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

/// Thread-safe breaker, cheap to clone.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
                last_error: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Lazily moves Open -> HalfOpen once the recovery timeout has elapsed.
    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.config.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit half-open, probing");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        inner.state
    }

    /// Err([`AppError::CircuitOpen`]) while the circuit rejects calls.
    pub fn check(&self) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let retry_after = inner
            .opened_at
            .map(|t| self.config.recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.config.recovery_timeout);
        Err(AppError::CircuitOpen {
            service: self.name.clone(),
            retry_after_secs: retry_after.as_secs(),
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(circuit = %self.name, "Circuit closed");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_error = None;
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        inner.last_error = Some(error.to_string());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        %error,
                        "Circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %self.name, %error, "Probe failed, circuit reopened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.success_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
        }
    }
}
