//! Token-bucket throttling per external service, gated by the quota ledger.
//!
//! A call is admitted in three steps, all before any I/O happens:
//!
//! ```text
//! circuit closed? --> quota remaining >= cost? --> token available? --> charge quota
//!      |                     |                          |
//!  CircuitOpen         QuotaExceeded             RateLimitTimeout
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{PipelineConfig, ServiceConfig};
use crate::error::AppError;
use crate::quota::QuotaLedger;
use crate::traits::QuotaStore;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket for one service.
///
/// No fairness between waiters: whichever task finds enough tokens first
/// takes them.
pub struct RateLimiter<S> {
    service: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
    ledger: Arc<QuotaLedger<S>>,
}

impl<S: QuotaStore> RateLimiter<S> {
    /// A full bucket of `capacity` tokens refilling at `refill_per_sec`.
    pub fn new(
        service: impl Into<String>,
        capacity: u32,
        refill_per_sec: f64,
        ledger: Arc<QuotaLedger<S>>,
    ) -> Self {
        Self {
            service: service.into(),
            capacity: f64::from(capacity),
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
            ledger,
        }
    }

    pub fn from_service(config: &ServiceConfig, ledger: Arc<QuotaLedger<S>>) -> Self {
        Self::new(
            &config.name,
            config.bucket_capacity,
            config.refill_per_sec,
            ledger,
        )
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock_bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(service = %self.service, "Recovered from poisoned rate limiter");
            poisoned.into_inner()
        })
    }

    /// Wait for `tokens` tokens, for at most `timeout`.
    ///
    /// Fails immediately with [`AppError::QuotaExceeded`], consuming nothing,
    /// if the ledger has less than `cost` units left. Returns how long the
    /// caller was held back.
    pub async fn acquire(
        &self,
        tokens: u32,
        cost: u64,
        timeout: Duration,
    ) -> Result<Duration, AppError> {
        let remaining = self.ledger.remaining(&self.service).await?;
        if remaining < cost {
            return Err(AppError::QuotaExceeded {
                service: self.service.clone(),
                requested: cost,
                remaining,
            });
        }

        let wanted = f64::from(tokens);
        if wanted > self.capacity {
            return Err(AppError::ConfigError(format!(
                "Requested {tokens} tokens from '{}' but bucket capacity is {}",
                self.service, self.capacity
            )));
        }

        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            let now = Instant::now();
            let wait = {
                let mut bucket = self.lock_bucket();
                bucket.refill(now, self.capacity, self.refill_per_sec);
                if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    let waited = now.saturating_duration_since(start);
                    if waited > Duration::from_millis(10) {
                        tracing::debug!(
                            service = %self.service,
                            waited_ms = waited.as_millis() as u64,
                            "Rate limiter delayed call"
                        );
                    }
                    return Ok(waited);
                }
                Duration::from_secs_f64((wanted - bucket.tokens) / self.refill_per_sec)
            };

            if now >= deadline {
                return Err(AppError::RateLimitTimeout {
                    service: self.service.clone(),
                    waited_ms: now.saturating_duration_since(start).as_millis() as u64,
                });
            }
            tokio::time::sleep(wait.min(deadline - now)).await;
        }
    }

    /// Tokens currently in the bucket (after refill).
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        bucket.refill(Instant::now(), self.capacity, self.refill_per_sec);
        bucket.tokens
    }
}

/// Admission control for every metered service: circuit breaker, rate
/// limiter and quota ledger behind one call.
pub struct CallGate<S> {
    ledger: Arc<QuotaLedger<S>>,
    limiters: HashMap<String, RateLimiter<S>>,
    breakers: HashMap<String, CircuitBreaker>,
    acquire_timeout: Duration,
}

impl<S: QuotaStore> CallGate<S> {
    pub fn new(ledger: Arc<QuotaLedger<S>>, acquire_timeout: Duration) -> Self {
        Self {
            ledger,
            limiters: HashMap::new(),
            breakers: HashMap::new(),
            acquire_timeout,
        }
    }

    pub fn from_config(ledger: Arc<QuotaLedger<S>>, config: &PipelineConfig) -> Self {
        let mut gate = Self::new(ledger, config.acquire_timeout);
        for service in config.services() {
            let limiter = RateLimiter::from_service(service, gate.ledger.clone());
            gate = gate.with_limiter(limiter);
            if let Some(cb) = &config.circuit_breaker {
                gate = gate.with_breaker(CircuitBreaker::new(&service.name, cb.clone()));
            }
        }
        gate
    }

    pub fn with_limiter(mut self, limiter: RateLimiter<S>) -> Self {
        self.limiters.insert(limiter.service().to_string(), limiter);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breakers.insert(breaker.name().to_string(), breaker);
        self
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger<S>> {
        &self.ledger
    }

    pub fn breaker(&self, service: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(service)
    }

    /// Admit one call costing `cost` units, charging the ledger on success.
    pub async fn admit(&self, service: &str, cost: u64) -> Result<(), AppError> {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.check()?;
        }
        let limiter = self.limiters.get(service).ok_or_else(|| {
            AppError::ConfigError(format!("No rate limiter configured for service '{service}'"))
        })?;
        limiter.acquire(1, cost, self.acquire_timeout).await?;
        self.ledger.record_usage(service, cost).await?;
        Ok(())
    }

    /// Feed the outcome of an admitted call back into the service's breaker.
    pub fn record_outcome<T>(&self, service: &str, result: &Result<T, AppError>) {
        let Some(breaker) = self.breakers.get(service) else {
            return;
        };
        match result {
            Ok(_) => breaker.record_success(),
            Err(e) if e.should_trip_circuit() => breaker.record_failure(e),
            Err(_) => {}
        }
    }
}
