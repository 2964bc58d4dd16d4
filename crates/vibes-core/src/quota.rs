//! Daily quota accounting for metered services.
//!
//! Usage is charged *before* the external call is made and the new total is
//! persisted before the charge is reported as successful, so a crash during
//! the call can only over-count, never lose, spent units.
//!
//! A quota day starts at midnight in a fixed reference offset. The first
//! access on a new day resets the counter and advances the stored day.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{FixedOffset, NaiveDate};
use tokio::sync::Mutex;

use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::models::QuotaEntry;
use crate::traits::{Clock, QuotaStore, SystemClock};

/// Usage ratio above which a warning is logged once per day.
const HIGH_USAGE_RATIO: f64 = 0.8;

/// Tracks cumulative usage per service against a hard daily limit.
pub struct QuotaLedger<S> {
    store: S,
    limits: HashMap<String, u64>,
    boundary: FixedOffset,
    clock: Arc<dyn Clock>,
    /// Increment-and-check happens under this lock.
    entries: Mutex<HashMap<String, QuotaEntry>>,
}

impl<S: QuotaStore> QuotaLedger<S> {
    pub fn new(store: S, boundary: FixedOffset) -> Self {
        Self {
            store,
            limits: HashMap::new(),
            boundary,
            clock: Arc::new(SystemClock),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Ledger with the limits of every configured service.
    pub fn from_config(store: S, config: &PipelineConfig) -> Result<Self, AppError> {
        let ledger = config
            .services()
            .into_iter()
            .fold(Self::new(store, config.day_boundary()?), |ledger, service| {
                ledger.with_limit(&service.name, service.daily_limit)
            });
        Ok(ledger)
    }

    pub fn with_limit(mut self, service: &str, limit: u64) -> Self {
        self.limits.insert(service.to_string(), limit);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The quota day `now` falls into.
    pub fn current_day(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.boundary).date_naive()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.limits.keys().map(String::as_str)
    }

    /// Charge `units` against `service`.
    ///
    /// Fails with [`AppError::QuotaExceeded`] if the charge would push usage
    /// past the limit; usage is left unchanged in that case. Returns the
    /// units remaining after the charge.
    pub async fn record_usage(&self, service: &str, units: u64) -> Result<u64, AppError> {
        let mut entries = self.entries.lock().await;
        let (entry, _) = self.entry_for(&mut entries, service).await?;

        let remaining = entry.remaining();
        if units > remaining {
            tracing::warn!(
                %service,
                requested = units,
                remaining,
                used = entry.used,
                limit = entry.limit,
                "Quota exceeded, call rejected"
            );
            return Err(AppError::QuotaExceeded {
                service: service.to_string(),
                requested: units,
                remaining,
            });
        }

        let mut updated = entry.clone();
        updated.used += units;
        updated.updated_at = self.clock.now();
        self.store.save_quota(&updated).await?;

        let was_high = is_high_usage(entry);
        *entry = updated;
        if !was_high && is_high_usage(entry) {
            tracing::warn!(
                %service,
                used = entry.used,
                limit = entry.limit,
                "Quota usage is high"
            );
        }
        tracing::debug!(%service, units, used = entry.used, limit = entry.limit, "Quota charged");

        Ok(entry.remaining())
    }

    /// Units still available today; never negative.
    pub async fn remaining(&self, service: &str) -> Result<u64, AppError> {
        let mut entries = self.entries.lock().await;
        let (entry, _) = self.entry_for(&mut entries, service).await?;
        Ok(entry.remaining())
    }

    /// Snapshot of today's entry for `service`.
    pub async fn usage(&self, service: &str) -> Result<QuotaEntry, AppError> {
        let mut entries = self.entries.lock().await;
        let (entry, _) = self.entry_for(&mut entries, service).await?;
        Ok(entry.clone())
    }

    /// Reset every service whose stored day is behind the current one.
    ///
    /// Idempotent: a second call on the same day changes nothing. Returns
    /// the names of the services that were reset.
    pub async fn rollover_if_new_day(&self) -> Result<Vec<String>, AppError> {
        let mut entries = self.entries.lock().await;
        let mut services: Vec<String> = self.limits.keys().cloned().collect();
        services.sort();

        let mut rolled = Vec::new();
        for service in services {
            let (_, was_rolled) = self.entry_for(&mut entries, &service).await?;
            if was_rolled {
                rolled.push(service);
            }
        }
        Ok(rolled)
    }

    /// Load (or create) the entry for `service` and roll it to today.
    async fn entry_for<'a>(
        &self,
        entries: &'a mut HashMap<String, QuotaEntry>,
        service: &str,
    ) -> Result<(&'a mut QuotaEntry, bool), AppError> {
        let limit = *self.limits.get(service).ok_or_else(|| {
            AppError::ConfigError(format!("No quota limit configured for service '{service}'"))
        })?;
        let today = self.current_day();

        if !entries.contains_key(service) {
            let entry = match self.store.load_quota(service).await? {
                Some(stored) => stored,
                None => QuotaEntry {
                    service: service.to_string(),
                    day: today,
                    used: 0,
                    limit,
                    updated_at: self.clock.now(),
                },
            };
            entries.insert(service.to_string(), entry);
        }

        let entry = entries.get_mut(service).ok_or_else(|| {
            AppError::Generic(format!("quota entry for '{service}' vanished"))
        })?;
        entry.limit = limit;

        if entry.day >= today {
            if entry.day > today {
                tracing::warn!(
                    %service,
                    stored_day = %entry.day,
                    %today,
                    "Stored quota day is ahead of the clock, keeping it"
                );
            }
            return Ok((entry, false));
        }

        let rolled = QuotaEntry {
            service: service.to_string(),
            day: today,
            used: 0,
            limit,
            updated_at: self.clock.now(),
        };
        self.store.save_quota(&rolled).await?;
        tracing::info!(
            %service,
            previous_day = %entry.day,
            previous_used = entry.used,
            %today,
            "Quota day rolled over"
        );
        *entry = rolled;
        Ok((entry, true))
    }
}

fn is_high_usage(entry: &QuotaEntry) -> bool {
    entry.limit > 0 && entry.used as f64 >= entry.limit as f64 * HIGH_USAGE_RATIO
}
