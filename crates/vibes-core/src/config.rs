use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::models::Source;

/// Service name of the metered listing API in the quota ledger.
pub const LISTING_SERVICE: &str = "listing";
/// Service name of the enrichment budget in the quota ledger.
pub const ENRICHMENT_SERVICE: &str = "enrichment";

/// Budget and throttle settings for one external service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    /// Hard daily limit in quota units.
    pub daily_limit: u64,
    /// Units charged per external call.
    pub cost_per_call: u64,
    /// Token bucket capacity (burst size), in calls.
    pub bucket_capacity: u32,
    /// Token bucket refill rate, in calls per second.
    pub refill_per_sec: f64,
}

impl ServiceConfig {
    /// YouTube Data API defaults: 10k units/day, one unit per list call.
    pub fn listing() -> Self {
        Self {
            name: LISTING_SERVICE.to_string(),
            daily_limit: 10_000,
            cost_per_call: 1,
            bucket_capacity: 5,
            refill_per_sec: 1.0,
        }
    }

    /// Free-tier LLM defaults: 1500 requests/day at 15 requests/minute.
    pub fn enrichment() -> Self {
        Self {
            name: ENRICHMENT_SERVICE.to_string(),
            daily_limit: 1_500,
            cost_per_call: 1,
            bucket_capacity: 10,
            refill_per_sec: 0.25,
        }
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::ConfigError("service name must not be empty".into()));
        }
        if self.bucket_capacity == 0 {
            return Err(AppError::ConfigError(format!(
                "{}: bucket capacity must be at least 1",
                self.name
            )));
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "{}: refill rate must be a positive number, got {}",
                self.name, self.refill_per_sec
            )));
        }
        if self.cost_per_call > self.daily_limit {
            return Err(AppError::ConfigError(format!(
                "{}: cost per call ({}) exceeds the daily limit ({})",
                self.name, self.cost_per_call, self.daily_limit
            )));
        }
        Ok(())
    }
}

/// Typed configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum number of concurrently running item tasks.
    pub concurrency: usize,
    /// How long a task may wait for rate-limiter tokens.
    pub acquire_timeout: Duration,
    /// Failed enrichment attempts before an item becomes `FailedPermanent`.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// UTC offset (hours) of the midnight that starts a quota day.
    pub day_boundary_offset_hours: i32,
    pub listing: ServiceConfig,
    pub enrichment: ServiceConfig,
    pub max_results_per_source: u32,
    /// Items whose transcript is shorter than this are not enrichable.
    pub min_payload_chars: usize,
    pub sources: Vec<Source>,
    pub cache_dir: PathBuf,
    /// Per-service circuit breaker; `None` disables it.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            acquire_timeout: Duration::from_secs(60),
            max_attempts: Some(3),
            day_boundary_offset_hours: -8,
            listing: ServiceConfig::listing(),
            enrichment: ServiceConfig::enrichment(),
            max_results_per_source: 30,
            min_payload_chars: 100,
            sources: Vec::new(),
            cache_dir: PathBuf::from("data/cache"),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
        }
    }
}

impl PipelineConfig {
    /// Read configuration from `VIBES_*` environment variables.
    ///
    /// Unset variables fall back to [`PipelineConfig::default`].
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Self::default();

        let max_attempts = match parse_var(&lookup, "VIBES_MAX_ATTEMPTS")? {
            None => defaults.max_attempts,
            Some(0) => None,
            Some(n) => Some(n),
        };

        let sources = match lookup("VIBES_SOURCES") {
            Some(raw) => parse_sources(&raw)?,
            None => defaults.sources,
        };

        let circuit_breaker = match parse_var::<u32>(&lookup, "VIBES_CIRCUIT_FAILURE_THRESHOLD")? {
            Some(0) => None,
            Some(n) => Some(CircuitBreakerConfig {
                failure_threshold: n,
                ..CircuitBreakerConfig::default()
            }),
            None => defaults.circuit_breaker,
        };

        let config = Self {
            concurrency: parse_var(&lookup, "VIBES_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            acquire_timeout: parse_var(&lookup, "VIBES_ACQUIRE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            max_attempts,
            day_boundary_offset_hours: parse_var(&lookup, "VIBES_DAY_BOUNDARY_OFFSET_HOURS")?
                .unwrap_or(defaults.day_boundary_offset_hours),
            listing: ServiceConfig {
                daily_limit: parse_var(&lookup, "VIBES_LISTING_DAILY_LIMIT")?
                    .unwrap_or(defaults.listing.daily_limit),
                cost_per_call: parse_var(&lookup, "VIBES_LISTING_COST")?
                    .unwrap_or(defaults.listing.cost_per_call),
                refill_per_sec: parse_var(&lookup, "VIBES_LISTING_RATE")?
                    .unwrap_or(defaults.listing.refill_per_sec),
                ..defaults.listing
            },
            enrichment: ServiceConfig {
                daily_limit: parse_var(&lookup, "VIBES_ENRICH_DAILY_LIMIT")?
                    .unwrap_or(defaults.enrichment.daily_limit),
                cost_per_call: parse_var(&lookup, "VIBES_ENRICH_COST")?
                    .unwrap_or(defaults.enrichment.cost_per_call),
                refill_per_sec: parse_var(&lookup, "VIBES_ENRICH_RATE")?
                    .unwrap_or(defaults.enrichment.refill_per_sec),
                ..defaults.enrichment
            },
            max_results_per_source: parse_var(&lookup, "VIBES_MAX_RESULTS")?
                .unwrap_or(defaults.max_results_per_source),
            min_payload_chars: parse_var(&lookup, "VIBES_MIN_PAYLOAD_CHARS")?
                .unwrap_or(defaults.min_payload_chars),
            sources,
            cache_dir: lookup("VIBES_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            circuit_breaker,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check every field for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.concurrency == 0 {
            return Err(AppError::ConfigError("concurrency must be at least 1".into()));
        }
        if self.acquire_timeout.is_zero() {
            return Err(AppError::ConfigError("acquire timeout must be positive".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(AppError::ConfigError(
                "max_attempts must be at least 1 (use None for unbounded)".into(),
            ));
        }
        if !(-12..=14).contains(&self.day_boundary_offset_hours) {
            return Err(AppError::ConfigError(format!(
                "day boundary offset must be within -12..=14 hours, got {}",
                self.day_boundary_offset_hours
            )));
        }
        if self.max_results_per_source == 0 {
            return Err(AppError::ConfigError(
                "max_results_per_source must be at least 1".into(),
            ));
        }
        if self.listing.name == self.enrichment.name {
            return Err(AppError::ConfigError(
                "listing and enrichment services need distinct names".into(),
            ));
        }
        self.listing.validate()?;
        self.enrichment.validate()?;
        Ok(())
    }

    /// Timezone whose midnight starts a new quota day.
    pub fn day_boundary(&self) -> Result<FixedOffset, AppError> {
        FixedOffset::east_opt(self.day_boundary_offset_hours * 3600).ok_or_else(|| {
            AppError::ConfigError(format!(
                "invalid day boundary offset {}",
                self.day_boundary_offset_hours
            ))
        })
    }

    pub fn services(&self) -> [&ServiceConfig; 2] {
        [&self.listing, &self.enrichment]
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Parse `"UUabc=news,UUdef"` into sources; the label defaults to the id.
pub fn parse_sources(raw: &str) -> Result<Vec<Source>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (id, label) = match entry.split_once('=') {
                Some((id, label)) => (id.trim(), label.trim()),
                None => (entry, entry),
            };
            if id.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "Invalid source entry '{entry}': missing id"
                )));
            }
            let label = if label.is_empty() { id } else { label };
            Ok(Source::new(id, label))
        })
        .collect()
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, AppError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': could not parse value"))
        }),
    }
}
