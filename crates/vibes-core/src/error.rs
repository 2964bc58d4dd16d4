use thiserror::Error;

/// Application-wide error types for vibes.
#[derive(Error, Debug)]
pub enum AppError {
    /// Network/service hiccup while calling an external service.
    #[error("Transient call error: {0}")]
    TransientCall(String),

    /// External service answered with a non-success status.
    #[error("Service error (HTTP {status_code}): {message}")]
    ServiceError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// The item cannot be processed as-is (e.g. missing source data).
    #[error("Permanent item error: {reason}")]
    PermanentItem { reason: String },

    /// The daily budget of a metered service would be exceeded.
    #[error("Quota exceeded for '{service}': requested {requested} units, {remaining} remaining")]
    QuotaExceeded {
        service: String,
        requested: u64,
        remaining: u64,
    },

    /// Tokens did not become available before the acquire timeout.
    #[error("Rate limiter for '{service}' timed out after {waited_ms}ms")]
    RateLimitTimeout { service: String, waited_ms: u64 },

    /// Upstream reported rate limiting (HTTP 429).
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The circuit breaker for a service is open.
    #[error("Circuit breaker '{service}' is open, retry after {retry_after_secs}s")]
    CircuitOpen {
        service: String,
        retry_after_secs: u64,
    },

    /// A cache entry could not be decoded. Callers treat this as a miss.
    #[error("Cache corruption: {0}")]
    CacheCorruption(String),

    /// Enrichment output does not match the expected schema.
    #[error("Schema validation error: {0}")]
    SchemaValidationError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if the failed item is worth trying again on a later run.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransientCall(_)
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::RateLimitTimeout { .. }
            | AppError::CircuitOpen { .. }
            | AppError::QuotaExceeded { .. } => true,
            AppError::ServiceError { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns true if this error should count against a service's circuit.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::TransientCall(_)
            | AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded => true,
            AppError::ServiceError {
                status_code,
                retryable,
                ..
            } => *status_code == 429 || *status_code >= 500 || *retryable,
            _ => false,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, AppError::QuotaExceeded { .. })
    }

    /// Short machine-readable label, stored alongside failed items.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::TransientCall(_) | AppError::NetworkError(_) | AppError::Timeout(_) => {
                "transient"
            }
            AppError::ServiceError { .. } => "service",
            AppError::PermanentItem { .. } => "permanent",
            AppError::QuotaExceeded { .. } => "quota",
            AppError::RateLimitTimeout { .. } | AppError::RateLimitExceeded => "rate_limit",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::CacheCorruption(_) => "cache_corruption",
            AppError::SchemaValidationError(_) => "schema",
            AppError::SerializationError(_) => "serialization",
            AppError::IoError(_) => "io",
            AppError::DatabaseError(_) => "database",
            AppError::ConfigError(_) => "config",
            AppError::Generic(_) => "generic",
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        AppError::PermanentItem {
            reason: reason.into(),
        }
    }
}
