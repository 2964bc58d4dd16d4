use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Titles the listing API returns for entries that no longer have content.
pub const PLACEHOLDER_TITLES: &[&str] = &["Private video", "Deleted video"];

/// Enrichment state of an item.
///
/// ```text
/// PENDING -> CACHED            (cache hit)
/// PENDING -> FRESH             (external call + cache write)
/// PENDING -> FAILED            (retried on the next run)
/// FAILED  -> FAILED_PERMANENT  (attempt budget exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Cached,
    Fresh,
    Failed,
    FailedPermanent,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Cached => "cached",
            EnrichmentStatus::Fresh => "fresh",
            EnrichmentStatus::Failed => "failed",
            EnrichmentStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// Cached or fresh: the item carries an enrichment payload.
    pub fn is_success(&self) -> bool {
        matches!(self, EnrichmentStatus::Cached | EnrichmentStatus::Fresh)
    }

    /// True while the item should still be offered to the enrichment stage.
    pub fn needs_enrichment(&self) -> bool {
        matches!(self, EnrichmentStatus::Pending | EnrichmentStatus::Failed)
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EnrichmentStatus::Pending),
            "cached" => Ok(EnrichmentStatus::Cached),
            "fresh" => Ok(EnrichmentStatus::Fresh),
            "failed" => Ok(EnrichmentStatus::Failed),
            "failed_permanent" => Ok(EnrichmentStatus::FailedPermanent),
            _ => Err(format!("Unknown enrichment status: {}", s)),
        }
    }
}

/// A configured upstream source (an uploads playlist) and its display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub label: String,
}

impl Source {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// One entry returned by the metered listing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ItemSummary {
    pub fn is_placeholder(&self) -> bool {
        PLACEHOLDER_TITLES.contains(&self.title.as_str())
    }
}

/// A row of the persisted dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: String,
    pub source_id: String,
    pub source_label: String,
    /// Source timestamp used for incremental filtering.
    pub published_at: DateTime<Utc>,
    pub raw: ItemSummary,
    pub enrichment: Option<serde_json::Value>,
    pub status: EnrichmentStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub ingested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemRecord {
    /// A freshly observed item, not yet enriched.
    pub fn pending(source: &Source, raw: ItemSummary, now: DateTime<Utc>) -> Self {
        Self {
            id: raw.id.clone(),
            source_id: source.id.clone(),
            source_label: source.label.clone(),
            published_at: raw.published_at,
            raw,
            enrichment: None,
            status: EnrichmentStatus::Pending,
            attempts: 0,
            last_error: None,
            ingested_at: now,
            updated_at: now,
        }
    }

    /// Same item seen again by ingest: new raw payload, enrichment kept.
    pub fn with_refreshed_raw(&self, source: &Source, raw: ItemSummary, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source.id.clone(),
            source_label: source.label.clone(),
            published_at: raw.published_at,
            raw,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// Anything the merge engine can deduplicate.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for ItemRecord {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Pipeline stages with their own run history and cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Enrich,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Enrich => "enrich",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ingest" => Ok(Stage::Ingest),
            "enrich" => Ok(Stage::Enrich),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Incremental,
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Incremental => "incremental",
            RunMode::Full => "full",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "incremental" => Ok(RunMode::Incremental),
            "full" => Ok(RunMode::Full),
            _ => Err(format!("Unknown run mode: {}", s)),
        }
    }
}

/// One completed (or quota-aborted) execution of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub stage: Stage,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items_seen: u64,
    pub cached: u64,
    pub fresh: u64,
    pub failed: u64,
    pub pending: u64,
    pub quota_exhausted: bool,
    /// Newest source timestamp among the items this run processed.
    pub max_item_ts: Option<DateTime<Utc>>,
    /// Stage cutoff after this run was recorded.
    pub cutoff: Option<DateTime<Utc>>,
}

/// Per-stage cursor kept by the run ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub stage: Stage,
    pub last_cutoff: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub total_items: u64,
}

impl StageState {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            last_cutoff: None,
            last_success_at: None,
            total_runs: 0,
            total_items: 0,
        }
    }
}

/// Cumulative usage of one metered service for one quota day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub service: String,
    pub day: NaiveDate,
    pub used: u64,
    pub limit: u64,
    pub updated_at: DateTime<Utc>,
}

impl QuotaEntry {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Result of `Pipeline::run_stage`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub stage: Stage,
    pub mode: RunMode,
    pub items_seen: u64,
    pub cached: u64,
    pub fresh: u64,
    pub failed: u64,
    pub pending: u64,
    pub quota_exhausted: bool,
    pub duration_ms: u64,
    pub cutoff: Option<DateTime<Utc>>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
