use std::future::Future;

use chrono::{DateTime, Utc};

use crate::cache::{CacheEntry, Namespace};
use crate::error::AppError;
use crate::models::{ItemRecord, ItemSummary, QuotaEntry, RunRecord, Stage, StageState};

/// Query sent to the listing service for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    pub source_id: String,
    pub max_results: u32,
}

/// Metered listing service. Every call costs a fixed number of quota units.
pub trait Lister: Send + Sync + Clone + 'static {
    fn list_items(
        &self,
        filter: &ListFilter,
    ) -> impl Future<Output = Result<Vec<ItemSummary>, AppError>> + Send;
}

/// Unmetered per-item fetch of the text handed to the enrichment service.
pub trait TranscriptFetcher: Send + Sync + Clone + 'static {
    /// Full transcript of `item_id` as plain text. An item without one fails
    /// with [`AppError::PermanentItem`].
    fn fetch_transcript(
        &self,
        item_id: &str,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Input handed to the enrichment service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichRequest {
    pub item_id: String,
    pub title: String,
    pub text: String,
}

/// Per-item enrichment service (LLM analysis).
pub trait Enricher: Send + Sync + Clone + 'static {
    fn enrich(
        &self,
        request: &EnrichRequest,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Durable key/value store for external-call results.
///
/// `get` never triggers external work. `put` is a full overwrite; the last
/// writer for a key wins.
pub trait CacheStore: Send + Sync + Clone + 'static {
    fn get(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> impl Future<Output = Result<Option<CacheEntry>, AppError>> + Send;

    fn put(
        &self,
        namespace: Namespace,
        key: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Delete the entries of `namespace` for which `expired` holds and
    /// return how many were removed.
    fn prune<F>(
        &self,
        namespace: Namespace,
        expired: F,
    ) -> impl Future<Output = Result<u64, AppError>> + Send
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync;
}

/// Persistence for quota ledger entries (one per service).
pub trait QuotaStore: Send + Sync + Clone + 'static {
    fn load_quota(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Option<QuotaEntry>, AppError>> + Send;

    /// Must be durable when the future resolves.
    fn save_quota(&self, entry: &QuotaEntry) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persistence for the run ledger.
pub trait RunStore: Send + Sync + Clone + 'static {
    fn load_stage(
        &self,
        stage: Stage,
    ) -> impl Future<Output = Result<Option<StageState>, AppError>> + Send;

    /// Append `record` and replace the stage state in one atomic step.
    fn commit_run(
        &self,
        record: &RunRecord,
        state: &StageState,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Run history for a stage, newest first.
    fn list_runs(
        &self,
        stage: Stage,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<RunRecord>, AppError>> + Send;
}

/// Persistence for the item dataset, keyed uniquely by item id.
pub trait DatasetStore: Send + Sync + Clone + 'static {
    /// All records in insertion order.
    fn load_dataset(&self) -> impl Future<Output = Result<Vec<ItemRecord>, AppError>> + Send;

    /// Insert or replace `records` by id. A replaced record keeps its
    /// position; new ids are appended in slice order and a repeated id in
    /// the slice resolves to its last occurrence.
    fn upsert_records(
        &self,
        records: &[ItemRecord],
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Everything the stage runner persists.
pub trait StateStore: QuotaStore + RunStore + DatasetStore {}

impl<T: QuotaStore + RunStore + DatasetStore> StateStore for T {}

/// Time source, injectable for day-boundary tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
