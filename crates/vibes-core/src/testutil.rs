//! Test utilities: in-memory implementations of the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::cache::{CacheEntry, Namespace};
use crate::error::AppError;
use crate::merge::merge;
use crate::models::{ItemRecord, ItemSummary, QuotaEntry, RunRecord, Stage, StageState};
use crate::traits::{
    CacheStore, Clock, DatasetStore, EnrichRequest, Enricher, ListFilter, Lister, QuotaStore,
    RunStore, TranscriptFetcher,
};

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// MockLister
// ---------------------------------------------------------------------------

/// Lister serving a fixed item list per source.
#[derive(Clone, Default)]
pub struct MockLister {
    items: Arc<Mutex<HashMap<String, Vec<ItemSummary>>>>,
    errors: Arc<Mutex<HashMap<String, Vec<AppError>>>>,
    pub calls: Arc<Mutex<Vec<ListFilter>>>,
}

impl MockLister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_items(&self, source_id: &str, items: Vec<ItemSummary>) {
        self.items
            .lock()
            .unwrap()
            .insert(source_id.to_string(), items);
    }

    /// Queue an error for the next call on `source_id`.
    pub fn fail_next(&self, source_id: &str, error: AppError) {
        self.errors
            .lock()
            .unwrap()
            .entry(source_id.to_string())
            .or_default()
            .push(error);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Lister for MockLister {
    async fn list_items(&self, filter: &ListFilter) -> Result<Vec<ItemSummary>, AppError> {
        self.calls.lock().unwrap().push(filter.clone());

        if let Some(queue) = self.errors.lock().unwrap().get_mut(&filter.source_id)
            && !queue.is_empty()
        {
            return Err(queue.remove(0));
        }

        let items = self
            .items
            .lock()
            .unwrap()
            .get(&filter.source_id)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .take(filter.max_results as usize)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MockTranscriptFetcher
// ---------------------------------------------------------------------------

/// Fetcher answering every id with a generated transcript unless told
/// otherwise.
#[derive(Clone, Default)]
pub struct MockTranscriptFetcher {
    transcripts: Arc<Mutex<HashMap<String, String>>>,
    missing: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<HashMap<String, Vec<AppError>>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockTranscriptFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transcript(&self, item_id: &str, text: &str) {
        self.transcripts
            .lock()
            .unwrap()
            .insert(item_id.to_string(), text.to_string());
    }

    /// Report `item_id` as having no transcript.
    pub fn set_missing(&self, item_id: &str) {
        self.missing.lock().unwrap().push(item_id.to_string());
    }

    /// Queue an error for the next call on `item_id`.
    pub fn fail_next(&self, item_id: &str, error: AppError) {
        self.errors
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .push(error);
    }

    pub fn calls_for(&self, item_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == item_id)
            .count()
    }
}

impl TranscriptFetcher for MockTranscriptFetcher {
    async fn fetch_transcript(&self, item_id: &str) -> Result<String, AppError> {
        self.calls.lock().unwrap().push(item_id.to_string());

        if let Some(queue) = self.errors.lock().unwrap().get_mut(item_id)
            && !queue.is_empty()
        {
            return Err(queue.remove(0));
        }
        if self.missing.lock().unwrap().iter().any(|id| id == item_id) {
            return Err(AppError::permanent(format!("no transcript for {item_id}")));
        }

        Ok(self
            .transcripts
            .lock()
            .unwrap()
            .get(item_id)
            .cloned()
            .unwrap_or_else(|| {
                format!("Spoken transcript of video {item_id}, long enough to be analyzed.")
            }))
    }
}

// ---------------------------------------------------------------------------
// MockEnricher
// ---------------------------------------------------------------------------

/// Enricher returning a schema-valid analysis derived from the request.
#[derive(Clone, Default)]
pub struct MockEnricher {
    errors: Arc<Mutex<HashMap<String, Vec<AppError>>>>,
    invalid: Arc<Mutex<Vec<String>>>,
    pub calls: Arc<Mutex<Vec<EnrichRequest>>>,
}

impl MockEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next call on `item_id`.
    pub fn fail_next(&self, item_id: &str, error: AppError) {
        self.errors
            .lock()
            .unwrap()
            .entry(item_id.to_string())
            .or_default()
            .push(error);
    }

    /// Answer `item_id` with a payload that breaks the analysis schema.
    pub fn return_invalid_for(&self, item_id: &str) {
        self.invalid.lock().unwrap().push(item_id.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, item_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.item_id == item_id)
            .count()
    }

    /// Text sent with the most recent call for `item_id`.
    pub fn last_text_for(&self, item_id: &str) -> Option<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.item_id == item_id)
            .map(|r| r.text.clone())
    }
}

impl Enricher for MockEnricher {
    async fn enrich(&self, request: &EnrichRequest) -> Result<Value, AppError> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some(queue) = self.errors.lock().unwrap().get_mut(&request.item_id)
            && !queue.is_empty()
        {
            return Err(queue.remove(0));
        }
        if self.invalid.lock().unwrap().contains(&request.item_id) {
            return Ok(json!({ "summary": request.title }));
        }

        Ok(json!({
            "core_themes": ["testing"],
            "overall_sentiment": "Neutral",
            "one_sentence_summary": format!("Summary of {}", request.title),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    quotas: HashMap<String, QuotaEntry>,
    stages: HashMap<Stage, StageState>,
    runs: Vec<RunRecord>,
    dataset: Vec<ItemRecord>,
    upserts: Vec<Vec<String>>,
    cache: HashMap<(Namespace, String), CacheEntry>,
    fail_writes: bool,
}

/// In-memory store implementing every persistence trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with a database error.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn quota_entry(&self, service: &str) -> Option<QuotaEntry> {
        self.state.lock().unwrap().quotas.get(service).cloned()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().unwrap().runs.clone()
    }

    pub fn dataset(&self) -> Vec<ItemRecord> {
        self.state.lock().unwrap().dataset.clone()
    }

    /// Ids passed to each `upsert_records` call, oldest first.
    pub fn upserts(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().upserts.clone()
    }

    pub fn seed_cache(&self, namespace: Namespace, key: &str, data: Value) {
        self.state.lock().unwrap().cache.insert(
            (namespace, key.to_string()),
            CacheEntry {
                key: key.to_string(),
                cached_at: Utc::now(),
                data,
            },
        );
    }

    pub fn cache_entry(&self, namespace: Namespace, key: &str) -> Option<CacheEntry> {
        self.state
            .lock()
            .unwrap()
            .cache
            .get(&(namespace, key.to_string()))
            .cloned()
    }

    fn check_writable(state: &MemoryState) -> Result<(), AppError> {
        if state.fail_writes {
            return Err(AppError::DatabaseError("write rejected".into()));
        }
        Ok(())
    }
}

impl QuotaStore for MemoryStore {
    async fn load_quota(&self, service: &str) -> Result<Option<QuotaEntry>, AppError> {
        Ok(self.quota_entry(service))
    }

    async fn save_quota(&self, entry: &QuotaEntry) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        Self::check_writable(&state)?;
        state.quotas.insert(entry.service.clone(), entry.clone());
        Ok(())
    }
}

impl RunStore for MemoryStore {
    async fn load_stage(&self, stage: Stage) -> Result<Option<StageState>, AppError> {
        Ok(self.state.lock().unwrap().stages.get(&stage).cloned())
    }

    async fn commit_run(&self, record: &RunRecord, stage_state: &StageState) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        Self::check_writable(&state)?;
        state.runs.push(record.clone());
        state.stages.insert(stage_state.stage, stage_state.clone());
        Ok(())
    }

    async fn list_runs(&self, stage: Stage, limit: usize) -> Result<Vec<RunRecord>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.stage == stage)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl DatasetStore for MemoryStore {
    async fn load_dataset(&self) -> Result<Vec<ItemRecord>, AppError> {
        Ok(self.dataset())
    }

    async fn upsert_records(&self, records: &[ItemRecord]) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        Self::check_writable(&state)?;
        let (merged, _) = merge(&state.dataset, records);
        state.dataset = merged;
        state
            .upserts
            .push(records.iter().map(|r| r.id.clone()).collect());
        Ok(())
    }
}

impl CacheStore for MemoryStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Option<CacheEntry>, AppError> {
        Ok(self.cache_entry(namespace, key))
    }

    async fn put(&self, namespace: Namespace, key: &str, value: &Value) -> Result<(), AppError> {
        self.seed_cache(namespace, key, value.clone());
        Ok(())
    }

    async fn prune<F>(&self, namespace: Namespace, expired: F) -> Result<u64, AppError>
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync,
    {
        let mut state = self.state.lock().unwrap();
        let before = state.cache.len();
        state
            .cache
            .retain(|(ns, _), entry| *ns != namespace || !expired(&*entry));
        Ok((before - state.cache.len()) as u64)
    }
}
