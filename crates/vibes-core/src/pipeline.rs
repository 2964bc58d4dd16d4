//! Stage runner: ties the ledgers, the scheduler and the merge together.
//!
//! ```text
//! run ledger --(cutoff)--> select input --> scheduler --> upsert changed records --> record run
//! ```
//!
//! Records are written and the run recorded only after every task of the
//! batch has finished. The ingest cutoff is a publish time; the enrich
//! cutoff is the time an item entered the dataset.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::analysis::AnalysisValidator;
use crate::cache::{CacheEntry, Namespace};
use crate::config::{ENRICHMENT_SERVICE, LISTING_SERVICE, PipelineConfig};
use crate::error::AppError;
use crate::merge::merge;
use crate::models::{
    EnrichmentStatus, ItemRecord, ItemSummary, RunMode, RunRecord, RunSummary, Source, Stage,
};
use crate::quota::QuotaLedger;
use crate::rate_limit::CallGate;
use crate::run_ledger::RunLedger;
use crate::scheduler::{
    BatchOutcome, BatchReporter, BatchTask, ItemResult, Scheduler, TracingBatchReporter,
};
use crate::traits::{
    CacheStore, Clock, EnrichRequest, Enricher, ListFilter, Lister, StateStore, SystemClock,
    TranscriptFetcher,
};

/// One listing call per source, cached per quota day.
#[derive(Clone)]
struct ListingTask<L> {
    lister: L,
    max_results: u32,
    cost: u64,
    day: NaiveDate,
}

impl<L: Lister> BatchTask for ListingTask<L> {
    type Item = Source;
    type Input = ListFilter;

    fn namespace(&self) -> Namespace {
        Namespace::RawFetch
    }

    fn cache_key(&self, source: &Source) -> String {
        format!("{}@{}", source.id, self.day)
    }

    fn service(&self) -> &str {
        LISTING_SERVICE
    }

    fn cost(&self) -> u64 {
        self.cost
    }

    async fn prepare(&self, source: &Source) -> Result<ListFilter, AppError> {
        Ok(ListFilter {
            source_id: source.id.clone(),
            max_results: self.max_results,
        })
    }

    async fn call(&self, filter: &ListFilter) -> Result<Value, AppError> {
        let items = self.lister.list_items(filter).await?;
        Ok(serde_json::to_value(items)?)
    }
}

/// Quota day a listing cache key was written for.
fn listing_day(key: &str) -> Option<NaiveDate> {
    key.rsplit_once('@').and_then(|(_, day)| day.parse().ok())
}

/// One enrichment call per item, cached by item id. The transcript it
/// analyzes is fetched first and kept in the raw-fetch namespace.
#[derive(Clone)]
struct EnrichTask<T, E, C> {
    transcripts: T,
    enricher: E,
    cache: C,
    validator: Arc<AnalysisValidator>,
    min_payload_chars: usize,
    cost: u64,
}

impl<T: TranscriptFetcher, E, C: CacheStore> EnrichTask<T, E, C> {
    async fn transcript(&self, item_id: &str) -> Result<String, AppError> {
        if let Some(entry) = self.cache.get(Namespace::RawFetch, item_id).await? {
            if let Some(text) = entry.data.as_str() {
                return Ok(text.to_string());
            }
            tracing::warn!(item = %item_id, "Cached transcript is not text, fetching again");
        }

        let text = self.transcripts.fetch_transcript(item_id).await?;
        let value = Value::String(text.clone());
        if let Err(e) = self.cache.put(Namespace::RawFetch, item_id, &value).await {
            tracing::warn!(item = %item_id, error = %e, "Failed to cache transcript");
        }
        Ok(text)
    }
}

impl<T: TranscriptFetcher, E: Enricher, C: CacheStore> BatchTask for EnrichTask<T, E, C> {
    type Item = ItemRecord;
    type Input = EnrichRequest;

    fn namespace(&self) -> Namespace {
        Namespace::Enrichment
    }

    fn cache_key(&self, record: &ItemRecord) -> String {
        record.id.clone()
    }

    fn service(&self) -> &str {
        ENRICHMENT_SERVICE
    }

    fn cost(&self) -> u64 {
        self.cost
    }

    async fn prepare(&self, record: &ItemRecord) -> Result<EnrichRequest, AppError> {
        let transcript = self.transcript(&record.id).await?;
        let chars = transcript.trim().chars().count();
        if chars < self.min_payload_chars {
            return Err(AppError::permanent(format!(
                "transcript has {chars} characters, at least {} required",
                self.min_payload_chars
            )));
        }
        Ok(EnrichRequest {
            item_id: record.id.clone(),
            title: record.raw.title.clone(),
            text: transcript,
        })
    }

    async fn call(&self, request: &EnrichRequest) -> Result<Value, AppError> {
        let value = self.enricher.enrich(request).await?;
        self.validator.validate(&value)?;
        Ok(value)
    }
}

/// Records produced by one stage, ready to merge.
struct StageBatch {
    records: Vec<ItemRecord>,
    items_seen: u64,
    max_item_ts: Option<DateTime<Utc>>,
    outcome: BatchOutcome,
}

/// The incremental enrichment pipeline.
pub struct Pipeline<L, T, E, C, S> {
    lister: L,
    transcripts: T,
    enricher: E,
    cache: C,
    store: S,
    config: PipelineConfig,
    quota: Arc<QuotaLedger<S>>,
    scheduler: Scheduler<C, S>,
    runs: RunLedger<S>,
    validator: Arc<AnalysisValidator>,
    clock: Arc<dyn Clock>,
}

impl<L, T, E, C, S> Pipeline<L, T, E, C, S>
where
    L: Lister,
    T: TranscriptFetcher,
    E: Enricher,
    C: CacheStore,
    S: StateStore,
{
    pub fn new(
        lister: L,
        transcripts: T,
        enricher: E,
        cache: C,
        store: S,
        config: PipelineConfig,
    ) -> Result<Self, AppError> {
        Self::with_clock(
            lister,
            transcripts,
            enricher,
            cache,
            store,
            config,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        lister: L,
        transcripts: T,
        enricher: E,
        cache: C,
        store: S,
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let quota = Arc::new(
            QuotaLedger::from_config(store.clone(), &config)?.with_clock(clock.clone()),
        );
        let gate = Arc::new(CallGate::from_config(quota.clone(), &config));
        let scheduler = Scheduler::new(cache.clone(), gate, config.concurrency);

        Ok(Self {
            lister,
            transcripts,
            enricher,
            cache,
            runs: RunLedger::new(store.clone()),
            store,
            config,
            quota,
            scheduler,
            validator: Arc::new(AnalysisValidator::new()?),
            clock,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn quota(&self) -> &QuotaLedger<S> {
        &self.quota
    }

    pub fn runs(&self) -> &RunLedger<S> {
        &self.runs
    }

    pub async fn run_stage(&self, stage: Stage, mode: RunMode) -> Result<RunSummary, AppError> {
        self.run_stage_with(stage, mode, &TracingBatchReporter).await
    }

    /// Run one stage. A quota abort is reported through
    /// [`RunSummary::quota_exhausted`], not as an error.
    pub async fn run_stage_with<R: BatchReporter>(
        &self,
        stage: Stage,
        mode: RunMode,
        reporter: &R,
    ) -> Result<RunSummary, AppError> {
        let started_at = self.clock.now();
        let timer = Instant::now();

        self.quota.rollover_if_new_day().await?;
        let incremental = self
            .runs
            .should_run_incremental(stage, mode == RunMode::Full)
            .await?;
        let (mode, cutoff) = if incremental {
            (RunMode::Incremental, self.runs.last_cutoff(stage).await?)
        } else {
            (RunMode::Full, None)
        };
        tracing::info!(%stage, %mode, ?cutoff, "Stage started");

        let existing = self.store.load_dataset().await?;
        let batch = match stage {
            Stage::Ingest => self.ingest(&existing, cutoff, reporter).await,
            Stage::Enrich => self.enrich(&existing, cutoff, reporter).await,
        };

        if !batch.records.is_empty() {
            let (merged, stats) = merge(&existing, &batch.records);
            self.store.upsert_records(&batch.records).await?;
            tracing::info!(
                %stage,
                appended = stats.appended,
                replaced = stats.replaced,
                total = merged.len(),
                "Dataset merged"
            );
        }

        let outcome = &batch.outcome;
        let record = self
            .runs
            .record_run(RunRecord {
                id: Uuid::new_v4(),
                stage,
                mode,
                started_at,
                finished_at: self.clock.now(),
                items_seen: batch.items_seen,
                cached: outcome.cached,
                fresh: outcome.fresh,
                failed: outcome.failed,
                pending: outcome.pending,
                quota_exhausted: outcome.quota_exhausted,
                max_item_ts: batch.max_item_ts,
                cutoff: None,
            })
            .await?;

        let summary = RunSummary {
            stage,
            mode,
            items_seen: record.items_seen,
            cached: record.cached,
            fresh: record.fresh,
            failed: record.failed,
            pending: record.pending,
            quota_exhausted: record.quota_exhausted,
            duration_ms: timer.elapsed().as_millis() as u64,
            cutoff: record.cutoff,
        };
        tracing::info!(
            %stage,
            items_seen = summary.items_seen,
            cached = summary.cached,
            fresh = summary.fresh,
            failed = summary.failed,
            pending = summary.pending,
            quota_exhausted = summary.quota_exhausted,
            duration_ms = summary.duration_ms,
            "Stage finished"
        );
        Ok(summary)
    }

    /// List every source and turn new summaries into records.
    ///
    /// Counts in the outcome are per source call; `items_seen` is the number
    /// of items kept after filtering.
    async fn ingest<R: BatchReporter>(
        &self,
        existing: &[ItemRecord],
        cutoff: Option<DateTime<Utc>>,
        reporter: &R,
    ) -> StageBatch {
        let sources = &self.config.sources;
        if sources.is_empty() {
            tracing::warn!("No sources configured, nothing to ingest");
        }

        let day = self.quota.current_day();
        self.prune_listings_before(day).await;

        let task = ListingTask {
            lister: self.lister.clone(),
            max_results: self.config.max_results_per_source,
            cost: self.config.listing.cost_per_call,
            day,
        };
        let outcome = self.scheduler.run_batch(sources, &task, reporter).await;

        let now = self.clock.now();
        let known: HashMap<&str, &ItemRecord> =
            existing.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut records = Vec::new();
        let mut placeholders = 0usize;

        for item in &outcome.results {
            let Some(data) = item.result.data() else {
                continue;
            };
            let source = &sources[item.index];
            let summaries: Vec<ItemSummary> = match serde_json::from_value(data.clone()) {
                Ok(summaries) => summaries,
                Err(e) => {
                    tracing::warn!(source = %source.id, error = %e, "Unreadable listing payload, skipping source");
                    continue;
                }
            };

            for summary in summaries {
                if summary.is_placeholder() {
                    placeholders += 1;
                    continue;
                }
                if cutoff.is_some_and(|c| summary.published_at <= c) {
                    continue;
                }
                let record = match known.get(summary.id.as_str()) {
                    Some(previous) => previous.with_refreshed_raw(source, summary, now),
                    None => ItemRecord::pending(source, summary, now),
                };
                records.push(record);
            }
        }
        if placeholders > 0 {
            tracing::info!(placeholders, "Dropped deleted/private placeholder items");
        }

        // A failed source may hold items older than the newest one seen, so
        // the cutoff must not move past them.
        let max_item_ts = if outcome.failed > 0 {
            tracing::warn!(failed = outcome.failed, "Some sources failed, cutoff held");
            None
        } else {
            records.iter().map(|r| r.published_at).max()
        };

        StageBatch {
            items_seen: records.len() as u64,
            records,
            max_item_ts,
            outcome,
        }
    }

    /// Drop listing pages cached for quota days before `day`.
    async fn prune_listings_before(&self, day: NaiveDate) {
        let expired = |entry: &CacheEntry| listing_day(&entry.key).is_some_and(|d| d < day);
        match self.cache.prune(Namespace::RawFetch, expired).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, %day, "Pruned listing pages of earlier days"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune listing pages"),
        }
    }

    /// Enrich items that entered the dataset after the cutoff plus the
    /// retry backlog.
    async fn enrich<R: BatchReporter>(
        &self,
        existing: &[ItemRecord],
        cutoff: Option<DateTime<Utc>>,
        reporter: &R,
    ) -> StageBatch {
        let input: Vec<ItemRecord> = existing
            .iter()
            .filter(|r| match r.status {
                EnrichmentStatus::Failed => true,
                EnrichmentStatus::Pending => cutoff.is_none_or(|c| r.ingested_at > c),
                _ => false,
            })
            .cloned()
            .collect();

        let task = EnrichTask {
            transcripts: self.transcripts.clone(),
            enricher: self.enricher.clone(),
            cache: self.cache.clone(),
            validator: self.validator.clone(),
            min_payload_chars: self.config.min_payload_chars,
            cost: self.config.enrichment.cost_per_call,
        };
        let mut outcome = self.scheduler.run_batch(&input, &task, reporter).await;

        let now = self.clock.now();
        let mut records = Vec::with_capacity(input.len());
        for item in std::mem::take(&mut outcome.results) {
            let mut record = input[item.index].clone();
            match item.result {
                ItemResult::Cached(value) => {
                    record.enrichment = Some(value);
                    record.status = EnrichmentStatus::Cached;
                    record.last_error = None;
                }
                ItemResult::Fresh(value) => {
                    record.enrichment = Some(value);
                    record.status = EnrichmentStatus::Fresh;
                    record.attempts += 1;
                    record.last_error = None;
                }
                ItemResult::Failed(error) => {
                    self.mark_failed(&mut record, &error);
                }
                ItemResult::Pending => continue,
            }
            record.updated_at = now;
            records.push(record);
        }

        StageBatch {
            items_seen: input.len() as u64,
            max_item_ts: records.iter().map(|r| r.ingested_at).max(),
            records,
            outcome,
        }
    }

    fn mark_failed(&self, record: &mut ItemRecord, error: &AppError) {
        // Admission failures never reached the service.
        if !matches!(
            error,
            AppError::CircuitOpen { .. } | AppError::RateLimitTimeout { .. }
        ) {
            record.attempts += 1;
        }
        record.last_error = Some(error.to_string());

        let exhausted = self
            .config
            .max_attempts
            .is_some_and(|max| record.attempts >= max);
        record.status = if exhausted {
            tracing::warn!(
                item = %record.id,
                attempts = record.attempts,
                retryable = error.is_retryable(),
                %error,
                "Giving up on item"
            );
            EnrichmentStatus::FailedPermanent
        } else {
            EnrichmentStatus::Failed
        };
    }
}
