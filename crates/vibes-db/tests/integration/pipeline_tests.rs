use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use vibes_core::traits::{EnrichRequest, Enricher, ListFilter, Lister, TranscriptFetcher};
use vibes_core::{
    AppError, EnrichmentStatus, FsCache, ItemSummary, Pipeline, PipelineConfig, RunMode, Source,
    Stage,
};
use vibes_db::Database;

use crate::integration::common::setup_test_db;

#[derive(Clone, Default)]
struct StaticLister {
    calls: Arc<AtomicUsize>,
}

impl Lister for StaticLister {
    async fn list_items(&self, filter: &ListFilter) -> Result<Vec<ItemSummary>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Ok((0..3)
            .map(|i| ItemSummary {
                id: format!("{}-{i}", filter.source_id),
                title: format!("Episode {i}"),
                description: "d".repeat(200),
                published_at: base + Duration::hours(i),
                url: None,
            })
            .collect())
    }
}

#[derive(Clone)]
struct StaticTranscripts;

impl TranscriptFetcher for StaticTranscripts {
    async fn fetch_transcript(&self, item_id: &str) -> Result<String, AppError> {
        Ok(format!("Transcript of {item_id}. ").repeat(20))
    }
}

#[derive(Clone, Default)]
struct StaticEnricher {
    calls: Arc<AtomicUsize>,
}

impl Enricher for StaticEnricher {
    async fn enrich(&self, request: &EnrichRequest) -> Result<serde_json::Value, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "core_themes": ["news"],
            "overall_sentiment": "Neutral",
            "one_sentence_summary": format!("About {}", request.title),
        }))
    }
}

#[tokio::test]
async fn stages_persist_through_postgres() {
    let (pool, _container) = setup_test_db().await;
    let db = Database::from_pool(pool);
    let cache_dir = tempfile::tempdir().unwrap();
    let lister = StaticLister::default();
    let enricher = StaticEnricher::default();
    let config = PipelineConfig {
        cache_dir: cache_dir.path().to_path_buf(),
        ..PipelineConfig::default()
    }
    .with_sources(vec![Source::new("UU1", "news")]);

    let pipeline = Pipeline::new(
        lister.clone(),
        StaticTranscripts,
        enricher.clone(),
        FsCache::new(cache_dir.path()),
        db.clone(),
        config,
    )
    .unwrap();

    let ingest = pipeline.run_stage(Stage::Ingest, RunMode::Incremental).await.unwrap();
    assert_eq!(ingest.items_seen, 3);
    assert_eq!(ingest.mode, RunMode::Full);

    let enrich = pipeline.run_stage(Stage::Enrich, RunMode::Incremental).await.unwrap();
    assert_eq!(enrich.fresh, 3);
    assert!(!enrich.quota_exhausted);

    let dataset = db.dataset_repo().load().await.unwrap();
    assert_eq!(dataset.len(), 3);
    assert!(dataset.iter().all(|r| r.status == EnrichmentStatus::Fresh));

    // The enrich cutoff tracks when items entered the dataset.
    let state = db.run_repo().load_stage(Stage::Enrich).await.unwrap().unwrap();
    assert_eq!(state.total_runs, 1);
    assert_eq!(
        state.last_cutoff,
        dataset.iter().map(|r| r.ingested_at).max()
    );
    let ingest_state = db.run_repo().load_stage(Stage::Ingest).await.unwrap().unwrap();
    assert_eq!(
        ingest_state.last_cutoff,
        Some(Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).unwrap())
    );

    let enrichment_used = db.quota_repo().load("enrichment").await.unwrap().unwrap();
    assert_eq!(enrichment_used.used, 3);

    // Nothing new upstream: the second enrich run makes no calls.
    let again = pipeline.run_stage(Stage::Enrich, RunMode::Incremental).await.unwrap();
    assert_eq!(again.items_seen, 0);
    assert_eq!(enricher.calls.load(Ordering::SeqCst), 3);
}
