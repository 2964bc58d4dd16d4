use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use vibes_core::models::{EnrichmentStatus, ItemRecord, ItemSummary, Source};
use vibes_db::DatasetRepository;

use crate::integration::common::setup_test_db;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn item(id: &str, hours: i64) -> ItemRecord {
    let source = Source::new("UU1", "news");
    let raw = ItemSummary {
        id: id.into(),
        title: format!("Video {id}"),
        description: "A long enough description.".into(),
        published_at: t0() + Duration::hours(hours),
        url: Some(format!("https://www.youtube.com/watch?v={id}")),
    };
    ItemRecord::pending(&source, raw, t0())
}

#[tokio::test]
async fn empty_dataset_loads_empty() {
    let (pool, _container) = setup_test_db().await;
    let repo = DatasetRepository::new(pool);

    assert!(repo.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn upsert_then_load_keeps_order_and_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = DatasetRepository::new(pool);
    let records = vec![item("c", 2), item("a", 0), item("b", 1)];

    repo.upsert(&records).await.unwrap();

    assert_eq!(repo.load().await.unwrap(), records);
}

#[tokio::test]
async fn updates_keep_position_and_new_ids_append() {
    let (pool, _container) = setup_test_db().await;
    let repo = DatasetRepository::new(pool);
    repo.upsert(&[item("a", 0), item("b", 1), item("c", 2)])
        .await
        .unwrap();

    let mut enriched = item("b", 1);
    enriched.status = EnrichmentStatus::Fresh;
    enriched.attempts = 1;
    enriched.enrichment = Some(json!({"overall_sentiment": "Positive"}));
    repo.upsert(&[item("a", 0), enriched.clone(), item("c", 2), item("d", 3)])
        .await
        .unwrap();

    let loaded = repo.load().await.unwrap();
    assert_eq!(
        loaded.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c", "d"]
    );
    assert_eq!(loaded[1], enriched);
}

#[tokio::test]
async fn upserting_twice_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let repo = DatasetRepository::new(pool);
    let records = vec![item("a", 0), item("b", 1)];

    repo.upsert(&records).await.unwrap();
    repo.upsert(&records).await.unwrap();

    assert_eq!(repo.load().await.unwrap(), records);
}

#[tokio::test]
async fn partial_upsert_leaves_other_rows_alone() {
    let (pool, _container) = setup_test_db().await;
    let repo = DatasetRepository::new(pool);
    repo.upsert(&[item("a", 0), item("b", 1), item("c", 2)])
        .await
        .unwrap();

    let mut first = item("b", 1);
    first.status = EnrichmentStatus::Failed;
    let mut last = item("b", 1);
    last.status = EnrichmentStatus::Fresh;
    last.attempts = 2;
    repo.upsert(&[item("e", 4), first, last.clone()]).await.unwrap();

    let loaded = repo.load().await.unwrap();
    assert_eq!(
        loaded.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c", "e"]
    );
    assert_eq!(loaded[0], item("a", 0));
    assert_eq!(loaded[1], last);
    assert_eq!(loaded[2], item("c", 2));
}

#[tokio::test]
async fn status_counts_group_by_status() {
    let (pool, _container) = setup_test_db().await;
    let repo = DatasetRepository::new(pool);
    let mut failed = item("b", 1);
    failed.status = EnrichmentStatus::Failed;
    failed.last_error = Some("HTTP 503".into());

    repo.upsert(&[item("a", 0), failed, item("c", 2)]).await.unwrap();

    let counts = repo.status_counts().await.unwrap();
    assert!(counts.contains(&(EnrichmentStatus::Pending, 2)));
    assert!(counts.contains(&(EnrichmentStatus::Failed, 1)));
}
