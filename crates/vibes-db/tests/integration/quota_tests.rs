use chrono::{NaiveDate, TimeZone, Utc};
use vibes_core::models::QuotaEntry;
use vibes_db::QuotaRepository;

use crate::integration::common::setup_test_db;

fn entry(day: NaiveDate, used: u64) -> QuotaEntry {
    QuotaEntry {
        service: "listing".into(),
        day,
        used,
        limit: 10_000,
        updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn load_missing_service_returns_none() {
    let (pool, _container) = setup_test_db().await;
    let repo = QuotaRepository::new(pool);

    assert!(repo.load("listing").await.unwrap().is_none());
}

#[tokio::test]
async fn save_then_load_round_trips() {
    let (pool, _container) = setup_test_db().await;
    let repo = QuotaRepository::new(pool);
    let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

    repo.save(&entry(day, 42)).await.unwrap();
    let loaded = repo.load("listing").await.unwrap().unwrap();

    assert_eq!(loaded, entry(day, 42));
    assert_eq!(loaded.remaining(), 10_000 - 42);
}

#[tokio::test]
async fn save_overwrites_same_day() {
    let (pool, _container) = setup_test_db().await;
    let repo = QuotaRepository::new(pool);
    let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

    repo.save(&entry(day, 10)).await.unwrap();
    repo.save(&entry(day, 25)).await.unwrap();

    assert_eq!(repo.load("listing").await.unwrap().unwrap().used, 25);
    assert_eq!(repo.history("listing", 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn load_returns_latest_day() {
    let (pool, _container) = setup_test_db().await;
    let repo = QuotaRepository::new(pool);
    let monday = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
    let tuesday = NaiveDate::from_ymd_opt(2026, 3, 3).unwrap();

    repo.save(&entry(tuesday, 0)).await.unwrap();
    repo.save(&entry(monday, 9_000)).await.unwrap();

    let latest = repo.load("listing").await.unwrap().unwrap();
    assert_eq!(latest.day, tuesday);
    assert_eq!(latest.used, 0);

    let history = repo.history("listing", 10).await.unwrap();
    assert_eq!(history.iter().map(|e| e.day).collect::<Vec<_>>(), vec![tuesday, monday]);
}

#[tokio::test]
async fn services_are_independent() {
    let (pool, _container) = setup_test_db().await;
    let repo = QuotaRepository::new(pool);
    let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

    repo.save(&entry(day, 7)).await.unwrap();

    assert!(repo.load("enrichment").await.unwrap().is_none());
}
