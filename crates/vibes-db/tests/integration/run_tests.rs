use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;
use vibes_core::models::{RunMode, RunRecord, Stage, StageState};
use vibes_db::RunRepository;

use crate::integration::common::setup_test_db;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn record(stage: Stage, finished_at: DateTime<Utc>, fresh: u64) -> RunRecord {
    RunRecord {
        id: Uuid::new_v4(),
        stage,
        mode: RunMode::Incremental,
        started_at: finished_at - Duration::seconds(5),
        finished_at,
        items_seen: fresh,
        cached: 0,
        fresh,
        failed: 0,
        pending: 0,
        quota_exhausted: false,
        max_item_ts: Some(finished_at - Duration::hours(1)),
        cutoff: Some(finished_at - Duration::hours(1)),
    }
}

fn state_after(stage: Stage, run: &RunRecord, total_runs: u64) -> StageState {
    StageState {
        stage,
        last_cutoff: run.cutoff,
        last_success_at: Some(run.finished_at),
        total_runs,
        total_items: run.items_seen,
    }
}

#[tokio::test]
async fn unknown_stage_has_no_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = RunRepository::new(pool);

    assert!(repo.load_stage(Stage::Ingest).await.unwrap().is_none());
    assert!(repo.list(Stage::Ingest, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn commit_persists_record_and_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = RunRepository::new(pool);
    let run = record(Stage::Enrich, t0(), 3);
    let state = state_after(Stage::Enrich, &run, 1);

    repo.commit(&run, &state).await.unwrap();

    assert_eq!(repo.load_stage(Stage::Enrich).await.unwrap(), Some(state));
    assert_eq!(repo.list(Stage::Enrich, 10).await.unwrap(), vec![run]);
}

#[tokio::test]
async fn history_is_newest_first_and_limited() {
    let (pool, _container) = setup_test_db().await;
    let repo = RunRepository::new(pool);

    let mut ids = Vec::new();
    for i in 0..4 {
        let run = record(Stage::Ingest, t0() + Duration::hours(i), 1);
        repo.commit(&run, &state_after(Stage::Ingest, &run, i as u64 + 1))
            .await
            .unwrap();
        ids.push(run.id);
    }

    let history = repo.list(Stage::Ingest, 2).await.unwrap();
    assert_eq!(
        history.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![ids[3], ids[2]]
    );
    assert_eq!(
        repo.load_stage(Stage::Ingest).await.unwrap().unwrap().total_runs,
        4
    );
}

#[tokio::test]
async fn stages_are_isolated() {
    let (pool, _container) = setup_test_db().await;
    let repo = RunRepository::new(pool);
    let run = record(Stage::Ingest, t0(), 2);

    repo.commit(&run, &state_after(Stage::Ingest, &run, 1))
        .await
        .unwrap();

    assert!(repo.load_stage(Stage::Enrich).await.unwrap().is_none());
    assert!(repo.list(Stage::Enrich, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_commit_rolls_back_record() {
    let (pool, _container) = setup_test_db().await;
    let repo = RunRepository::new(pool);
    let run = record(Stage::Enrich, t0(), 1);
    repo.commit(&run, &state_after(Stage::Enrich, &run, 1))
        .await
        .unwrap();

    // Re-using the id violates the primary key before the state is touched.
    let mut duplicate = record(Stage::Enrich, t0() + Duration::hours(1), 5);
    duplicate.id = run.id;
    let err = repo
        .commit(&duplicate, &state_after(Stage::Enrich, &duplicate, 2))
        .await;

    assert!(err.is_err());
    let state = repo.load_stage(Stage::Enrich).await.unwrap().unwrap();
    assert_eq!(state.total_runs, 1);
    assert_eq!(repo.list(Stage::Enrich, 10).await.unwrap().len(), 1);
}
