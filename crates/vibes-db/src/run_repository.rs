use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use vibes_core::AppError;
use vibes_core::models::{RunMode, RunRecord, Stage, StageState};

/// Run history and per-stage state in PostgreSQL.
#[derive(Clone)]
pub struct RunRepository {
    pool: PgPool,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_stage(&self, stage: Stage) -> Result<Option<StageState>, AppError> {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT last_cutoff, last_success_at, total_runs, total_items
            FROM stage_state
            WHERE stage = $1
            "#,
        )
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(|row| row.into_state(stage)))
    }

    /// Append the run and upsert the stage state in a single transaction.
    pub async fn commit(&self, record: &RunRecord, state: &StageState) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, stage, mode, started_at, finished_at,
                items_seen, cached, fresh, failed, pending,
                quota_exhausted, max_item_ts, cutoff
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.id)
        .bind(record.stage.as_str())
        .bind(record.mode.as_str())
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.items_seen as i64)
        .bind(record.cached as i64)
        .bind(record.fresh as i64)
        .bind(record.failed as i64)
        .bind(record.pending as i64)
        .bind(record.quota_exhausted)
        .bind(record.max_item_ts)
        .bind(record.cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO stage_state (stage, last_cutoff, last_success_at, total_runs, total_items)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (stage) DO UPDATE
            SET last_cutoff = EXCLUDED.last_cutoff,
                last_success_at = EXCLUDED.last_success_at,
                total_runs = EXCLUDED.total_runs,
                total_items = EXCLUDED.total_items
            "#,
        )
        .bind(state.stage.as_str())
        .bind(state.last_cutoff)
        .bind(state.last_success_at)
        .bind(state.total_runs as i64)
        .bind(state.total_items as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Runs of a stage, newest first.
    pub async fn list(&self, stage: Stage, limit: usize) -> Result<Vec<RunRecord>, AppError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, mode, started_at, finished_at, items_seen, cached, fresh,
                   failed, pending, quota_exhausted, max_item_ts, cutoff
            FROM pipeline_runs
            WHERE stage = $1
            ORDER BY seq DESC
            LIMIT $2
            "#,
        )
        .bind(stage.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(|row| row.into_record(stage)).collect())
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    last_cutoff: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    total_runs: i64,
    total_items: i64,
}

impl StageRow {
    fn into_state(self, stage: Stage) -> StageState {
        StageState {
            stage,
            last_cutoff: self.last_cutoff,
            last_success_at: self.last_success_at,
            total_runs: self.total_runs.max(0) as u64,
            total_items: self.total_items.max(0) as u64,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    mode: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    items_seen: i64,
    cached: i64,
    fresh: i64,
    failed: i64,
    pending: i64,
    quota_exhausted: bool,
    max_item_ts: Option<DateTime<Utc>>,
    cutoff: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_record(self, stage: Stage) -> RunRecord {
        RunRecord {
            id: self.id,
            stage,
            mode: self.mode.parse().unwrap_or(RunMode::Incremental),
            started_at: self.started_at,
            finished_at: self.finished_at,
            items_seen: self.items_seen.max(0) as u64,
            cached: self.cached.max(0) as u64,
            fresh: self.fresh.max(0) as u64,
            failed: self.failed.max(0) as u64,
            pending: self.pending.max(0) as u64,
            quota_exhausted: self.quota_exhausted,
            max_item_ts: self.max_item_ts,
            cutoff: self.cutoff,
        }
    }
}
