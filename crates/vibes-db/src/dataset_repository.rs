use chrono::{DateTime, Utc};
use sqlx::PgPool;
use vibes_core::AppError;
use vibes_core::models::{EnrichmentStatus, ItemRecord, ItemSummary};

/// The item dataset in PostgreSQL.
///
/// Rows are unique by item id. `position` is assigned on first insert and
/// never rewritten, so loading in position order reproduces the merge order.
#[derive(Clone)]
pub struct DatasetRepository {
    pool: PgPool,
}

impl DatasetRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self) -> Result<Vec<ItemRecord>, AppError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT id, source_id, source_label, published_at, raw, enrichment,
                   status, attempts, last_error, ingested_at, updated_at
            FROM items
            ORDER BY position
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(ItemRecord::try_from).collect()
    }

    /// Upsert `records` in one transaction, in slice order. Rows not in the
    /// slice are left alone.
    pub async fn upsert(&self, records: &[ItemRecord]) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        for record in records {
            let raw = serde_json::to_value(&record.raw)?;
            sqlx::query(
                r#"
                INSERT INTO items (
                    id, source_id, source_label, published_at, raw, enrichment,
                    status, attempts, last_error, ingested_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (id) DO UPDATE
                SET source_id = EXCLUDED.source_id,
                    source_label = EXCLUDED.source_label,
                    published_at = EXCLUDED.published_at,
                    raw = EXCLUDED.raw,
                    enrichment = EXCLUDED.enrichment,
                    status = EXCLUDED.status,
                    attempts = EXCLUDED.attempts,
                    last_error = EXCLUDED.last_error,
                    ingested_at = EXCLUDED.ingested_at,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.source_id)
            .bind(&record.source_label)
            .bind(record.published_at)
            .bind(raw)
            .bind(&record.enrichment)
            .bind(record.status.as_str())
            .bind(record.attempts as i32)
            .bind(&record.last_error)
            .bind(record.ingested_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(records = records.len(), "Dataset records upserted");
        Ok(())
    }

    /// Number of items per enrichment status.
    pub async fn status_counts(&self) -> Result<Vec<(EnrichmentStatus, u64)>, AppError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM items
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| Some((status.parse().ok()?, count.max(0) as u64)))
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    id: String,
    source_id: String,
    source_label: String,
    published_at: DateTime<Utc>,
    raw: serde_json::Value,
    enrichment: Option<serde_json::Value>,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    ingested_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for ItemRecord {
    type Error = AppError;

    fn try_from(row: ItemRow) -> Result<Self, Self::Error> {
        let raw: ItemSummary = serde_json::from_value(row.raw)?;
        Ok(Self {
            id: row.id,
            source_id: row.source_id,
            source_label: row.source_label,
            published_at: row.published_at,
            raw,
            enrichment: row.enrichment,
            status: row.status.parse().unwrap_or(EnrichmentStatus::Pending),
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            ingested_at: row.ingested_at,
            updated_at: row.updated_at,
        })
    }
}
