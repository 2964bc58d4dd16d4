use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use vibes_core::AppError;
use vibes_core::models::QuotaEntry;

/// Quota ledger rows in PostgreSQL, one per service and quota day.
#[derive(Clone)]
pub struct QuotaRepository {
    pool: PgPool,
}

impl QuotaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Latest day's entry for a service.
    pub async fn load(&self, service: &str) -> Result<Option<QuotaEntry>, AppError> {
        let row = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT service, day, used, daily_limit, updated_at
            FROM quota_ledger
            WHERE service = $1
            ORDER BY day DESC
            LIMIT 1
            "#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Insert or overwrite the entry for `(service, day)`.
    pub async fn save(&self, entry: &QuotaEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (service, day, used, daily_limit, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (service, day) DO UPDATE
            SET used = EXCLUDED.used,
                daily_limit = EXCLUDED.daily_limit,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&entry.service)
        .bind(entry.day)
        .bind(entry.used as i64)
        .bind(entry.limit as i64)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Past usage for a service, newest day first.
    pub async fn history(&self, service: &str, limit: usize) -> Result<Vec<QuotaEntry>, AppError> {
        let rows = sqlx::query_as::<_, QuotaRow>(
            r#"
            SELECT service, day, used, daily_limit, updated_at
            FROM quota_ledger
            WHERE service = $1
            ORDER BY day DESC
            LIMIT $2
            "#,
        )
        .bind(service)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct QuotaRow {
    service: String,
    day: NaiveDate,
    used: i64,
    daily_limit: i64,
    updated_at: DateTime<Utc>,
}

impl From<QuotaRow> for QuotaEntry {
    fn from(row: QuotaRow) -> Self {
        Self {
            service: row.service,
            day: row.day,
            used: row.used.max(0) as u64,
            limit: row.daily_limit.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}
