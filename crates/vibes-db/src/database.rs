use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use vibes_core::AppError;
use vibes_core::models::{ItemRecord, QuotaEntry, RunRecord, Stage, StageState};
use vibes_core::traits::{DatasetStore, QuotaStore, RunStore};

use crate::config::DatabaseConfig;
use crate::dataset_repository::DatasetRepository;
use crate::quota_repository::QuotaRepository;
use crate::run_repository::RunRepository;

/// Central database facade. Owns the connection pool, runs migrations and
/// vends repository instances.
///
/// Also serves as the pipeline's state store: quota, run and dataset
/// persistence all go through the same pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn quota_repo(&self) -> QuotaRepository {
        QuotaRepository::new(self.pool.clone())
    }

    pub fn run_repo(&self) -> RunRepository {
        RunRepository::new(self.pool.clone())
    }

    pub fn dataset_repo(&self) -> DatasetRepository {
        DatasetRepository::new(self.pool.clone())
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl QuotaStore for Database {
    async fn load_quota(&self, service: &str) -> Result<Option<QuotaEntry>, AppError> {
        self.quota_repo().load(service).await
    }

    async fn save_quota(&self, entry: &QuotaEntry) -> Result<(), AppError> {
        self.quota_repo().save(entry).await
    }
}

impl RunStore for Database {
    async fn load_stage(&self, stage: Stage) -> Result<Option<StageState>, AppError> {
        self.run_repo().load_stage(stage).await
    }

    async fn commit_run(&self, record: &RunRecord, state: &StageState) -> Result<(), AppError> {
        self.run_repo().commit(record, state).await
    }

    async fn list_runs(&self, stage: Stage, limit: usize) -> Result<Vec<RunRecord>, AppError> {
        self.run_repo().list(stage, limit).await
    }
}

impl DatasetStore for Database {
    async fn load_dataset(&self) -> Result<Vec<ItemRecord>, AppError> {
        self.dataset_repo().load().await
    }

    async fn upsert_records(&self, records: &[ItemRecord]) -> Result<(), AppError> {
        self.dataset_repo().upsert(records).await
    }
}
