use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// SQL migration statements, executed one at a time.
const MIGRATIONS: &[&str] = &[
    // 001_init.sql
    r#"CREATE TABLE IF NOT EXISTS quota_ledger (
        service VARCHAR(64) NOT NULL,
        day DATE NOT NULL,
        used BIGINT NOT NULL DEFAULT 0,
        daily_limit BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (service, day),
        CONSTRAINT chk_quota_ledger_used CHECK (used >= 0 AND daily_limit >= 0)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS stage_state (
        stage VARCHAR(20) PRIMARY KEY,
        last_cutoff TIMESTAMPTZ,
        last_success_at TIMESTAMPTZ,
        total_runs BIGINT NOT NULL DEFAULT 0,
        total_items BIGINT NOT NULL DEFAULT 0,
        CONSTRAINT chk_stage_state_stage CHECK (stage IN ('ingest', 'enrich'))
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pipeline_runs (
        seq BIGSERIAL,
        id UUID PRIMARY KEY,
        stage VARCHAR(20) NOT NULL,
        mode VARCHAR(20) NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ NOT NULL,
        items_seen BIGINT NOT NULL DEFAULT 0,
        cached BIGINT NOT NULL DEFAULT 0,
        fresh BIGINT NOT NULL DEFAULT 0,
        failed BIGINT NOT NULL DEFAULT 0,
        pending BIGINT NOT NULL DEFAULT 0,
        quota_exhausted BOOLEAN NOT NULL DEFAULT FALSE,
        max_item_ts TIMESTAMPTZ,
        cutoff TIMESTAMPTZ,
        CONSTRAINT chk_pipeline_runs_mode CHECK (mode IN ('incremental', 'full'))
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_pipeline_runs_stage ON pipeline_runs(stage, seq DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS items (
        position BIGSERIAL,
        id VARCHAR PRIMARY KEY,
        source_id VARCHAR NOT NULL,
        source_label VARCHAR NOT NULL,
        published_at TIMESTAMPTZ NOT NULL,
        raw JSONB NOT NULL,
        enrichment JSONB,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT chk_items_status CHECK (
            status IN ('pending', 'cached', 'fresh', 'failed', 'failed_permanent')
        )
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_items_position ON items(position)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_items_status ON items(status, published_at DESC)"#,
];

/// Spins up a PostgreSQL container and returns a connected pool.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the container.
pub async fn setup_test_db() -> (PgPool, ContainerAsync<GenericImage>) {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "vibes_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/vibes_test");

    // Retry connection until container is fully ready
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    };

    // Run migrations one statement at a time
    for migration in MIGRATIONS {
        sqlx::query(migration)
            .execute(&pool)
            .await
            .expect("Failed to run migration");
    }

    (pool, container)
}
