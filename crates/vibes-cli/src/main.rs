use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use vibes_client::{OpenAiEnricher, YouTubeLister, YouTubeTranscripts};
use vibes_core::cache::Namespace;
use vibes_core::config::parse_sources;
use vibes_core::models::ItemRecord;
use vibes_core::quota::QuotaLedger;
use vibes_core::run_ledger::RunLedger;
use vibes_core::{FsCache, Pipeline, PipelineConfig, RunMode, Stage};
use vibes_db::{Database, DatabaseConfig};

type LivePipeline = Pipeline<YouTubeLister, YouTubeTranscripts, OpenAiEnricher, FsCache, Database>;

/// Usage share at which `vibes quota` flags a service.
const HIGH_USAGE_PERCENT: f64 = 80.0;

#[derive(Parser)]
#[command(
    name = "vibes",
    version,
    about = "Quota-safe incremental video enrichment pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single stage
    Run {
        /// Stage to run: ingest or enrich
        #[arg(short, long)]
        stage: Stage,

        /// Ignore the stored cutoff and process everything
        #[arg(long, default_value_t = false)]
        full: bool,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Run ingest, then enrich
    Pipeline {
        /// Ignore the stored cutoffs and process everything
        #[arg(long, default_value_t = false)]
        full: bool,

        #[command(flatten)]
        services: ServiceArgs,
    },

    /// Show per-stage state and dataset status counts
    Status,

    /// Show run history for a stage
    History {
        /// Stage to show: ingest or enrich
        #[arg(short, long)]
        stage: Stage,

        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show today's quota usage per service
    Quota,

    /// Inspect or clear the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Export the dataset to CSV
    Export {
        /// Output file
        #[arg(short, long, default_value = "data/enriched.csv")]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry count and size per namespace
    Stats,

    /// Delete cached entries
    Clear {
        /// Only clear this namespace (raw or enrichment)
        #[arg(short, long)]
        namespace: Option<Namespace>,
    },
}

/// Credentials and overrides for the external services.
#[derive(Args)]
struct ServiceArgs {
    /// YouTube Data API key
    #[arg(long, env = "YOUTUBE_API_KEY", hide_env_values = true)]
    youtube_api_key: String,

    /// LLM API key
    #[arg(long, env = "VIBES_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: String,

    /// LLM model to use (e.g., "gpt-4o-mini", "gemini-2.5-flash")
    #[arg(short, long, env = "VIBES_MODEL", default_value = "gpt-4o-mini")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        short,
        long,
        env = "VIBES_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    base_url: String,

    /// Preferred transcript language
    #[arg(long, env = "VIBES_TRANSCRIPT_LANGUAGE", default_value = "en")]
    transcript_language: String,

    /// Sources as comma-separated `id=label` pairs (overrides VIBES_SOURCES)
    #[arg(long)]
    sources: Option<String>,

    /// Maximum concurrent item tasks (overrides VIBES_CONCURRENCY)
    #[arg(short, long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vibes=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("Invalid VIBES_* configuration")?;

    match cli.command {
        Commands::Run {
            stage,
            full,
            services,
        } => {
            let (pipeline, cache) = build_pipeline(config, &services).await?;
            cmd_run(&pipeline, &cache, &[stage], full).await?;
        }
        Commands::Pipeline { full, services } => {
            let (pipeline, cache) = build_pipeline(config, &services).await?;
            cmd_run(&pipeline, &cache, &[Stage::Ingest, Stage::Enrich], full).await?;
        }
        Commands::Status => {
            let db = connect_db().await?;
            cmd_status(&db).await?;
        }
        Commands::History { stage, limit } => {
            let db = connect_db().await?;
            cmd_history(&db, stage, limit).await?;
        }
        Commands::Quota => {
            let db = connect_db().await?;
            cmd_quota(db, &config).await?;
        }
        Commands::Cache { action } => {
            let cache = FsCache::new(&config.cache_dir);
            cmd_cache(&cache, action).await?;
        }
        Commands::Export { out } => {
            let db = connect_db().await?;
            cmd_export(&db, &out).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

async fn build_pipeline(
    mut config: PipelineConfig,
    args: &ServiceArgs,
) -> Result<(LivePipeline, FsCache)> {
    if let Some(raw) = &args.sources {
        config.sources = parse_sources(raw)?;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }

    let lister =
        YouTubeLister::new(&args.youtube_api_key).context("Failed to create listing client")?;
    let transcripts = YouTubeTranscripts::new()
        .context("Failed to create transcript client")?
        .with_language(&args.transcript_language);
    let enricher = OpenAiEnricher::with_base_url(&args.llm_api_key, &args.model, &args.base_url)
        .context("Failed to create LLM client")?;
    let cache = FsCache::new(&config.cache_dir);
    let db = connect_db().await?;

    tracing::info!(
        sources = config.sources.len(),
        concurrency = config.concurrency,
        model = %args.model,
        transcript_language = %args.transcript_language,
        cache = %config.cache_dir.display(),
        "Pipeline configured"
    );

    let pipeline = Pipeline::new(lister, transcripts, enricher, cache.clone(), db, config)?;
    Ok((pipeline, cache))
}

async fn cmd_run(
    pipeline: &LivePipeline,
    cache: &FsCache,
    stages: &[Stage],
    full: bool,
) -> Result<()> {
    let mode = if full {
        RunMode::Full
    } else {
        RunMode::Incremental
    };

    for &stage in stages {
        let summary = pipeline
            .run_stage(stage, mode)
            .await
            .with_context(|| format!("Stage {stage} failed"))?;

        println!("{}", serde_json::to_string_pretty(&summary)?);

        if summary.quota_exhausted {
            tracing::warn!(
                %stage,
                pending = summary.pending,
                "Quota exhausted, remaining work deferred to the next run"
            );
        }
    }

    let stats = cache.stats();
    tracing::info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate = stats.hit_rate(),
        "Cache session stats"
    );

    Ok(())
}

async fn cmd_status(db: &Database) -> Result<()> {
    let runs = RunLedger::new(db.clone());

    for stage in [Stage::Ingest, Stage::Enrich] {
        let state = runs.stage_state(stage).await?;
        println!("{stage}:");
        println!("  runs:          {}", state.total_runs);
        println!("  items:         {}", state.total_items);
        println!("  cutoff:        {}", format_ts(state.last_cutoff));
        println!("  last success:  {}", format_ts(state.last_success_at));
    }

    let counts = db.dataset_repo().status_counts().await?;
    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    println!("\ndataset: {total} items");
    for (status, count) in counts {
        println!("  {:<17} {}", status.as_str(), count);
    }

    Ok(())
}

async fn cmd_history(db: &Database, stage: Stage, limit: usize) -> Result<()> {
    let history = RunLedger::new(db.clone()).history(stage, limit).await?;

    if history.is_empty() {
        println!("No runs recorded for stage {stage}");
        return Ok(());
    }

    println!("Run history for {stage}:\n");
    for run in &history {
        let flag = if run.quota_exhausted { "ABORTED" } else { "ok" };
        println!(
            "  [{}] {} {} seen={} cached={} fresh={} failed={} pending={} cutoff={}",
            flag,
            run.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.mode,
            run.items_seen,
            run.cached,
            run.fresh,
            run.failed,
            run.pending,
            format_ts(run.cutoff),
        );
    }
    println!("\nTotal: {} runs", history.len());

    Ok(())
}

async fn cmd_quota(db: Database, config: &PipelineConfig) -> Result<()> {
    let ledger = QuotaLedger::from_config(db, config)?;
    println!("Quota day {}:\n", ledger.current_day());

    for service in config.services() {
        let entry = ledger.usage(&service.name).await?;
        let percent = if entry.limit == 0 {
            100.0
        } else {
            entry.used as f64 * 100.0 / entry.limit as f64
        };
        let warning = if percent >= HIGH_USAGE_PERCENT {
            "  HIGH USAGE"
        } else {
            ""
        };
        println!(
            "  {:<11} {:>6} / {:<6} ({:>5.1}%) remaining {}{}",
            entry.service,
            entry.used,
            entry.limit,
            percent,
            entry.remaining(),
            warning
        );
    }

    Ok(())
}

async fn cmd_cache(cache: &FsCache, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Stats => {
            println!("Cache at {}:\n", cache.root().display());
            for namespace in Namespace::ALL {
                let stats = cache.namespace_stats(namespace).await?;
                println!(
                    "  {:<11} {:>6} entries {:>10} bytes",
                    namespace.as_str(),
                    stats.entries,
                    stats.bytes
                );
            }
        }
        CacheAction::Clear { namespace } => {
            let removed = cache.clear(namespace).await?;
            let scope = namespace.map_or("all namespaces", |ns| ns.as_str());
            println!("Removed {removed} entries from {scope}");
        }
    }
    Ok(())
}

/// One CSV line of the exported dataset.
#[derive(Serialize)]
struct ExportRow<'a> {
    id: &'a str,
    source_id: &'a str,
    source_label: &'a str,
    published_at: String,
    title: &'a str,
    url: &'a str,
    status: &'static str,
    attempts: u32,
    core_themes: String,
    overall_sentiment: &'a str,
    one_sentence_summary: &'a str,
    last_error: &'a str,
}

impl<'a> From<&'a ItemRecord> for ExportRow<'a> {
    fn from(record: &'a ItemRecord) -> Self {
        let analysis = record.enrichment.as_ref();
        let core_themes = analysis
            .and_then(|a| a.get("core_themes"))
            .and_then(|v| v.as_array())
            .map(|themes| {
                themes
                    .iter()
                    .filter_map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default();

        Self {
            id: &record.id,
            source_id: &record.source_id,
            source_label: &record.source_label,
            published_at: record.published_at.to_rfc3339(),
            title: &record.raw.title,
            url: record.raw.url.as_deref().unwrap_or(""),
            status: record.status.as_str(),
            attempts: record.attempts,
            core_themes,
            overall_sentiment: field_str(analysis, "overall_sentiment"),
            one_sentence_summary: field_str(analysis, "one_sentence_summary"),
            last_error: record.last_error.as_deref().unwrap_or(""),
        }
    }
}

fn field_str<'a>(analysis: Option<&'a serde_json::Value>, field: &str) -> &'a str {
    analysis
        .and_then(|a| a.get(field))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

async fn cmd_export(db: &Database, out: &Path) -> Result<()> {
    let records = db.dataset_repo().load().await?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(out)
        .with_context(|| format!("Failed to open {}", out.display()))?;
    for record in &records {
        writer.serialize(ExportRow::from(record))?;
    }
    writer.flush()?;

    tracing::info!(rows = records.len(), out = %out.display(), "Dataset exported");
    Ok(())
}

fn format_ts(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}
