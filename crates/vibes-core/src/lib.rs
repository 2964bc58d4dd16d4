pub mod analysis;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod quota;
pub mod rate_limit;
pub mod run_ledger;
pub mod scheduler;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{FsCache, Namespace};
pub use config::PipelineConfig;
pub use error::AppError;
pub use models::{
    EnrichmentStatus, ItemRecord, ItemSummary, RunMode, RunSummary, Source, Stage, compute_hash,
};
pub use pipeline::Pipeline;
pub use traits::{
    CacheStore, DatasetStore, Enricher, Lister, QuotaStore, RunStore, StateStore, TranscriptFetcher,
};
