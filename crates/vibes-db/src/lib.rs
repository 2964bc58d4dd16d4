pub mod config;
pub mod database;
pub mod dataset_repository;
pub mod quota_repository;
pub mod run_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use dataset_repository::DatasetRepository;
pub use quota_repository::QuotaRepository;
pub use run_repository::RunRepository;
