pub mod common;

mod dataset_tests;
mod pipeline_tests;
mod quota_tests;
mod run_tests;
