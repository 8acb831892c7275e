//! Quartermaster backend library.
//!
//! Exposes the pipeline stages for binaries and integration tests. The HTTP
//! surface lives in `api`; everything else is transport-agnostic.

pub mod api;
pub mod auth;
pub mod commit;
pub mod config;
pub mod db;
pub mod error;
pub mod extraction;
pub mod intake;
pub mod middleware;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod reconciliation;

pub use config::Config;
pub use db::Database;
pub use error::{ErrorCode, PipelineError};
pub use pipeline::ReceivingPipeline;
