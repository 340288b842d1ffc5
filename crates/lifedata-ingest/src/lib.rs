//! lifedata landing-zone ingestion
//!
//! Upstream fetchers stage newline-delimited JSON under
//! `{source}/landing/{data_type}_{timestamp}.jsonl`. This crate validates
//! those records, resolves duplicates by natural key, merges them into one
//! warehouse table per data type, and moves each file to `archive/` or
//! `rejected/` depending on how it fared.
//!
//! Re-running over the same files is a no-op: records the table already holds
//! at the same or a newer capture time are skipped before loading.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lifedata_ingest::{
//!     AdapterRegistry, MemoryStorage, MemoryWarehouse, OrchestratorConfig, RunOrchestrator, RunRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = RunOrchestrator::new(
//!     Arc::new(AdapterRegistry::builtin()?),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(MemoryWarehouse::new()),
//!     OrchestratorConfig::default(),
//! );
//!
//! let report = orchestrator
//!     .run(&RunRequest {
//!         sources: vec!["spotify".to_string()],
//!         ..RunRequest::default()
//!     })
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod adapters;
pub mod config;
pub mod error;
pub mod landing;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod storage;
pub mod types;
pub mod warehouse;

pub use adapters::{Adapter, AdapterRegistry, DataTypeSpec};
pub use config::IngestConfig;
pub use error::{IngestError, IngestResult, LoadError, LoadErrorKind};
pub use landing::LandingScanner;
pub use orchestrator::{OrchestratorConfig, RunOrchestrator, RunRequest};
pub use report::{FileStatus, IngestOutcome, PipelineReport, PipelineStatus, RunReport, RunStatus};
pub use retry::RetryPolicy;
pub use storage::{LocalStorage, MemoryStorage, ObjectStore, S3Storage, StorageConfig};
pub use types::{LandingFile, NaturalKey, RawRecord, RejectedRecord, RejectionReason, ValidRecord};
pub use warehouse::{LoadResult, MemoryWarehouse, PostgresWarehouse, Warehouse};
