//! Object storage for the landing zone
//!
//! The pipeline only needs a handful of operations on a flat key space, so
//! backends implement [`ObjectStore`]: S3 (or MinIO) in deployed
//! environments, the local filesystem for development, and an in-memory map
//! for tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

pub mod config;
pub mod local;
pub mod memory;
pub mod s3;

pub use config::{StorageBackend, StorageConfig};
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use s3::S3Storage;

/// Listing entry for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, for logs (e.g. `s3://bucket`)
    fn describe(&self) -> String;

    /// All objects whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Create or overwrite an object
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;

    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Move an object. The destination is written before the source is
    /// removed, so a failure part-way leaves a copy at `from` rather than
    /// losing the object.
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.copy(from, to).await?;
        self.delete(from).await
    }
}

/// Build the configured backend
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StorageBackend::S3 => Arc::new(S3Storage::new(config).await?),
        StorageBackend::Local => Arc::new(LocalStorage::new(&config.local_root)),
    };
    info!(store = %store.describe(), "Object store ready");
    Ok(store)
}
