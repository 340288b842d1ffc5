//! Warehouse loader
//!
//! The target table is the only durable state: committed versions and the
//! watermark are always read back from it, never cached between runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::LoadError;
use crate::pipeline::dedup::CommittedState;
use crate::types::{NaturalKey, ValidRecord};

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

/// Result of a committed load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    /// Rows inserted or updated
    pub committed_count: u64,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Maximum committed `inserted_at` in `table`, `None` when empty
    async fn watermark(&self, table: &str) -> Result<Option<DateTime<Utc>>, LoadError>;

    /// Stored `inserted_at` for each of `keys` that already has a row
    async fn committed_versions(
        &self,
        table: &str,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, DateTime<Utc>>, LoadError>;

    /// Merge-upsert `records` into `table` atomically: all rows commit or none do.
    ///
    /// A row is only overwritten when the incoming `inserted_at` is newer.
    /// Callers must pass at most one record per natural key.
    async fn load(&self, table: &str, records: &[ValidRecord]) -> Result<LoadResult, LoadError>;
}

/// Read the committed state needed to deduplicate `keys` against `table`
pub async fn read_committed_state(
    warehouse: &dyn Warehouse,
    table: &str,
    keys: &[NaturalKey],
) -> Result<CommittedState, LoadError> {
    let watermark = warehouse.watermark(table).await?;
    let versions = if keys.is_empty() {
        HashMap::new()
    } else {
        warehouse.committed_versions(table, keys).await?
    };
    Ok(CommittedState { versions, watermark })
}
