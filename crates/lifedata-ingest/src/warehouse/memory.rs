use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use super::{LoadResult, Warehouse};
use crate::error::LoadError;
use crate::types::{NaturalKey, ValidRecord};

/// One committed row, shaped like the Postgres table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub natural_key: String,
    pub key_fields: Value,
    pub payload: Value,
    pub inserted_at: DateTime<Utc>,
    pub source_file: String,
    pub dp_inserted_at: DateTime<Utc>,
    pub dp_updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, BTreeMap<NaturalKey, StoredRow>>,
    injected_failures: VecDeque<LoadError>,
    load_calls: usize,
}

/// In-process warehouse with the same merge semantics as the Postgres loader.
///
/// Failures queued with [`MemoryWarehouse::fail_next_loads`] are returned by
/// subsequent `load` calls, one per call, before anything is written.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_next_loads(&self, errors: impl IntoIterator<Item = LoadError>) {
        self.state().injected_failures.extend(errors);
    }

    /// Rows of `table` ordered by natural key
    pub fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.state()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of `load` calls made, including failed ones
    pub fn load_calls(&self) -> usize {
        self.state().load_calls
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn watermark(&self, table: &str) -> Result<Option<DateTime<Utc>>, LoadError> {
        Ok(self
            .state()
            .tables
            .get(table)
            .and_then(|rows| rows.values().map(|row| row.inserted_at).max()))
    }

    async fn committed_versions(
        &self,
        table: &str,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, DateTime<Utc>>, LoadError> {
        let state = self.state();
        let Some(rows) = state.tables.get(table) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| rows.get(key).map(|row| (key.clone(), row.inserted_at)))
            .collect())
    }

    async fn load(&self, table: &str, records: &[ValidRecord]) -> Result<LoadResult, LoadError> {
        let mut state = self.state();
        state.load_calls += 1;
        if let Some(err) = state.injected_failures.pop_front() {
            return Err(err);
        }

        let now = Utc::now();
        let rows = state.tables.entry(table.to_string()).or_default();
        let mut committed_count = 0;

        for record in records {
            let incoming = StoredRow {
                natural_key: record.key().encoded().to_string(),
                key_fields: record.key().to_json_object(),
                payload: record.payload().clone(),
                inserted_at: record.inserted_at(),
                source_file: record.source_file().path.clone(),
                dp_inserted_at: now,
                dp_updated_at: now,
            };

            match rows.get_mut(record.key()) {
                Some(existing) if existing.inserted_at < incoming.inserted_at => {
                    *existing = StoredRow {
                        dp_inserted_at: existing.dp_inserted_at,
                        ..incoming
                    };
                    committed_count += 1;
                },
                Some(_) => {},
                None => {
                    rows.insert(record.key().clone(), incoming);
                    committed_count += 1;
                },
            }
        }

        Ok(LoadResult { committed_count })
    }
}
