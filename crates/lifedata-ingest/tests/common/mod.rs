//! Shared helpers for lifedata-ingest integration tests
//!
//! Tests run the real orchestrator against the in-memory object store and
//! warehouse, so they need no external services. The Postgres tests bring
//! their own container.

#![allow(dead_code)]

use lifedata_ingest::{
    AdapterRegistry, MemoryStorage, MemoryWarehouse, OrchestratorConfig, RetryPolicy, RunOrchestrator,
    RunReport, RunRequest,
};
use std::sync::{Arc, Once};
use std::time::Duration;

static TRACING: Once = Once::new();

/// Route tracing output through the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("lifedata_ingest=debug")
            .with_test_writer()
            .try_init();
    });
}

pub struct Harness {
    pub store: Arc<MemoryStorage>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub registry: Arc<AdapterRegistry>,
    pub config: OrchestratorConfig,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: Arc::new(MemoryStorage::new()),
            warehouse: Arc::new(MemoryWarehouse::new()),
            registry: Arc::new(AdapterRegistry::builtin().expect("builtin adapters")),
            config: OrchestratorConfig {
                load_retry: RetryPolicy::new(3, Duration::from_millis(1)),
                route_retry: RetryPolicy::new(2, Duration::from_millis(1)),
                ..OrchestratorConfig::default()
            },
        }
    }

    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn orchestrator(&self) -> RunOrchestrator {
        RunOrchestrator::new(
            self.registry.clone(),
            self.store.clone(),
            self.warehouse.clone(),
            self.config.clone(),
        )
    }

    /// Stage a landing file made of `lines`
    pub fn land(&self, key: &str, lines: &[&str]) {
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        self.store.insert(key, body);
    }

    pub async fn run(&self, sources: &[&str], data_types: Option<&[&str]>, dry_run: bool) -> RunReport {
        self.orchestrator()
            .run(&request(sources, data_types, dry_run))
            .await
    }

    /// Payloads in `table`, ordered by natural key
    pub fn payloads(&self, table: &str) -> Vec<serde_json::Value> {
        self.warehouse
            .rows(table)
            .into_iter()
            .map(|row| row.payload)
            .collect()
    }
}

pub fn request(sources: &[&str], data_types: Option<&[&str]>, dry_run: bool) -> RunRequest {
    RunRequest {
        sources: sources.iter().map(|s| s.to_string()).collect(),
        data_types: data_types.map(|d| d.iter().map(|s| s.to_string()).collect()),
        since: None,
        dry_run,
    }
}
