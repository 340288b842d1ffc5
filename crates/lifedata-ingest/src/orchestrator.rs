//! Run orchestrator
//!
//! Expands a [`RunRequest`] into (source, data type) pipelines and runs them
//! with bounded concurrency. Pipelines that share a target table are
//! serialised through a per-table lock, so scan-to-load for one table never
//! interleaves. A failing pipeline never stops its siblings.
//!
//! Cancellation is checked before each pipeline starts scanning. A pipeline
//! that has started runs to completion, including its load.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{Adapter, AdapterRegistry};
use crate::config::{IngestConfig, DEFAULT_CONCURRENCY};
use crate::error::IngestError;
use crate::pipeline::{PipelineOptions, PipelineRunner};
use crate::report::{PipelineReport, PipelineStatus, RunReport};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::warehouse::Warehouse;

/// What to ingest in one invocation
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub sources: Vec<String>,
    /// Restrict to these data types; `None` means every type of each source
    pub data_types: Option<Vec<String>>,
    pub since: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub env: String,
    pub concurrency: usize,
    pub load_retry: RetryPolicy,
    pub route_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            env: crate::config::DEFAULT_ENV.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            load_retry: RetryPolicy::default(),
            route_retry: RetryPolicy::default(),
        }
    }
}

impl From<&IngestConfig> for OrchestratorConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            env: config.env.clone(),
            concurrency: config.concurrency,
            load_retry: config.load_retry,
            route_retry: config.route_retry,
        }
    }
}

/// One planned pipeline, or the reason it cannot run
enum PlannedPipeline {
    Run {
        adapter: Arc<Adapter>,
        data_type: String,
        table: String,
    },
    Invalid(PipelineReport),
}

pub struct RunOrchestrator {
    registry: Arc<AdapterRegistry>,
    runner: PipelineRunner,
    config: OrchestratorConfig,
    cancel: CancellationToken,
}

impl RunOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runner: PipelineRunner::new(store, warehouse, config.load_retry, config.route_retry),
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every requested pipeline and aggregate the results
    #[instrument(skip(self, request), fields(env = %self.config.env, dry_run = request.dry_run))]
    pub async fn run(&self, request: &RunRequest) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = ?request.sources, "Starting ingest run");

        let planned = self.plan(request);
        let mut locks: HashMap<String, Arc<Mutex<()>>> = HashMap::new();
        let mut invalid = Vec::new();
        let mut runnable = Vec::new();

        for pipeline in planned {
            match pipeline {
                PlannedPipeline::Invalid(report) => invalid.push(report),
                PlannedPipeline::Run {
                    adapter,
                    data_type,
                    table,
                } => {
                    let lock = locks.entry(table).or_default().clone();
                    runnable.push((adapter, data_type, lock));
                },
            }
        }

        let options = PipelineOptions {
            since: request.since,
            dry_run: request.dry_run,
        };

        let mut reports: Vec<PipelineReport> = stream::iter(runnable)
            .map(|(adapter, data_type, lock)| {
                let options = &options;
                async move { self.run_pipeline(&adapter, &data_type, &lock, options).await }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        reports.extend(invalid);

        let report = RunReport::build(run_id, &self.config.env, request.dry_run, started_at, reports);
        info!(
            %run_id,
            status = ?report.status,
            pipelines = report.pipelines.len(),
            files = report.totals.files,
            loaded = report.totals.loaded,
            rejected = report.totals.rejected,
            "Ingest run finished"
        );
        report
    }

    async fn run_pipeline(
        &self,
        adapter: &Adapter,
        data_type: &str,
        table_lock: &Mutex<()>,
        options: &PipelineOptions,
    ) -> PipelineReport {
        if self.cancel.is_cancelled() {
            return cancelled(adapter, data_type);
        }

        let _guard = table_lock.lock().await;

        // Waiting on the lock can take a while; check again before scanning
        if self.cancel.is_cancelled() {
            return cancelled(adapter, data_type);
        }

        self.runner.run(adapter, data_type, options).await
    }

    /// Expand sources × data types. Unknown sources become failed reports;
    /// a data type filter that matches nothing for a source fails that source.
    fn plan(&self, request: &RunRequest) -> Vec<PlannedPipeline> {
        let mut planned = Vec::new();

        for source_id in &request.sources {
            let adapter = match self.registry.get_adapter(source_id) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(source = %source_id, error = %e, "Skipping source");
                    let mut report = PipelineReport::new(source_id, "*", None);
                    report.fail(e);
                    planned.push(PlannedPipeline::Invalid(report));
                    continue;
                },
            };

            // Unknown names in the filter are skipped for this source
            let names: Vec<&str> = match &request.data_types {
                None => adapter.data_types().collect(),
                Some(filter) => filter.iter().map(String::as_str).collect(),
            };
            let selected: Vec<(String, String)> = names
                .into_iter()
                .filter_map(|dt| {
                    let spec = adapter.data_type(dt).ok()?;
                    Some((dt.to_string(), spec.target_table.clone()))
                })
                .collect();

            if selected.is_empty() {
                let requested = request.data_types.as_deref().unwrap_or_default().join(",");
                let mut report = PipelineReport::new(source_id, requested.clone(), None);
                report.fail(IngestError::UnknownDataType {
                    source_id: source_id.clone(),
                    data_type: requested,
                });
                planned.push(PlannedPipeline::Invalid(report));
                continue;
            }

            for (data_type, table) in selected {
                planned.push(PlannedPipeline::Run {
                    adapter: adapter.clone(),
                    data_type,
                    table,
                });
            }
        }

        planned
    }
}

fn cancelled(adapter: &Adapter, data_type: &str) -> PipelineReport {
    let table = adapter.data_type(data_type).ok().map(|s| s.target_table.clone());
    let mut report = PipelineReport::new(&adapter.source_id, data_type, table);
    report.status = PipelineStatus::Cancelled;
    report.error = Some(IngestError::Cancelled.to_string());
    info!(source = %adapter.source_id, data_type, "Pipeline cancelled before scan");
    report
}
