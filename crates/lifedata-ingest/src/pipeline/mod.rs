//! Single (source, data type) pipeline
//!
//! Scan → Parse → Dedup → Load → Route, strictly in that order:
//!
//! 1. Scan: list landing files for the data type
//! 2. Parse: read each file and classify its lines
//! 3. Dedup: resolve duplicates across every file, then against the table
//! 4. Load: one atomic merge for the whole batch (skipped on dry runs)
//! 5. Route: move each file by its outcome (skipped on dry runs)
//!
//! Read or scan failures end the pipeline before anything is loaded or moved,
//! so the files are simply picked up again by the next run.

pub mod dedup;
pub mod parser;
pub mod router;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::adapters::Adapter;
use crate::error::{IngestError, IngestResult, LoadError};
use crate::landing::LandingScanner;
use crate::report::{FileStatus, IngestOutcome, PipelineReport, PipelineStatus, Rejection};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::types::ValidRecord;
use crate::warehouse::{read_committed_state, Warehouse};

use dedup::{filter_applied, resolve_duplicates};
use parser::{ParsedFile, RecordParser};
use router::OutcomeRouter;

/// Options shared by every pipeline of a run
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub since: Option<DateTime<Utc>>,
    pub dry_run: bool,
}

/// Per-file tallies of dedup results, keyed by landing path
#[derive(Debug, Default)]
struct FileTally {
    duplicates: HashMap<String, usize>,
    already_applied: HashMap<String, usize>,
    to_load: HashMap<String, usize>,
}

fn tally(records: &[ValidRecord], into: &mut HashMap<String, usize>) {
    for record in records {
        *into.entry(record.source_file().path.clone()).or_default() += 1;
    }
}

#[derive(Clone)]
pub struct PipelineRunner {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    scanner: LandingScanner,
    router: OutcomeRouter,
    load_retry: RetryPolicy,
}

impl PipelineRunner {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        load_retry: RetryPolicy,
        route_retry: RetryPolicy,
    ) -> Self {
        Self {
            scanner: LandingScanner::new(store.clone()),
            router: OutcomeRouter::new(store.clone(), route_retry),
            store,
            warehouse,
            load_retry,
        }
    }

    /// Run one pipeline to completion. Never fails: errors are recorded on
    /// the returned report.
    #[instrument(skip(self, adapter, options), fields(source = %adapter.source_id, data_type = %data_type))]
    pub async fn run(&self, adapter: &Adapter, data_type: &str, options: &PipelineOptions) -> PipelineReport {
        let target_table = adapter.data_type(data_type).ok().map(|s| s.target_table.clone());
        let mut report = PipelineReport::new(&adapter.source_id, data_type, target_table);
        if options.dry_run {
            report.status = PipelineStatus::DryRun;
        }

        if let Err(e) = self.execute(adapter, data_type, options, &mut report).await {
            warn!(error = %e, "Pipeline failed");
            report.fail(e);
        }

        info!(
            status = ?report.status,
            files = report.totals.files,
            valid = report.totals.valid,
            rejected = report.totals.rejected,
            loaded = report.totals.loaded,
            "Pipeline finished"
        );
        report
    }

    async fn execute(
        &self,
        adapter: &Adapter,
        data_type: &str,
        options: &PipelineOptions,
        report: &mut PipelineReport,
    ) -> IngestResult<()> {
        let spec = adapter.data_type(data_type)?;
        let table = spec.target_table.as_str();

        // Scan
        let files = self.scanner.list_files(adapter, Some(data_type), options.since).await?;
        if files.is_empty() {
            return Ok(());
        }

        // Parse
        let parser = RecordParser::new(spec);
        let mut parsed: Vec<ParsedFile> = Vec::with_capacity(files.len());
        for file in files {
            let data = self.store.get(&file.path).await.map_err(IngestError::storage)?;
            parsed.push(parser.parse_file(Arc::new(file), &data));
        }

        // Dedup: every file's records join here before anything is loaded
        let valid_counts: Vec<usize> = parsed.iter().map(|p| p.valid.len()).collect();
        let all_valid: Vec<ValidRecord> = parsed.iter_mut().flat_map(|p| std::mem::take(&mut p.valid)).collect();
        let (winners, duplicates) = resolve_duplicates(all_valid);

        let keys: Vec<_> = winners.iter().map(|r| r.key().clone()).collect();
        let (committed, _) = self
            .load_retry
            .run("read committed state", LoadError::is_transient, || {
                read_committed_state(self.warehouse.as_ref(), table, &keys)
            })
            .await;
        let committed = committed?;
        report.watermark_before = committed.watermark;
        report.watermark_after = committed.watermark;

        let (to_load, already_applied) = filter_applied(winners, &committed);

        let mut tallies = FileTally::default();
        tally(&duplicates, &mut tallies.duplicates);
        tally(&already_applied, &mut tallies.already_applied);
        tally(&to_load, &mut tallies.to_load);

        // Load
        let mut load_error: Option<LoadError> = None;
        if !options.dry_run && !to_load.is_empty() {
            let (result, attempts) = self
                .load_retry
                .run("load", LoadError::is_transient, || self.warehouse.load(table, &to_load))
                .await;
            report.load_attempts = attempts;

            match result {
                Ok(loaded) => {
                    let batch_max = to_load.iter().map(ValidRecord::inserted_at).max();
                    report.watermark_after = report.watermark_after.max(batch_max);
                    info!(
                        table,
                        committed = loaded.committed_count,
                        attempts,
                        "Loaded batch"
                    );
                },
                Err(e) => {
                    warn!(table, attempts, error = %e, "Load failed, nothing committed");
                    load_error = Some(e);
                },
            }
        }
        let load_succeeded = load_error.is_none();

        // Route (dry runs only report)
        for (index, file) in parsed.iter().enumerate() {
            let path = file.file.path.as_str();
            let valid_count = valid_counts[index];
            let rejected_count = file.rejected.len();
            let status = FileStatus::classify(valid_count, rejected_count, load_succeeded, options.dry_run);
            let would_load = tallies.to_load.get(path).copied().unwrap_or(0);

            let mut outcome = IngestOutcome {
                path: path.to_string(),
                checksum: file.checksum.clone(),
                valid_count,
                rejected_count,
                duplicate_count: tallies.duplicates.get(path).copied().unwrap_or(0),
                already_applied_count: tallies.already_applied.get(path).copied().unwrap_or(0),
                loaded_count: if load_succeeded { would_load } else { 0 },
                status,
                routed_to: None,
                rejections: file.rejected.iter().map(Rejection::from).collect(),
                error: None,
            };

            if valid_count > 0 {
                if let Some(e) = &load_error {
                    outcome.error = Some(e.to_string());
                }
            }

            if !options.dry_run {
                match self.router.route(&file.file, &outcome, &file.rejected).await {
                    Ok(destination) => outcome.routed_to = destination,
                    Err(e) => {
                        warn!(path, error = %e, "Could not route landing file");
                        report.warnings.push(format!(
                            "{}; file left in landing, manual reconciliation needed",
                            e
                        ));
                        outcome.error = Some(e.to_string());
                    },
                }
            }

            report.push_file(outcome);
        }

        match load_error {
            Some(e) => Err(IngestError::Load(e)),
            None => Ok(()),
        }
    }
}
