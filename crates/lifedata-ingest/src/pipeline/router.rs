//! Outcome router: moves each landing file out of `landing/` once its
//! outcome is known.
//!
//! | status          | action                                                   |
//! |-----------------|----------------------------------------------------------|
//! | Success         | move to `archive/`                                       |
//! | PartialFailure  | write `rejected/<stem>.rejected.jsonl`, move to `archive/` |
//! | TotalFailure    | move to `rejected/` unchanged                            |
//! | DryRun          | leave in place                                           |

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{IngestError, IngestResult};
use crate::landing::{archive_key, rejected_key, rejected_report_key};
use crate::report::{FileStatus, IngestOutcome};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;
use crate::types::{LandingFile, RejectedRecord, RejectionReason};

/// One line of a rejected report
#[derive(Debug, Serialize)]
struct RejectedLine<'a> {
    source_file: &'a str,
    line_number: usize,
    reason: &'a RejectionReason,
    raw_line: &'a str,
}

/// Render the rejected report for a partially failed file, one JSON object per line
pub fn render_rejected_report(rejected: &[RejectedRecord]) -> IngestResult<Vec<u8>> {
    let mut out = Vec::new();
    for record in rejected {
        let line = RejectedLine {
            source_file: &record.source_file.path,
            line_number: record.line_number,
            reason: &record.reason,
            raw_line: &record.raw_line,
        };
        serde_json::to_writer(&mut out, &line).map_err(lifedata_common::CommonError::from)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[derive(Clone)]
pub struct OutcomeRouter {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl OutcomeRouter {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Move `file` according to `outcome.status`.
    ///
    /// Returns the destination key, or `None` when the file stays put. Each
    /// storage step is retried per the policy; on final failure the file is
    /// left where it was and a `Routing` error is returned.
    #[instrument(skip(self, outcome, rejected), fields(path = %file.path, status = outcome.status.as_str()))]
    pub async fn route(
        &self,
        file: &LandingFile,
        outcome: &IngestOutcome,
        rejected: &[RejectedRecord],
    ) -> IngestResult<Option<String>> {
        let destination = match outcome.status {
            FileStatus::DryRun => return Ok(None),
            FileStatus::Success => archive_key(file),
            FileStatus::PartialFailure => {
                let report_key = rejected_report_key(file);
                let report = render_rejected_report(rejected)?;
                self.with_retry("write rejected report", file, || {
                    self.store.put(&report_key, report.clone())
                })
                .await?;
                info!(report = %report_key, rejected = rejected.len(), "Wrote rejected report");
                archive_key(file)
            },
            FileStatus::TotalFailure => rejected_key(file),
        };

        self.with_retry("move landing file", file, || self.store.rename(&file.path, &destination))
            .await?;

        info!(destination = %destination, "Routed landing file");
        Ok(Some(destination))
    }

    async fn with_retry<F, Fut>(&self, operation: &str, file: &LandingFile, op: F) -> IngestResult<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let (result, attempts) = self.retry.run(operation, |_| true, op).await;
        result.map_err(|e| IngestError::Routing {
            path: file.path.clone(),
            cause: format!("{} failed after {} attempt(s): {:#}", operation, attempts, e),
        })
    }
}
