//! Run reporting
//!
//! The [`RunReport`] is the only observable result of an invocation: the CLI
//! prints it as JSON and derives its exit code from [`RunReport::status`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::AddAssign;
use uuid::Uuid;

use crate::types::RejectedRecord;

/// Outcome of one landing file, decides where the router moves it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Nothing rejected and the load (if any) committed
    Success,
    /// Some lines rejected, the valid ones committed
    PartialFailure,
    /// The load failed, or every line was rejected
    TotalFailure,
    /// Dry run; file left in place
    DryRun,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Success => "success",
            FileStatus::PartialFailure => "partial_failure",
            FileStatus::TotalFailure => "total_failure",
            FileStatus::DryRun => "dry_run",
        }
    }

    /// Status of a file given its line counts and whether its batch committed.
    ///
    /// A file with no valid lines is unaffected by the load result.
    pub fn classify(valid_count: usize, rejected_count: usize, load_succeeded: bool, dry_run: bool) -> Self {
        if dry_run {
            FileStatus::DryRun
        } else if valid_count == 0 && rejected_count > 0 {
            FileStatus::TotalFailure
        } else if valid_count > 0 && !load_succeeded {
            FileStatus::TotalFailure
        } else if rejected_count > 0 {
            FileStatus::PartialFailure
        } else {
            FileStatus::Success
        }
    }
}

/// One quarantined line, as reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub line_number: usize,
    pub reason: String,
}

impl From<&RejectedRecord> for Rejection {
    fn from(record: &RejectedRecord) -> Self {
        Self {
            line_number: record.line_number,
            reason: record.reason.to_string(),
        }
    }
}

/// Result for one landing file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub path: String,
    /// SHA-256 of the file contents
    pub checksum: String,
    pub valid_count: usize,
    pub rejected_count: usize,
    /// Valid records that lost to a more recent record with the same key
    pub duplicate_count: usize,
    /// Valid records the table already held at the same or a newer capture time
    pub already_applied_count: usize,
    /// Records from this file committed by the load (would-be count in dry runs)
    pub loaded_count: usize,
    pub status: FileStatus,
    /// Where the router moved the file, if it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routed_to: Option<String>,
    pub rejections: Vec<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Record counts, summed across files or pipelines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub files: usize,
    pub valid: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub already_applied: usize,
    pub loaded: usize,
}

impl AddAssign for Totals {
    fn add_assign(&mut self, other: Self) {
        self.files += other.files;
        self.valid += other.valid;
        self.rejected += other.rejected;
        self.duplicates += other.duplicates;
        self.already_applied += other.already_applied;
        self.loaded += other.loaded;
    }
}

impl From<&IngestOutcome> for Totals {
    fn from(outcome: &IngestOutcome) -> Self {
        Self {
            files: 1,
            valid: outcome.valid_count,
            rejected: outcome.rejected_count,
            duplicates: outcome.duplicate_count,
            already_applied: outcome.already_applied_count,
            loaded: outcome.loaded_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    Failed,
    DryRun,
    Cancelled,
}

/// Result of one (source, data type) pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    pub source_id: String,
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
    pub status: PipelineStatus,
    pub files: Vec<IngestOutcome>,
    pub totals: Totals,
    pub watermark_before: Option<DateTime<Utc>>,
    pub watermark_after: Option<DateTime<Utc>>,
    /// Load attempts made, 0 when nothing needed loading
    pub load_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl PipelineReport {
    pub fn new(source_id: impl Into<String>, data_type: impl Into<String>, target_table: Option<String>) -> Self {
        Self {
            source_id: source_id.into(),
            data_type: data_type.into(),
            target_table,
            status: PipelineStatus::Succeeded,
            files: Vec::new(),
            totals: Totals::default(),
            watermark_before: None,
            watermark_after: None,
            load_attempts: 0,
            error: None,
            warnings: Vec::new(),
        }
    }

    pub fn push_file(&mut self, outcome: IngestOutcome) {
        self.totals += Totals::from(&outcome);
        self.files.push(outcome);
    }

    pub fn fail(&mut self, error: impl std::fmt::Display) {
        self.status = PipelineStatus::Failed;
        self.error = Some(error.to_string());
    }

    /// A pipeline counts against the run when it failed outright or had to
    /// quarantine a whole file.
    pub fn has_failures(&self) -> bool {
        self.status == PipelineStatus::Failed
            || self.files.iter().any(|f| f.status == FileStatus::TotalFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some pipelines failed while others succeeded
    PartialRunFailure,
    /// Every pipeline failed
    TotalFailure,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::TotalFailure => 1,
            RunStatus::PartialRunFailure => 2,
            RunStatus::Cancelled => 130,
        }
    }

    fn from_pipelines(pipelines: &[PipelineReport]) -> Self {
        if pipelines.iter().any(|p| p.status == PipelineStatus::Cancelled) {
            return RunStatus::Cancelled;
        }
        let failed = pipelines.iter().filter(|p| p.has_failures()).count();
        match failed {
            0 => RunStatus::Success,
            n if n == pipelines.len() => RunStatus::TotalFailure,
            _ => RunStatus::PartialRunFailure,
        }
    }
}

/// Aggregate of every pipeline in one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub env: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: RunStatus,
    pub totals: Totals,
    pub pipelines: Vec<PipelineReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn build(
        run_id: Uuid,
        env: impl Into<String>,
        dry_run: bool,
        started_at: DateTime<Utc>,
        mut pipelines: Vec<PipelineReport>,
    ) -> Self {
        pipelines.sort_by(|a, b| (&a.source_id, &a.data_type).cmp(&(&b.source_id, &b.data_type)));

        let mut totals = Totals::default();
        let mut warnings = Vec::new();
        for pipeline in &pipelines {
            totals += pipeline.totals;
            warnings.extend(
                pipeline
                    .warnings
                    .iter()
                    .map(|w| format!("{}/{}: {}", pipeline.source_id, pipeline.data_type, w)),
            );
        }

        Self {
            run_id,
            env: env.into(),
            dry_run,
            started_at,
            completed_at: Utc::now(),
            status: RunStatus::from_pipelines(&pipelines),
            totals,
            pipelines,
            warnings,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }

    pub fn pipeline(&self, source_id: &str, data_type: &str) -> Option<&PipelineReport> {
        self.pipelines
            .iter()
            .find(|p| p.source_id == source_id && p.data_type == data_type)
    }
}
