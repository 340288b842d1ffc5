//! Landing zone layout and scanner
//!
//! Within the bucket each source owns three prefixes:
//!
//! ```text
//! {source}/landing/{data_type}_{timestamp}.jsonl   staged by the fetchers
//! {source}/archive/{file}                          loaded
//! {source}/rejected/{file}                         quarantined whole
//! {source}/rejected/{stem}.rejected.jsonl          rejected lines of an archived file
//! ```

use chrono::{DateTime, Utc};
use lifedata_common::time::parse_file_timestamp;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::adapters::Adapter;
use crate::error::{IngestError, IngestResult};
use crate::storage::{ObjectMeta, ObjectStore};
use crate::types::LandingFile;

pub const LANDING_DIR: &str = "landing";
pub const ARCHIVE_DIR: &str = "archive";
pub const REJECTED_DIR: &str = "rejected";

const LANDING_EXTENSIONS: &[&str] = &["jsonl", "ndjson"];
const REJECTED_REPORT_SUFFIX: &str = ".rejected.jsonl";

pub fn landing_prefix(source_id: &str) -> String {
    format!("{}/{}/", source_id, LANDING_DIR)
}

pub fn archive_key(file: &LandingFile) -> String {
    format!("{}/{}/{}", file.source_id, ARCHIVE_DIR, file.file_name())
}

pub fn rejected_key(file: &LandingFile) -> String {
    format!("{}/{}/{}", file.source_id, REJECTED_DIR, file.file_name())
}

pub fn rejected_report_key(file: &LandingFile) -> String {
    format!(
        "{}/{}/{}{}",
        file.source_id,
        REJECTED_DIR,
        file.stem(),
        REJECTED_REPORT_SUFFIX
    )
}

/// Split a landing file name into its data type and optional timestamp.
///
/// Data types are matched longest first, so `saved_tracks_2024...` resolves
/// to `saved_tracks` even when a `saved` data type also exists.
pub fn parse_landing_name<'a>(
    file_name: &str,
    data_types: &[&'a str],
) -> Option<(&'a str, Option<DateTime<Utc>>)> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if !LANDING_EXTENSIONS.contains(&extension) {
        return None;
    }

    let mut candidates: Vec<&'a str> = data_types.to_vec();
    candidates.sort_by_key(|dt| std::cmp::Reverse(dt.len()));

    candidates.into_iter().find_map(|data_type| {
        if stem == data_type {
            return Some((data_type, None));
        }
        let suffix = stem.strip_prefix(data_type)?.strip_prefix('_')?;
        Some((data_type, parse_file_timestamp(suffix)))
    })
}

/// Lists candidate files in a source's landing prefix
#[derive(Clone)]
pub struct LandingScanner {
    store: Arc<dyn ObjectStore>,
}

impl LandingScanner {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// List landing files for `adapter`, optionally restricted to one data type
    /// and to files captured at or after `since`.
    ///
    /// Listing has no side effects and can be repeated. The result is sorted by
    /// discovery time then path, but callers must not treat that as recency.
    #[instrument(skip(self, adapter), fields(source = %adapter.source_id))]
    pub async fn list_files(
        &self,
        adapter: &Adapter,
        data_type: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> IngestResult<Vec<LandingFile>> {
        if let Some(dt) = data_type {
            adapter.data_type(dt)?;
        }

        let prefix = landing_prefix(&adapter.source_id);
        let objects = self.store.list(&prefix).await.map_err(IngestError::storage)?;
        let known: Vec<&str> = adapter.data_types().collect();
        let listed_at = Utc::now();

        let mut files: Vec<LandingFile> = objects
            .into_iter()
            .filter_map(|object| to_landing_file(&adapter.source_id, &prefix, &known, object, listed_at))
            .filter(|file| data_type.is_none_or(|dt| file.data_type == dt))
            .filter(|file| since.is_none_or(|since| file.discovered_at >= since))
            .collect();

        files.sort_by(|a, b| a.discovery_cmp(b));

        info!(
            prefix = %prefix,
            data_type = data_type.unwrap_or("*"),
            files = files.len(),
            "Scanned landing zone"
        );
        Ok(files)
    }
}

fn to_landing_file(
    source_id: &str,
    prefix: &str,
    known: &[&str],
    object: ObjectMeta,
    listed_at: DateTime<Utc>,
) -> Option<LandingFile> {
    let name = object.key.strip_prefix(prefix)?;
    if name.is_empty() || name.contains('/') {
        debug!(key = %object.key, "Skipping nested object in landing prefix");
        return None;
    }

    let Some((data_type, stamped)) = parse_landing_name(name, known) else {
        warn!(key = %object.key, "Skipping landing object that matches no data type");
        return None;
    };

    Some(LandingFile {
        source_id: source_id.to_string(),
        data_type: data_type.to_string(),
        discovered_at: stamped.or(object.last_modified).unwrap_or(listed_at),
        size: object.size,
        path: object.key,
    })
}
