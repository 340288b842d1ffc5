//! Record parser and validator
//!
//! Splits a landing file into lines and classifies each one. Nothing here
//! does I/O; the caller hands over the file's bytes.

use chrono::{DateTime, NaiveDate, Utc};
use lifedata_common::checksum::sha256_hex;
use lifedata_common::time::parse_capture_timestamp;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::adapters::{lookup_field, DataTypeSpec, KeyError};
use crate::types::{LandingFile, RawRecord, RejectedRecord, RejectionReason, ValidRecord};

/// Classification of one landing file
#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub file: Arc<LandingFile>,
    pub valid: Vec<ValidRecord>,
    pub rejected: Vec<RejectedRecord>,
    /// SHA-256 of the file contents
    pub checksum: String,
}

pub struct RecordParser<'a> {
    spec: &'a DataTypeSpec,
}

impl<'a> RecordParser<'a> {
    pub fn new(spec: &'a DataTypeSpec) -> Self {
        Self { spec }
    }

    /// Classify every non-blank line of `data`. An empty file yields no
    /// records of either kind.
    pub fn parse_file(&self, file: Arc<LandingFile>, data: &[u8]) -> ParsedFile {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();

        for (index, line) in data.split(|b| *b == b'\n').enumerate() {
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match self.classify_line(&file, index + 1, line) {
                Ok(record) => valid.push(record),
                Err(record) => rejected.push(record),
            }
        }

        debug!(
            path = %file.path,
            valid = valid.len(),
            rejected = rejected.len(),
            "Parsed landing file"
        );

        ParsedFile {
            checksum: sha256_hex(data),
            file,
            valid,
            rejected,
        }
    }

    fn classify_line(
        &self,
        file: &Arc<LandingFile>,
        line_number: usize,
        line: &[u8],
    ) -> Result<ValidRecord, RejectedRecord> {
        let reject = |reason: RejectionReason| RejectedRecord {
            source_file: Arc::clone(file),
            line_number,
            reason,
            raw_line: String::from_utf8_lossy(line).into_owned(),
        };

        let payload: Value = serde_json::from_slice(line).map_err(|_| reject(RejectionReason::MalformedJson))?;
        if !payload.is_object() {
            return Err(reject(RejectionReason::TypeMismatch("record".to_string())));
        }

        let shape = self.spec.validate_shape(&payload);
        if let Some(field) = shape.missing_fields.into_iter().next() {
            return Err(reject(RejectionReason::MissingField(field)));
        }

        let key = self.spec.derive_key(&payload).map_err(|e| match e {
            KeyError::Missing(_) => reject(RejectionReason::MissingNaturalKey),
            KeyError::NotScalar(field) => reject(RejectionReason::TypeMismatch(field)),
        })?;

        let inserted_at = match lookup_field(&payload, &self.spec.inserted_at_field) {
            None | Some(Value::Null) => file.discovered_at,
            Some(value) => parse_capture_timestamp(value)
                .ok()
                .filter(is_storable_timestamp)
                .ok_or_else(|| reject(RejectionReason::TypeMismatch(self.spec.inserted_at_field.clone())))?,
        };

        if let Some(field) = find_nul(&payload, "") {
            return Err(reject(RejectionReason::TypeMismatch(field)));
        }

        let raw = RawRecord {
            payload,
            source_file: Arc::clone(file),
            line_number,
        };
        Ok(ValidRecord::new(raw, key, inserted_at))
    }
}

/// Earliest TIMESTAMPTZ Postgres accepts: 4713-11-24 BC (astronomical year -4712).
/// The upper bound (294276 AD) lies beyond what chrono can represent.
fn is_storable_timestamp(ts: &DateTime<Utc>) -> bool {
    NaiveDate::from_ymd_opt(-4712, 11, 24)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .is_some_and(|min| ts.naive_utc() >= min)
}

/// Dotted path of the first string or object key containing U+0000, which
/// JSONB cannot store. Array elements report the array's path.
fn find_nul(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::String(s) if s.contains('\0') => Some(if path.is_empty() {
            "record".to_string()
        } else {
            path.to_string()
        }),
        Value::Array(items) => items.iter().find_map(|item| find_nul(item, path)),
        Value::Object(map) => map.iter().find_map(|(key, item)| {
            let child = if path.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", path, key)
            };
            if key.contains('\0') {
                Some(child)
            } else {
                find_nul(item, &child)
            }
        }),
        _ => None,
    }
}
