//! Core record types for the landing-zone pipeline

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// One staged object in a source's landing prefix.
///
/// Identified by `path`; only lives for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LandingFile {
    /// Object key relative to the bucket, e.g. `spotify/landing/recently_played_20240102T000000Z.jsonl`
    pub path: String,
    pub source_id: String,
    pub data_type: String,
    /// Capture time of the file: the timestamp in its name, else object
    /// modification time, else the time it was listed.
    pub discovered_at: DateTime<Utc>,
    pub size: u64,
}

impl LandingFile {
    /// Final path segment of the object key
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// File name without its extension
    pub fn stem(&self) -> &str {
        let name = self.file_name();
        name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
    }

    /// Ordering used to break recency ties between files: later
    /// `discovered_at` is more recent, then path as a stable fallback.
    pub fn discovery_cmp(&self, other: &LandingFile) -> Ordering {
        self.discovered_at
            .cmp(&other.discovered_at)
            .then_with(|| self.path.cmp(&other.path))
    }
}

/// Derived identity of a record: the values of the adapter's natural key
/// fields, in declared order.
///
/// Equality, hashing and ordering use the canonical encoding (a JSON array of
/// the values), so `{"id": 1}` and `{"id": "1"}` are different keys.
#[derive(Debug, Clone)]
pub struct NaturalKey {
    fields: Vec<(String, Value)>,
    encoded: String,
}

impl NaturalKey {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        let values: Vec<&Value> = fields.iter().map(|(_, v)| v).collect();
        // Serializing a Vec<&Value> cannot fail: every Value is representable.
        let encoded = serde_json::to_string(&values).unwrap_or_default();
        Self { fields, encoded }
    }

    /// Canonical string form, stored in the warehouse `natural_key` column
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    /// Key fields as a JSON object, stored in the warehouse `key_fields` column
    pub fn to_json_object(&self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Value::Object(map)
    }
}

impl PartialEq for NaturalKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for NaturalKey {}

impl Hash for NaturalKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl PartialOrd for NaturalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NaturalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encoded.cmp(&other.encoded)
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl Serialize for NaturalKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encoded)
    }
}

/// One decoded JSON line, before validation
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub payload: Value,
    pub source_file: Arc<LandingFile>,
    /// 1-based physical line number in the landing file
    pub line_number: usize,
}

/// A record that passed validation.
///
/// Fields are private: the payload and the key derived from it are fixed at
/// parse time and cannot drift apart.
#[derive(Debug, Clone)]
pub struct ValidRecord {
    key: NaturalKey,
    inserted_at: DateTime<Utc>,
    payload: Value,
    source_file: Arc<LandingFile>,
    line_number: usize,
}

impl ValidRecord {
    pub(crate) fn new(raw: RawRecord, key: NaturalKey, inserted_at: DateTime<Utc>) -> Self {
        Self {
            key,
            inserted_at,
            payload: raw.payload,
            source_file: raw.source_file,
            line_number: raw.line_number,
        }
    }

    pub fn key(&self) -> &NaturalKey {
        &self.key
    }

    /// Capture time used for recency ordering and the committed-state check
    pub fn inserted_at(&self) -> DateTime<Utc> {
        self.inserted_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn source_file(&self) -> &Arc<LandingFile> {
        &self.source_file
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }
}

/// Why a line was quarantined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// Line is not valid JSON (or not UTF-8)
    MalformedJson,
    /// A required field is absent or null
    MissingField(String),
    /// A natural key field is absent or null
    MissingNaturalKey,
    /// A field has the wrong JSON type (`record` when the line is not an object)
    TypeMismatch(String),
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::MalformedJson => f.write_str("malformed_json"),
            RejectionReason::MissingField(field) => write!(f, "missing_field:{}", field),
            RejectionReason::MissingNaturalKey => f.write_str("missing_natural_key"),
            RejectionReason::TypeMismatch(field) => write!(f, "type_mismatch:{}", field),
        }
    }
}

impl Serialize for RejectionReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A line that failed validation, kept verbatim for the rejected report
#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub source_file: Arc<LandingFile>,
    pub line_number: usize,
    pub reason: RejectionReason,
    pub raw_line: String,
}
