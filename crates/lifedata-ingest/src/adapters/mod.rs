//! Source adapters
//!
//! An [`Adapter`] declares, for one upstream source, which data types it
//! lands and how to validate and identify their records. Adapters hold no
//! behaviour beyond that; everything else in the pipeline is source-agnostic.
//!
//! The registry is built once at startup (from [`builtin`] definitions or an
//! adapters file) and is read-only afterwards.

pub mod builtin;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::error::{IngestError, IngestResult};
use crate::types::NaturalKey;

const DEFAULT_INSERTED_AT_FIELD: &str = "inserted_at";

fn default_inserted_at_field() -> String {
    DEFAULT_INSERTED_AT_FIELD.to_string()
}

/// Valid warehouse identifier: lowercase, starts with a letter or underscore,
/// at most 63 bytes (Postgres NAMEDATALEN - 1).
pub fn is_valid_identifier(name: &str) -> bool {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Look up a possibly dotted field path (`track.id`) in a JSON object
pub fn lookup_field<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |value, segment| value.as_object()?.get(segment))
}

/// Present and not null
fn field_present(payload: &Value, path: &str) -> bool {
    lookup_field(payload, path).is_some_and(|v| !v.is_null())
}

/// Why a natural key could not be derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Field absent or null
    Missing(String),
    /// Field is an object or array
    NotScalar(String),
}

/// Result of a shape check: which required fields are absent or null
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeCheck {
    /// In sorted order
    pub missing_fields: Vec<String>,
}

impl ShapeCheck {
    pub fn is_valid(&self) -> bool {
        self.missing_fields.is_empty()
    }
}

/// Validation and identity rules for one data type of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeSpec {
    /// Fields forming the natural key, in order. Dotted paths address nested objects.
    pub natural_key_fields: Vec<String>,
    /// Fields that must be present and non-null
    #[serde(default)]
    pub required_fields: BTreeSet<String>,
    /// Warehouse table (within the environment schema)
    pub target_table: String,
    /// Field carrying the capture timestamp; absent means "use the file's timestamp"
    #[serde(default = "default_inserted_at_field")]
    pub inserted_at_field: String,
}

impl DataTypeSpec {
    pub fn new(
        natural_key_fields: &[&str],
        required_fields: &[&str],
        target_table: impl Into<String>,
    ) -> Self {
        Self {
            natural_key_fields: natural_key_fields.iter().map(|s| s.to_string()).collect(),
            required_fields: required_fields.iter().map(|s| s.to_string()).collect(),
            target_table: target_table.into(),
            inserted_at_field: default_inserted_at_field(),
        }
    }

    pub fn with_inserted_at_field(mut self, field: impl Into<String>) -> Self {
        self.inserted_at_field = field.into();
        self
    }

    /// Check required fields. Pure; never fails on a malformed payload.
    pub fn validate_shape(&self, payload: &Value) -> ShapeCheck {
        let missing_fields = self
            .required_fields
            .iter()
            .filter(|field| !field_present(payload, field))
            .cloned()
            .collect();
        ShapeCheck { missing_fields }
    }

    /// Derive the natural key, reporting the first offending field on failure
    pub fn derive_key(&self, payload: &Value) -> Result<NaturalKey, KeyError> {
        let mut fields = Vec::with_capacity(self.natural_key_fields.len());
        for name in &self.natural_key_fields {
            match lookup_field(payload, name) {
                None | Some(Value::Null) => return Err(KeyError::Missing(name.clone())),
                Some(Value::Object(_)) | Some(Value::Array(_)) => {
                    return Err(KeyError::NotScalar(name.clone()))
                },
                Some(value) => fields.push((name.clone(), value.clone())),
            }
        }
        Ok(NaturalKey::new(fields))
    }

    /// Natural key, or `None` if any key field is missing or not a scalar
    pub fn natural_key(&self, payload: &Value) -> Option<NaturalKey> {
        self.derive_key(payload).ok()
    }

    fn validate(&self, source_id: &str, data_type: &str) -> IngestResult<()> {
        let context = format!("{}/{}", source_id, data_type);
        if self.natural_key_fields.is_empty() {
            return Err(IngestError::InvalidAdapter(format!(
                "{}: natural_key_fields must not be empty",
                context
            )));
        }
        if self.natural_key_fields.iter().any(|f| f.is_empty() || f.split('.').any(str::is_empty)) {
            return Err(IngestError::InvalidAdapter(format!(
                "{}: natural key field paths must not contain empty segments",
                context
            )));
        }
        if !is_valid_identifier(&self.target_table) {
            return Err(IngestError::InvalidAdapter(format!(
                "{}: invalid target table '{}'",
                context, self.target_table
            )));
        }
        Ok(())
    }
}

/// Static description of one upstream source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adapter {
    pub source_id: String,
    data_types: BTreeMap<String, DataTypeSpec>,
}

impl Adapter {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            data_types: BTreeMap::new(),
        }
    }

    pub fn with_data_type(mut self, name: impl Into<String>, spec: DataTypeSpec) -> Self {
        self.data_types.insert(name.into(), spec);
        self
    }

    /// Declared data type names, sorted
    pub fn data_types(&self) -> impl Iterator<Item = &str> {
        self.data_types.keys().map(String::as_str)
    }

    pub fn data_type(&self, data_type: &str) -> IngestResult<&DataTypeSpec> {
        self.data_types
            .get(data_type)
            .ok_or_else(|| IngestError::UnknownDataType {
                source_id: self.source_id.clone(),
                data_type: data_type.to_string(),
            })
    }

    pub fn validate_shape(&self, data_type: &str, payload: &Value) -> IngestResult<ShapeCheck> {
        Ok(self.data_type(data_type)?.validate_shape(payload))
    }

    pub fn natural_key(&self, data_type: &str, payload: &Value) -> IngestResult<Option<NaturalKey>> {
        Ok(self.data_type(data_type)?.natural_key(payload))
    }

    fn validate(&self) -> IngestResult<()> {
        if !is_valid_identifier(&self.source_id) {
            return Err(IngestError::InvalidAdapter(format!(
                "invalid source id '{}'",
                self.source_id
            )));
        }
        if self.data_types.is_empty() {
            return Err(IngestError::InvalidAdapter(format!(
                "{}: no data types declared",
                self.source_id
            )));
        }
        for (name, spec) in &self.data_types {
            if !is_valid_identifier(name) {
                return Err(IngestError::InvalidAdapter(format!(
                    "{}: invalid data type name '{}'",
                    self.source_id, name
                )));
            }
            spec.validate(&self.source_id, name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AdaptersFile {
    adapters: Vec<Adapter>,
}

/// Read-only lookup of adapters by source id
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<Adapter>>,
}

impl AdapterRegistry {
    /// Build a registry, rejecting invalid definitions and duplicate source ids
    pub fn new(adapters: impl IntoIterator<Item = Adapter>) -> IngestResult<Self> {
        let mut map = BTreeMap::new();
        for adapter in adapters {
            adapter.validate()?;
            let source_id = adapter.source_id.clone();
            if map.insert(source_id.clone(), Arc::new(adapter)).is_some() {
                return Err(IngestError::InvalidAdapter(format!(
                    "duplicate source id '{}'",
                    source_id
                )));
            }
        }
        Ok(Self { adapters: map })
    }

    /// Registry with the adapters shipped in this crate
    pub fn builtin() -> IngestResult<Self> {
        Self::new(builtin::adapters())
    }

    /// Load adapter definitions from a TOML, YAML or JSON file
    pub fn from_file(path: &Path) -> IngestResult<Self> {
        let parsed: AdaptersFile = config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                IngestError::Config(format!("Failed to load adapters from {}: {}", path.display(), e))
            })?;

        let registry = Self::new(parsed.adapters)?;
        info!(path = %path.display(), sources = registry.len(), "Loaded adapter definitions");
        Ok(registry)
    }

    pub fn get_adapter(&self, source_id: &str) -> IngestResult<Arc<Adapter>> {
        let adapter = self
            .adapters
            .get(source_id)
            .cloned()
            .ok_or_else(|| IngestError::UnknownSource(source_id.to_string()))?;
        debug!(source = %source_id, "Resolved adapter");
        Ok(adapter)
    }

    pub fn source_ids(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
