use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{IngestError, IngestResult};

const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_BUCKET: &str = "lifedata-landing";
const DEFAULT_LOCAL_ROOT: &str = "./landing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Local,
}

impl std::str::FromStr for StorageBackend {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" | "minio" => Ok(StorageBackend::S3),
            "local" | "fs" => Ok(StorageBackend::Local),
            _ => Err(IngestError::Config(format!("Invalid storage backend: {}", s))),
        }
    }
}

/// Landing bucket location and credentials.
///
/// `access_key`/`secret_key` are optional: when unset the S3 client uses the
/// default AWS credential chain (environment, profile, instance role).
#[derive(Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
    /// Root directory standing in for the bucket when `backend` is `Local`
    pub local_root: PathBuf,
}

// Manual impl so credentials never end up in logs
impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("path_style", &self.path_style)
            .field("local_root", &self.local_root)
            .finish()
    }
}

impl StorageConfig {
    pub fn from_env() -> IngestResult<Self> {
        let backend = match env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StorageBackend::default(),
        };

        Ok(Self {
            backend,
            bucket: env::var("LANDING_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            endpoint: env::var("S3_ENDPOINT").ok().filter(|v| !v.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            access_key: env::var("S3_ACCESS_KEY").ok().filter(|v| !v.is_empty()),
            secret_key: env::var("S3_SECRET_KEY").ok().filter(|v| !v.is_empty()),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            local_root: env::var("LOCAL_LANDING_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOCAL_ROOT)),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::S3,
            bucket: bucket.into(),
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
            local_root: PathBuf::from(DEFAULT_LOCAL_ROOT),
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Local,
            bucket: DEFAULT_BUCKET.to_string(),
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
            local_root: root.into(),
        }
    }

    pub fn validate(&self) -> IngestResult<()> {
        match self.backend {
            StorageBackend::S3 if self.bucket.trim().is_empty() => {
                Err(IngestError::Config("LANDING_BUCKET must not be empty".to_string()))
            },
            StorageBackend::S3 if self.access_key.is_some() != self.secret_key.is_some() => Err(
                IngestError::Config("S3_ACCESS_KEY and S3_SECRET_KEY must be set together".to_string()),
            ),
            StorageBackend::Local if self.local_root.as_os_str().is_empty() => {
                Err(IngestError::Config("LOCAL_LANDING_ROOT must not be empty".to_string()))
            },
            _ => Ok(()),
        }
    }
}
