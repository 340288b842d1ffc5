//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{IngestError, IngestResult};
use crate::retry::RetryPolicy;
use crate::storage::StorageConfig;
use crate::warehouse::postgres::DatabaseConfig;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default environment name; also the default warehouse schema.
pub const DEFAULT_ENV: &str = "dev";

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/lifedata";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Pipelines run at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

pub const DEFAULT_MAX_LOAD_ATTEMPTS: u32 = 3;

pub const DEFAULT_MAX_ROUTE_ATTEMPTS: u32 = 3;

/// Base delay between retries, doubled per attempt.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Runtime configuration for one invocation
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub env: String,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub concurrency: usize,
    pub load_retry: RetryPolicy,
    pub route_retry: RetryPolicy,
    /// Adapter definitions replacing the built-in ones
    pub adapters_file: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> IngestResult<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| IngestError::Config(format!("Invalid value for {}: {:?}", name, value))),
        Err(_) => Ok(None),
    }
}

impl IngestConfig {
    /// Load configuration for `env` from `.env.{env}`, `.env` and the
    /// process environment. Variables already set take precedence over both
    /// files, and `.env.{env}` over `.env`.
    pub fn load(env: &str) -> IngestResult<Self> {
        dotenvy::from_filename(format!(".env.{}", env)).ok();
        dotenvy::dotenv().ok();

        let backoff = Duration::from_millis(
            env_parse("INGEST_RETRY_BACKOFF_MS")?.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
        );

        let config = Self {
            env: env.to_string(),
            storage: StorageConfig::from_env()?,
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")?
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
                schema: std::env::var("WAREHOUSE_SCHEMA").unwrap_or_else(|_| env.to_string()),
            },
            concurrency: env_parse("INGEST_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY),
            load_retry: RetryPolicy {
                max_attempts: env_parse("INGEST_MAX_LOAD_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_LOAD_ATTEMPTS),
                base_backoff: backoff,
                ..RetryPolicy::default()
            },
            route_retry: RetryPolicy {
                max_attempts: env_parse("INGEST_MAX_ROUTE_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_ROUTE_ATTEMPTS),
                base_backoff: backoff,
                ..RetryPolicy::default()
            },
            adapters_file: std::env::var("ADAPTERS_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.env.trim().is_empty() {
            return Err(IngestError::Config("Environment name cannot be empty".to_string()));
        }

        self.storage.validate()?;

        if self.database.url.is_empty() {
            return Err(IngestError::Config("DATABASE_URL cannot be empty".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(IngestError::Config(
                "DATABASE_MAX_CONNECTIONS must be greater than 0".to_string(),
            ));
        }

        if self.concurrency == 0 {
            return Err(IngestError::Config("INGEST_CONCURRENCY must be greater than 0".to_string()));
        }

        if self.load_retry.max_attempts == 0 || self.route_retry.max_attempts == 0 {
            return Err(IngestError::Config("Retry attempts must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "INGEST_CONCURRENCY",
        "INGEST_MAX_LOAD_ATTEMPTS",
        "INGEST_RETRY_BACKOFF_MS",
        "WAREHOUSE_SCHEMA",
        "STORAGE_BACKEND",
        "LOCAL_LANDING_ROOT",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_follow_env_name() {
        clear();
        let config = IngestConfig::load("staging").unwrap();
        assert_eq!(config.env, "staging");
        assert_eq!(config.database.schema, "staging");
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.load_retry.max_attempts, DEFAULT_MAX_LOAD_ATTEMPTS);
        assert_eq!(config.load_retry.base_backoff, Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear();
        std::env::set_var("INGEST_CONCURRENCY", "8");
        std::env::set_var("INGEST_MAX_LOAD_ATTEMPTS", "5");
        std::env::set_var("INGEST_RETRY_BACKOFF_MS", "50");
        std::env::set_var("WAREHOUSE_SCHEMA", "analytics");
        std::env::set_var("STORAGE_BACKEND", "local");
        std::env::set_var("LOCAL_LANDING_ROOT", "/tmp/landing");

        let config = IngestConfig::load("prod").unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.load_retry.max_attempts, 5);
        assert_eq!(config.route_retry.base_backoff, Duration::from_millis(50));
        assert_eq!(config.database.schema, "analytics");
        assert_eq!(config.storage.backend, crate::storage::StorageBackend::Local);
        assert_eq!(config.storage.local_root, PathBuf::from("/tmp/landing"));
        clear();
    }

    #[test]
    #[serial]
    fn test_rejects_invalid_values() {
        clear();
        std::env::set_var("INGEST_CONCURRENCY", "0");
        assert!(IngestConfig::load("dev").is_err());

        std::env::set_var("INGEST_CONCURRENCY", "lots");
        assert!(matches!(IngestConfig::load("dev"), Err(IngestError::Config(_))));
        clear();
    }
}
