//! Postgres loader
//!
//! Each data type owns one table in the environment schema:
//!
//! ```sql
//! natural_key     TEXT PRIMARY KEY   -- canonical JSON array of key values
//! key_fields      JSONB              -- {"field": value, ...}
//! payload         JSONB
//! inserted_at     TIMESTAMPTZ        -- capture time, drives recency
//! source_file     TEXT               -- landing key the row came from
//! dp_inserted_at  TIMESTAMPTZ        -- first commit
//! dp_updated_at   TIMESTAMPTZ        -- last commit
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{LoadResult, Warehouse};
use crate::adapters::is_valid_identifier;
use crate::error::{IngestError, IngestResult, LoadError};
use crate::types::{NaturalKey, ValidRecord};

/// Rows per INSERT statement (7 binds each, well under the 65535 limit)
const LOAD_CHUNK_SIZE: usize = 1000;
const KEY_LOOKUP_CHUNK_SIZE: usize = 5000;

#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    /// Schema holding the target tables, one per environment
    pub schema: String,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("schema", &self.schema)
            .finish()
    }
}

pub async fn create_pool(config: &DatabaseConfig) -> IngestResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| IngestError::Config(format!("Failed to connect to warehouse: {}", e)))?;

    info!(
        max_connections = config.max_connections,
        schema = %config.schema,
        "Warehouse connection pool created"
    );

    Ok(pool)
}

#[derive(Clone)]
pub struct PostgresWarehouse {
    pool: PgPool,
    schema: String,
}

impl PostgresWarehouse {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> IngestResult<Self> {
        let schema = schema.into();
        if !is_valid_identifier(&schema) {
            return Err(IngestError::Config(format!("Invalid warehouse schema: {}", schema)));
        }
        Ok(Self { pool, schema })
    }

    pub async fn connect(config: &DatabaseConfig) -> IngestResult<Self> {
        Self::new(create_pool(config).await?, config.schema.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn qualified(&self, table: &str) -> Result<String, LoadError> {
        if !is_valid_identifier(table) {
            return Err(LoadError::structural(format!("Invalid table name: {}", table)));
        }
        Ok(format!("\"{}\".\"{}\"", self.schema, table))
    }

    /// Create the schema and table if missing. Deployed environments
    /// provision tables separately; this is for development and tests.
    #[instrument(skip(self))]
    pub async fn ensure_table(&self, table: &str) -> Result<(), LoadError> {
        let qualified = self.qualified(table)?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", self.schema))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                natural_key TEXT PRIMARY KEY,
                key_fields JSONB NOT NULL,
                payload JSONB NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL,
                source_file TEXT NOT NULL,
                dp_inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                dp_updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            qualified
        ))
        .execute(&self.pool)
        .await?;

        debug!("Ensured table {}", qualified);
        Ok(())
    }
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    #[instrument(skip(self))]
    async fn watermark(&self, table: &str) -> Result<Option<DateTime<Utc>>, LoadError> {
        let sql = format!("SELECT MAX(inserted_at) FROM {}", self.qualified(table)?);
        let watermark: Option<DateTime<Utc>> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(watermark)
    }

    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    async fn committed_versions(
        &self,
        table: &str,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, DateTime<Utc>>, LoadError> {
        let sql = format!(
            "SELECT natural_key, inserted_at FROM {} WHERE natural_key = ANY($1)",
            self.qualified(table)?
        );
        let by_encoding: HashMap<&str, &NaturalKey> = keys.iter().map(|k| (k.encoded(), k)).collect();
        let mut versions = HashMap::new();

        for chunk in keys.chunks(KEY_LOOKUP_CHUNK_SIZE) {
            let encoded: Vec<String> = chunk.iter().map(|k| k.encoded().to_string()).collect();
            let rows: Vec<(String, DateTime<Utc>)> =
                sqlx::query_as(&sql).bind(encoded).fetch_all(&self.pool).await?;

            for (natural_key, inserted_at) in rows {
                if let Some(key) = by_encoding.get(natural_key.as_str()) {
                    versions.insert((*key).clone(), inserted_at);
                }
            }
        }

        Ok(versions)
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn load(&self, table: &str, records: &[ValidRecord]) -> Result<LoadResult, LoadError> {
        let qualified = self.qualified(table)?;
        if records.is_empty() {
            return Ok(LoadResult { committed_count: 0 });
        }

        let committed_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut committed_count = 0;

        for chunk in records.chunks(LOAD_CHUNK_SIZE) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} AS t (natural_key, key_fields, payload, inserted_at, source_file, dp_inserted_at, dp_updated_at) ",
                qualified
            ));

            query_builder.push_values(chunk.iter(), |mut b, record| {
                b.push_bind(record.key().encoded().to_string())
                    .push_bind(Json(record.key().to_json_object()))
                    .push_bind(Json(record.payload().clone()))
                    .push_bind(record.inserted_at())
                    .push_bind(record.source_file().path.clone())
                    .push_bind(committed_at)
                    .push_bind(committed_at);
            });

            query_builder.push(
                r#"
                ON CONFLICT (natural_key) DO UPDATE SET
                    key_fields = EXCLUDED.key_fields,
                    payload = EXCLUDED.payload,
                    inserted_at = EXCLUDED.inserted_at,
                    source_file = EXCLUDED.source_file,
                    dp_updated_at = EXCLUDED.dp_updated_at
                WHERE EXCLUDED.inserted_at > t.inserted_at
                "#,
            );

            let result = query_builder.build().execute(&mut *tx).await?;
            committed_count += result.rows_affected();
        }

        tx.commit().await?;

        info!(table = %qualified, committed = committed_count, "Committed load");
        Ok(LoadResult { committed_count })
    }
}
