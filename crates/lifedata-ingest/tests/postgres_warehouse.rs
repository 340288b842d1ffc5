//! Postgres warehouse tests using testcontainers
//!
//! These need Docker and are ignored by default:
//!
//! ```bash
//! cargo test -p lifedata-ingest --test postgres_warehouse -- --ignored
//! ```

mod common;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lifedata_ingest::pipeline::parser::RecordParser;
use lifedata_ingest::{DataTypeSpec, LandingFile, LoadErrorKind, PostgresWarehouse, ValidRecord, Warehouse};
use serde_json::{json, Value};
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

const SCHEMA: &str = "ingest_test";
const TABLE: &str = "tracks_plays";

struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    async fn start() -> Result<Self> {
        common::init_tracing();

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&format!("postgresql://postgres:postgres@{}:{}/postgres", host, port))
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    async fn warehouse(&self) -> Result<PostgresWarehouse> {
        let warehouse = PostgresWarehouse::new(self.pool.clone(), SCHEMA)?;
        warehouse.ensure_table(TABLE).await?;
        Ok(warehouse)
    }
}

fn parse(path: &str, lines: &[&str]) -> Vec<ValidRecord> {
    let spec = DataTypeSpec::new(&["id"], &["id"], TABLE);
    let file = Arc::new(LandingFile {
        path: path.to_string(),
        source_id: "tracks".to_string(),
        data_type: "plays".to_string(),
        discovered_at: Utc::now(),
        size: 0,
    });
    let parsed = RecordParser::new(&spec).parse_file(file, lines.join("\n").as_bytes());
    assert!(parsed.rejected.is_empty());
    parsed.valid
}

async fn row(pool: &PgPool, id: &str) -> (Value, Value, DateTime<Utc>, String, DateTime<Utc>, DateTime<Utc>) {
    sqlx::query_as(&format!(
        "SELECT payload, key_fields, inserted_at, source_file, dp_inserted_at, dp_updated_at \
         FROM \"{}\".\"{}\" WHERE natural_key = $1",
        SCHEMA, TABLE
    ))
    .bind(json!([id]).to_string())
    .fetch_one(pool)
    .await
    .unwrap()
}

fn utc(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_load_merges_newer_versions_only() {
    let pg = TestPostgres::start().await.unwrap();
    let warehouse = pg.warehouse().await.unwrap();
    // Creating the table twice is harmless
    warehouse.ensure_table(TABLE).await.unwrap();

    assert_eq!(warehouse.watermark(TABLE).await.unwrap(), None);

    let first = parse(
        "tracks/landing/plays_1.jsonl",
        &[
            r#"{"id":"a","inserted_at":"2024-01-02T00:00:00Z","v":1}"#,
            r#"{"id":"b","inserted_at":"2024-01-01T00:00:00Z","v":1}"#,
        ],
    );
    let result = warehouse.load(TABLE, &first).await.unwrap();
    assert_eq!(result.committed_count, 2);

    let (payload, key_fields, inserted_at, source_file, dp_inserted_at, _) = row(&pg.pool, "a").await;
    assert_eq!(payload["v"], 1);
    assert_eq!(key_fields, json!({"id": "a"}));
    assert_eq!(inserted_at, utc("2024-01-02T00:00:00Z"));
    assert_eq!(source_file, "tracks/landing/plays_1.jsonl");

    // `a` is older than what is stored and must be left alone; `b` is newer
    let second = parse(
        "tracks/landing/plays_2.jsonl",
        &[
            r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z","v":2}"#,
            r#"{"id":"b","inserted_at":"2024-01-03T00:00:00Z","v":2}"#,
        ],
    );
    let result = warehouse.load(TABLE, &second).await.unwrap();
    assert_eq!(result.committed_count, 1);

    let (payload, ..) = row(&pg.pool, "a").await;
    assert_eq!(payload["v"], 1);

    let (payload, _, inserted_at, source_file, b_inserted, b_updated) = row(&pg.pool, "b").await;
    assert_eq!(payload["v"], 2);
    assert_eq!(inserted_at, utc("2024-01-03T00:00:00Z"));
    assert_eq!(source_file, "tracks/landing/plays_2.jsonl");
    assert!(b_updated >= b_inserted);
    assert!(dp_inserted_at <= b_updated);

    assert_eq!(
        warehouse.watermark(TABLE).await.unwrap(),
        Some(utc("2024-01-03T00:00:00Z"))
    );
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_committed_versions_returns_stored_keys() {
    let pg = TestPostgres::start().await.unwrap();
    let warehouse = pg.warehouse().await.unwrap();

    let records = parse(
        "tracks/landing/plays_1.jsonl",
        &[
            r#"{"id":"a","inserted_at":"2024-01-02T00:00:00Z"}"#,
            r#"{"id":"b","inserted_at":"2024-01-01T00:00:00Z"}"#,
        ],
    );
    warehouse.load(TABLE, &records).await.unwrap();

    let lookup = parse(
        "tracks/landing/plays_2.jsonl",
        &[r#"{"id":"a"}"#, r#"{"id":"zzz"}"#],
    );
    let keys: Vec<_> = lookup.iter().map(|r| r.key().clone()).collect();
    let versions = warehouse.committed_versions(TABLE, &keys).await.unwrap();

    assert_eq!(versions.len(), 1);
    assert_eq!(versions.get(&keys[0]), Some(&utc("2024-01-02T00:00:00Z")));
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_large_batch_commits_atomically() {
    let pg = TestPostgres::start().await.unwrap();
    let warehouse = pg.warehouse().await.unwrap();

    let lines: Vec<String> = (0..2500)
        .map(|i| format!(r#"{{"id":"k{}","inserted_at":"2024-01-01T00:00:00Z"}}"#, i))
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let records = parse("tracks/landing/plays_big.jsonl", &refs);

    let result = warehouse.load(TABLE, &records).await.unwrap();
    assert_eq!(result.committed_count, 2500);

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\".\"{}\"", SCHEMA, TABLE))
        .fetch_one(&pg.pool)
        .await
        .unwrap();
    assert_eq!(count, 2500);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_missing_table_is_structural() {
    let pg = TestPostgres::start().await.unwrap();
    let warehouse = PostgresWarehouse::new(pg.pool.clone(), SCHEMA).unwrap();

    let records = parse("tracks/landing/plays_1.jsonl", &[r#"{"id":"a"}"#]);
    let err = warehouse.load("no_such_table", &records).await.unwrap_err();
    assert_eq!(err.kind, LoadErrorKind::Structural);
    assert!(!err.is_transient());
}
