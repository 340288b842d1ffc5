//! lifedata-ingest - load landing-zone files into the warehouse

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use lifedata_common::logging::{init_logging, LogConfig, LogLevel};
use lifedata_ingest::{
    storage, AdapterRegistry, IngestConfig, OrchestratorConfig, PostgresWarehouse, RunOrchestrator,
    RunRequest,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lifedata-ingest")]
#[command(author, version, about = "Load landing-zone JSON files into the warehouse")]
struct Cli {
    /// Sources to ingest, comma separated (e.g. spotify,strava)
    #[arg(long = "service", value_delimiter = ',', required = true)]
    services: Vec<String>,

    /// Only these data types, comma separated
    #[arg(long, value_delimiter = ',')]
    data_types: Option<Vec<String>>,

    /// Environment name; selects `.env.{env}` and the default warehouse schema
    #[arg(long, env = "LIFEDATA_ENV", default_value = lifedata_ingest::config::DEFAULT_ENV)]
    env: String,

    /// Validate and deduplicate only: no load, no file moves
    #[arg(long)]
    dry_run: bool,

    /// Only files captured at or after this time (RFC 3339 or epoch seconds)
    #[arg(long, value_parser = parse_since)]
    since: Option<DateTime<Utc>>,

    /// Pipelines to run at once (overrides INGEST_CONCURRENCY)
    #[arg(long)]
    concurrency: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_since(value: &str) -> Result<DateTime<Utc>, String> {
    lifedata_common::time::parse_timestamp_str(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over flags
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("lifedata-ingest")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    let mut config = IngestConfig::load(&cli.env)?;
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency;
        config.validate()?;
    }

    let registry = match &config.adapters_file {
        Some(path) => AdapterRegistry::from_file(path)?,
        None => AdapterRegistry::builtin()?,
    };

    let store = storage::connect(&config.storage)
        .await
        .context("Failed to initialize landing storage")?;
    let warehouse = PostgresWarehouse::connect(&config.database).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight pipelines");
                cancel.cancel();
            }
        }
    });

    let orchestrator = RunOrchestrator::new(
        Arc::new(registry),
        store,
        Arc::new(warehouse),
        OrchestratorConfig::from(&config),
    )
    .with_cancellation(cancel);

    let request = RunRequest {
        sources: cli.services,
        data_types: cli.data_types,
        since: cli.since,
        dry_run: cli.dry_run,
    };

    let report = orchestrator.run(&request).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("Failed to serialize run report")?
    );

    for warning in &report.warnings {
        warn!("{}", warning);
    }
    info!(run_id = %report.run_id, exit_code = report.exit_code(), "Done");

    Ok(ExitCode::from(report.exit_code()))
}
