//! Quarry CLI (`quarry`)
//!
//! Runs one query job end to end against an in-process warehouse loaded from
//! an NDJSON file, and writes the result as CSV to a local directory or an
//! S3 bucket.
//!
//! ```bash
//! quarry export --data rows.ndjson --sql "SELECT * FROM rows" --output-dir ./out
//! quarry export --data rows.ndjson --sql "SELECT * FROM rows ORDER BY id" --bucket exports
//! ```
//!
//! Job settings come from the `QUARRY_*` environment variables read by
//! [`JobConfig::from_env`]. S3 credentials and region come from the usual
//! `AWS_*` variables. `SHUTDOWN_TIMEOUT_SECS` bounds the wait for cancelled
//! jobs after Ctrl+C (default: 30).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use object_store::aws::AmazonS3Builder;
use quarry_jobs::{metrics, Job, JobConfig, JobStore, ResultSink, ResultStore};
use quarry_warehouse::{InMemoryWarehouse, MemoryTable};
use tracing::{info, warn};

mod data;

/// Table id the loaded rows are registered under.
const EXPORT_TABLE: &str = "export";

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Quarry query job exporter", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query over NDJSON rows and export the result as CSV
    Export(ExportArgs),
}

#[derive(Args)]
struct ExportArgs {
    /// NDJSON file holding the result rows
    #[arg(long)]
    data: PathBuf,

    /// Query text the rows answer
    #[arg(long)]
    sql: String,

    #[arg(long, env = "QUARRY_REPORT_ID", default_value = "adhoc")]
    report_id: String,

    #[arg(long, env = "QUARRY_QUERY_ID", default_value = "export")]
    query_id: String,

    /// Partitions the warehouse grants per read session
    #[arg(long, default_value_t = 4)]
    partitions_available: u32,

    /// Local directory for result files
    #[arg(long, env = "QUARRY_OUTPUT_DIR", conflicts_with = "bucket")]
    output_dir: Option<PathBuf>,

    /// S3 bucket for result files
    #[arg(long, env = "QUARRY_RESULT_BUCKET")]
    bucket: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, env = "QUARRY_RESULT_PREFIX", default_value = "results")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    metrics::init();

    let cli = Cli::parse();
    let ok = match cli.command {
        Commands::Export(args) => export(args).await?,
    };
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn shutdown_timeout() -> Duration {
    let secs = std::env::var("SHUTDOWN_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

fn result_store(args: &ExportArgs) -> Result<ResultStore> {
    if let Some(bucket) = &args.bucket {
        let s3 = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .with_context(|| format!("Failed to configure bucket {}", bucket))?;
        return Ok(ResultStore::new(Arc::new(s3), args.prefix.clone()));
    }

    let dir = args.output_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    ResultStore::local(&dir).with_context(|| format!("Failed to open {}", dir.display()))
}

/// Returns whether the job finished without an error.
async fn export(args: ExportArgs) -> Result<bool> {
    let text = tokio::fs::read_to_string(&args.data)
        .await
        .with_context(|| format!("Failed to read {}", args.data.display()))?;
    let parsed = data::parse_ndjson(&text)
        .with_context(|| format!("Failed to parse {}", args.data.display()))?;
    let table = MemoryTable::from_string_columns(&parsed.columns, parsed.rows)
        .context("Failed to build the result table")?;
    info!(rows = table.len(), columns = parsed.columns.len(), "Loaded rows");

    let config = JobConfig::from_env();
    let project = config.project_id.clone().unwrap_or_else(|| "local".to_string());
    let warehouse = Arc::new(
        InMemoryWarehouse::new(project).with_available_partitions(args.partitions_available),
    );
    warehouse.register_table(EXPORT_TABLE, table);
    warehouse.on_query(args.sql.as_str(), EXPORT_TABLE);

    let results = result_store(&args)?;
    let store = JobStore::new(config);
    let (job, mut status) = store.create(
        args.report_id.as_str(),
        args.query_id.as_str(),
        args.sql.as_str(),
    )?;
    let sink: Arc<dyn ResultSink> = results.sink(job.id());
    println!("job {} status: {}", job.id(), *status.borrow_and_update());

    let signals = {
        let store = store.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received SIGINT (Ctrl+C), cancelling jobs");
                    store.cancel_all();
                }
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
            }
        })
    };

    if let Err(e) = job.run(warehouse, Arc::clone(&sink)).await {
        warn!(job_id = %job.id(), error = %e, "Job did not start");
    }

    loop {
        tokio::select! {
            biased;
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("job {} status: {}", job.id(), *status.borrow_and_update());
            }
            _ = job.core().finished() => break,
        }
    }
    let interrupted = signals.is_finished();
    signals.abort();

    let timeout = shutdown_timeout();
    if tokio::time::timeout(timeout, job.settled()).await.is_err() {
        warn!(job_id = %job.id(), "Timed out waiting for the job to settle");
    }
    if interrupted && !store.drain(timeout).await {
        warn!(jobs = store.len(), "Jobs still live at shutdown");
    }

    println!("state:           {}", job.state());
    println!(
        "total rows:      {}",
        job.total_rows().map_or_else(|| "-".to_string(), |n| n.to_string())
    );
    println!(
        "processed bytes: {}",
        job.processed_bytes().map_or_else(|| "-".to_string(), |n| n.to_string())
    );
    println!("result size:     {}", job.result_size());
    if let Some(result_id) = job.result_id() {
        println!("result id:       {}", result_id);
        println!("location:        {}", sink.location());
    }

    match job.error() {
        Some(error) => {
            eprintln!("error: {}", error);
            Ok(false)
        }
        None => Ok(job.result_id().is_some()),
    }
}
