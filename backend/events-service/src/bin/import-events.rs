//! Submit a CSV dataset to the work queue in idempotent chunks.
//!
//! Usage: import-events <path> [--chunk-size N] [--fingerprint content|metadata]
use anyhow::{Context, Result};
use clap::Parser;
use db_pool::{close_pool, create_pool, DbConfig};
use events_service::db::PgDedupStore;
use events_service::services::{BatchImporter, FingerprintStrategy};
use events_service::{telemetry, Config};
use redis_utils::RedisPool;
use resilience::RetryConfig;
use std::path::PathBuf;
use std::sync::Arc;
use task_queue::RedisTaskQueue;
use tracing::info;

const SERVICE_NAME: &str = "import-events";

#[derive(Parser, Debug)]
#[command(author, version, about = "Import a CSV file of events", long_about = None)]
struct Args {
    /// CSV with header event_id,occurred_at,user_id,event_type,properties_json
    path: PathBuf,

    /// Events per queued chunk (defaults to IMPORT_CHUNK_SIZE)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// How the file is identified across runs
    #[arg(long, default_value = "content")]
    fingerprint: FingerprintStrategy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(&config.app.log_format);

    let pool = create_pool(DbConfig::for_service(SERVICE_NAME))
        .await
        .context("Failed to connect to PostgreSQL")?;
    let redis = RedisPool::connect(&config.app.redis_url, &RetryConfig::default()).await?;

    let importer = BatchImporter::new(
        Arc::new(PgDedupStore::new(pool.clone())),
        Arc::new(RedisTaskQueue::new(redis.manager(), &config.queue.namespace)),
        args.chunk_size.unwrap_or(config.app.import_chunk_size),
    );

    info!(path = %args.path.display(), strategy = %args.fingerprint, "Starting import");
    let result = importer.import_file(&args.path, args.fingerprint).await;
    close_pool(&pool, SERVICE_NAME).await;

    let report = result.with_context(|| format!("Import of {} failed", args.path.display()))?;
    println!("fingerprint:              {}", report.fingerprint);
    println!("rows read:                {}", report.rows_read);
    println!("rows skipped:             {}", report.rows_skipped);
    println!("chunks enqueued:          {}", report.chunks_enqueued);
    println!("chunks already submitted: {}", report.chunks_already_submitted);
    Ok(())
}
