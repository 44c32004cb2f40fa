//! One Cleanup Job run, for cron or a Kubernetes CronJob.
use anyhow::{Context, Result};
use clap::Parser;
use db_pool::{close_pool, create_pool, DbConfig};
use events_service::clock::SystemClock;
use events_service::db::PgDedupStore;
use events_service::services::CleanupJob;
use events_service::{telemetry, Config};
use std::sync::Arc;
use std::time::Duration;
use transactional_outbox::SqlxOutboxRepository;

const SERVICE_NAME: &str = "events-cleanup";

#[derive(Parser, Debug)]
#[command(author, version, about = "Prune the hot events mirror", long_about = None)]
struct Args {
    /// Override HOT_EVENTS_RETENTION_DAYS
    #[arg(long)]
    retention_days: Option<u64>,

    /// Override MARKER_RETENTION_DAYS (markers are kept forever when unset)
    #[arg(long)]
    marker_retention_days: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(&config.app.log_format);

    let hot_retention = args
        .retention_days
        .map(|d| Duration::from_secs(d * 24 * 60 * 60))
        .unwrap_or_else(|| config.app.hot_events_retention());
    let marker_retention = args
        .marker_retention_days
        .map(|d| Duration::from_secs(d * 24 * 60 * 60))
        .or_else(|| config.app.marker_retention());

    let pool = create_pool(DbConfig::for_service(SERVICE_NAME))
        .await
        .context("Failed to connect to PostgreSQL")?;

    let job = CleanupJob::new(
        Arc::new(PgDedupStore::new(pool.clone())),
        Arc::new(SqlxOutboxRepository::new(pool.clone())),
        Arc::new(SystemClock),
        hot_retention,
        marker_retention,
    );
    let result = job.run().await;
    close_pool(&pool, SERVICE_NAME).await;

    let report = result.context("Cleanup failed")?;
    println!("hot events deleted:    {}", report.hot_events_deleted);
    println!("outbox entries purged: {}", report.outbox_purged);
    println!("event markers retired: {}", report.event_markers_retired);
    println!("batch markers retired: {}", report.batch_markers_retired);
    Ok(())
}
