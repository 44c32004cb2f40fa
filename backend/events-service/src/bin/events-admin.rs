//! Operator commands for the dead-letter paths of the work queue and the
//! analytics outbox.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use db_pool::{close_pool, create_pool, DbConfig};
use events_service::{telemetry, Config};
use redis_utils::RedisPool;
use resilience::RetryConfig;
use task_queue::{RedisTaskQueue, TaskQueue};
use transactional_outbox::{OutboxRepository, SqlxOutboxRepository};

const SERVICE_NAME: &str = "events-admin";

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and replay failed pipeline work", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue depths
    QueueStats,
    /// List dead-lettered jobs, oldest first
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Move dead-lettered jobs back to the ready list
    ReplayDeadLetters {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Pending analytics writes and the age of the oldest one
    OutboxStats,
    /// Return dead outbox entries to pending
    ReplayDeadOutbox {
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Retry every undelivered outbox entry created since an RFC 3339 timestamp
    ReplayOutboxSince { since: DateTime<Utc> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(&config.app.log_format);

    match args.command {
        Command::QueueStats | Command::DeadLetters { .. } | Command::ReplayDeadLetters { .. } => {
            let redis = RedisPool::connect(&config.app.redis_url, &RetryConfig::default()).await?;
            let queue = RedisTaskQueue::new(redis.manager(), &config.queue.namespace);
            run_queue_command(&queue, args.command).await
        }
        command => {
            let pool = create_pool(DbConfig::for_service(SERVICE_NAME))
                .await
                .context("Failed to connect to PostgreSQL")?;
            let result = run_outbox_command(&SqlxOutboxRepository::new(pool.clone()), command).await;
            close_pool(&pool, SERVICE_NAME).await;
            result
        }
    }
}

async fn run_queue_command(queue: &RedisTaskQueue, command: Command) -> Result<()> {
    match command {
        Command::QueueStats => {
            let stats = queue.stats().await?;
            println!(
                "ready={} delayed={} in_flight={} dead={}",
                stats.ready, stats.delayed, stats.in_flight, stats.dead
            );
        }
        Command::DeadLetters { limit } => {
            for job in queue.dead_letters(limit).await? {
                println!(
                    "{} kind={} attempts={} enqueued_at={} error={}",
                    job.id,
                    job.kind,
                    job.attempts,
                    job.enqueued_at.to_rfc3339(),
                    job.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        Command::ReplayDeadLetters { limit } => {
            let count = queue.replay_dead_letters(limit).await?;
            println!("Returned {} dead jobs to ready", count);
        }
        other => anyhow::bail!("{:?} is not a queue command", other),
    }
    Ok(())
}

async fn run_outbox_command(repo: &SqlxOutboxRepository, command: Command) -> Result<()> {
    match command {
        Command::OutboxStats => {
            let (pending, age) = repo.pending_stats().await?;
            println!("pending={} oldest_pending_age_seconds={}", pending, age);
        }
        Command::ReplayDeadOutbox { limit } => {
            let count = repo.replay_dead(limit).await?;
            println!("Returned {} dead entries to pending", count);
        }
        Command::ReplayOutboxSince { since } => {
            let count = repo.replay_undelivered_since(since).await?;
            println!("Returned {} undelivered entries since {} to pending", count, since);
        }
        other => anyhow::bail!("{:?} is not an outbox command", other),
    }
    Ok(())
}
