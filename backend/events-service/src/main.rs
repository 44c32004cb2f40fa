use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use anyhow::Context;
use db_pool::{close_pool, create_pool, DbConfig};
use events_service::clock::SystemClock;
use events_service::db::{ClickHouseClient, PgDedupStore};
use events_service::handlers;
use events_service::services::{
    AnalyticsOutboxSink, CleanupHandler, CleanupJob, EventProcessor, ProcessEventsHandler,
    QueryEngine, RateLimiter, RedisCounterStore,
};
use events_service::{telemetry, AppState, Config};
use redis_utils::{redact_url, RedisPool};
use resilience::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use task_queue::{spawn_reclaimer, RedisTaskQueue, Worker, WorkerConfig};
use tokio::sync::watch;
use tracing::{error, info, warn};
use transactional_outbox::{metrics::OutboxMetrics, OutboxProcessor, SqlxOutboxRepository};

const SERVICE_NAME: &str = "events-service";

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init_tracing(&config.app.log_format);

    info!("Starting events-service");

    // PostgreSQL: markers, hot mirror, outbox
    let db_config = DbConfig::for_service(SERVICE_NAME);
    db_config.log_config();
    let pool = create_pool(db_config)
        .await
        .context("Failed to connect to PostgreSQL")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    // ClickHouse: analytical store
    let clickhouse = ClickHouseClient::new(&config.clickhouse)?;
    clickhouse
        .ensure_schema()
        .await
        .context("Failed to prepare ClickHouse schema")?;

    // Redis: work queue and rate limit counters
    info!(redis_url = %redact_url(&config.app.redis_url), "Connecting to Redis");
    let redis = RedisPool::connect(&config.app.redis_url, &RetryConfig::default()).await?;
    let queue = Arc::new(
        RedisTaskQueue::new(redis.manager(), &config.queue.namespace)
            .with_lease(config.queue.lease()),
    );

    let store = Arc::new(PgDedupStore::new(pool.clone()));
    let outbox_repo = Arc::new(SqlxOutboxRepository::new(pool.clone()));
    let writer = Arc::new(clickhouse.clone());
    let clock = Arc::new(SystemClock);

    let processor = Arc::new(EventProcessor::new(
        store.clone(),
        outbox_repo.clone(),
        writer.clone(),
        config.outbox.grace(),
    ));
    let cleanup = Arc::new(CleanupJob::new(
        store.clone(),
        outbox_repo.clone(),
        clock.clone(),
        config.app.hot_events_retention(),
        config.app.marker_retention(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Worker::new(
        queue.clone(),
        WorkerConfig {
            retry: config.queue.retry(),
            poll_wait: config.queue.poll_wait(),
        },
    )
    .register(Arc::new(ProcessEventsHandler::new(processor)))
    .register(Arc::new(CleanupHandler::new(cleanup)));
    let mut background = worker.spawn(config.app.worker_concurrency, shutdown_rx.clone());
    background.push(spawn_reclaimer(
        queue.clone(),
        config.queue.reclaim_interval(),
        shutdown_rx.clone(),
    ));
    info!(
        concurrency = config.app.worker_concurrency,
        lease_ms = config.queue.lease_ms,
        "Workers started"
    );

    let mut relay = OutboxProcessor::new(
        outbox_repo.clone(),
        Arc::new(AnalyticsOutboxSink::new(writer)),
        config.outbox.processor_config(),
    );
    match OutboxMetrics::new(SERVICE_NAME) {
        Ok(metrics) => relay = relay.with_metrics(metrics),
        Err(e) => warn!(error = %e, "Outbox metrics unavailable"),
    }
    let relay_shutdown = shutdown_rx.clone();
    background.push(tokio::spawn(async move {
        if let Err(e) = relay.start(relay_shutdown).await {
            error!(error = %e, "Outbox relay exited with error");
        }
    }));

    let limiter = Arc::new(RateLimiter::new(
        Arc::new(RedisCounterStore::new(redis.manager())),
        clock,
        config.app.rate_limit_per_minute,
        Duration::from_millis(config.app.rate_limit_timeout_ms),
    ));
    let state = web::Data::new(AppState {
        queue,
        queries: QueryEngine::new(clickhouse),
        rate_limiter: limiter,
    });

    let bind_address = format!("{}:{}", config.app.host, config.app.port);
    info!(address = %bind_address, "HTTP server listening");

    // Returns after SIGINT/SIGTERM once in-flight requests drain
    let server_result = HttpServer::new(move || {
        let state = state.clone();
        App::new()
            .app_data(state.clone())
            .wrap(actix_middleware::Logger::default())
            .configure(|cfg| handlers::configure(cfg, &state))
    })
    .bind(&bind_address)
    .with_context(|| format!("Failed to bind {}", bind_address))?
    .run()
    .await;

    info!("HTTP server stopped, draining background tasks");
    let _ = shutdown_tx.send(true);
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }

    close_pool(&pool, SERVICE_NAME).await;
    info!("events-service shut down");

    server_result.context("HTTP server error")
}
