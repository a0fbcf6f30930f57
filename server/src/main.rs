//! Order gateway process.
//!
//! Wires the Postgres order store, the Redis stream bus and the partner HTTP
//! client into a worker pool and a sweep scheduler, exports Prometheus
//! metrics, and drains the workers on Ctrl+C or SIGTERM.

use order_gateway_core::config::GatewayConfig;
use order_gateway_core::environment::{Clock, SystemClock};
use order_gateway_core::order_store::OrderStore;
use order_gateway_core::partner::PartnerClient;
use order_gateway_core::stream_bus::StreamBus;
use order_gateway_partner::PartnerHttpClient;
use order_gateway_postgres::PostgresOrderStore;
use order_gateway_redis::RedisStreamBus;
use order_gateway_runtime::{CallGuard, MetricsServer, Processor, SweepScheduler, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine; the environment may already be set.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,order_gateway=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting order gateway");

    let config = GatewayConfig::from_env()?;
    info!(
        redis_url = %config.redis.url,
        partner_url = %config.partner.base_url,
        workers = config.worker.pool_size,
        main_stream = %config.stream.main_stream,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    let mut metrics_server = MetricsServer::new(metrics_addr);
    metrics_server.start()?;

    info!("Connecting to order store database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await?;
    let postgres = PostgresOrderStore::from_pool(pool);
    postgres.ensure_schema().await?;
    let store: Arc<dyn OrderStore> = Arc::new(postgres);
    info!("Order store ready");

    info!("Connecting to Redis stream bus...");
    let bus: Arc<dyn StreamBus> =
        Arc::new(RedisStreamBus::new(&config.redis.url, config.stream.clone()).await?);
    info!("Stream bus connected");

    let partner = PartnerHttpClient::new(&config.partner)?;
    match partner.request_kinds().await {
        Ok(kinds) => info!(kinds = %kinds, "Partner reachable"),
        Err(e) => warn!(error = %e, "Partner reachability check failed; continuing, calls are guarded"),
    }
    let partner: Arc<dyn PartnerClient> = Arc::new(partner);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let guard = Arc::new(CallGuard::new(&config.resilience));

    let processor = Arc::new(Processor::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        partner,
        guard,
        Arc::clone(&clock),
        &config,
    ));
    processor.ensure_group().await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let workers = WorkerPool::new(processor).spawn(&shutdown_tx);
    info!(count = workers.len(), "Worker pool started");

    let sweep = Arc::new(SweepScheduler::new(store, bus, clock, &config)).spawn(shutdown_tx.subscribe());
    info!(
        interval_secs = config.sweep.interval_secs,
        stale_after_secs = config.sweep.stale_after_secs,
        "Sweep scheduler started"
    );

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    let drain = async move {
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        if let Err(e) = sweep.await {
            error!(error = %e, "Sweep task failed");
        }
    };

    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    if tokio::time::timeout(timeout, drain).await.is_err() {
        warn!(
            timeout_secs = config.server.shutdown_timeout,
            "Shutdown timed out; unacknowledged entries will be redelivered"
        );
    }

    info!("Order gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
