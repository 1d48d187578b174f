use std::sync::Arc;

use health::{ReadinessCheck, ServingGate};
use payments_rs::config::Config;
use payments_rs::engine::AuthorizationEngine;
use payments_rs::metrics::Metrics;
use payments_rs::outbox::{OutboxWorker, OutboxWorkerConfig, ShutdownSignal};
use payments_rs::ratelimit::{self, RateLimiter};
use payments_rs::routes::health::{DbReadiness, HealthState};
use payments_rs::routes::{api_router, health_router, metrics_router, AppState};
use payments_rs::storage::postgres::{self, PgOutboxStore, PgStorage};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let cfg = Config::from_env().map_err(|e| format!("config error: {e}"))?;
    tracing::info!("config loaded");

    let pool = postgres::connect(&cfg.storage_url, 10).await?;
    postgres::run_migrations(&pool).await?;
    tracing::info!("storage connected and migrated");

    let redis_conn = ratelimit::connect(&cfg.kv_url).await?;
    let rate_limiter = Arc::new(RateLimiter::new(redis_conn));
    tracing::info!("rate limit store connected");

    let nats_client = async_nats::connect(&cfg.broker_addrs).await?;
    let bus: Arc<dyn event_bus::EventBus> = Arc::new(event_bus::NatsBus::new(nats_client));
    tracing::info!("broker connected");

    let metrics = Metrics::new();
    let storage = PgStorage::new(pool.clone());
    let idempotency_ttl = chrono::Duration::from_std(cfg.idempotency_ttl)
        .map_err(|e| format!("idempotency_ttl out of range: {e}"))?;
    let engine = Arc::new(
        AuthorizationEngine::new(storage.clone()).with_idempotency_ttl(idempotency_ttl),
    );

    let outbox_store = PgOutboxStore::new(pool.clone());
    let outbox_cfg = OutboxWorkerConfig {
        batch_size: cfg.outbox_batch_size,
        poll_interval: cfg.outbox_poll_interval,
        max_retries: cfg.outbox_max_retries,
        base_delay: cfg.outbox_base_delay,
        max_delay: cfg.outbox_max_delay,
        max_consecutive_failures: cfg.outbox_max_consecutive_failures,
        topic_prefix: cfg.topic_prefix.clone(),
    };
    let outbox_worker =
        Arc::new(OutboxWorker::new(outbox_store, bus, outbox_cfg).with_metrics(metrics.clone()));
    let outbox_shutdown = ShutdownSignal::new();

    let worker_handle = {
        let worker = outbox_worker.clone();
        let shutdown = outbox_shutdown.clone();
        tokio::spawn(async move {
            worker.run(shutdown).await;
        })
    };

    let serving = ServingGate::new();
    let checks: Vec<Box<dyn ReadinessCheck>> = vec![Box::new(DbReadiness(pool.clone()))];
    let health_state = HealthState {
        checks: Arc::new(checks),
        serving: serving.clone(),
    };

    let app_state = AppState {
        engine,
        storage,
        metrics: metrics.clone(),
    };

    let api = api_router(
        app_state,
        rate_limiter,
        cfg.rate_limit_per_window,
        cfg.rate_limit_window,
    )
    .merge(health_router(health_state));

    let api_addr = format!("0.0.0.0:{}", cfg.rpc_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    tracing::info!(addr = %api_addr, "payments API listening");

    let metrics_addr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
    tracing::info!(addr = %metrics_addr, "metrics listening");
    let metrics_app = metrics_router(metrics);

    let metrics_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(metrics_listener, metrics_app).await {
            tracing::error!(error = %err, "metrics server failed");
        }
    });

    let shutdown_grace = cfg.shutdown_grace;
    let api_server = axum::serve(
        api_listener,
        api.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(serving.clone()));

    if let Err(err) = api_server.await {
        tracing::error!(error = %err, "api server failed");
    }

    // Drain: stop admitting new outbox work but let the in-flight cycle
    // finish rather than cutting it mid-transaction.
    outbox_shutdown.signal();
    tokio::time::timeout(shutdown_grace, worker_handle).await.ok();
    metrics_handle.abort();

    Ok(())
}

async fn shutdown_signal(serving: ServingGate) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining");
    serving.stop_serving();
}
