//! Courier worker binary: runs the check-back and sending-timeout reconcilers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_common::db;
use courier_common::redis_pool::create_redis_pool;
use courier_engine::check_back::CheckBackReconciler;
use courier_engine::check_back_client::{HttpCheckBackClient, StaticDirectory};
use courier_engine::config_service::BusinessConfigService;
use courier_engine::lock::RedisLock;
use courier_engine::postgres::PgStore;
use courier_engine::sending_timeout::SendingTimeoutReconciler;
use courier_worker::runtime::{Worker, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_worker=info,courier_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database and Redis
    let pool = db::connect_with_retry(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    let redis = create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(PgStore::new(pool));
    let configs = Arc::new(BusinessConfigService::new(
        store.clone(),
        config.config_cache_capacity,
        Duration::from_secs(config.config_cache_ttl_secs),
    ));
    let directory = Arc::new(StaticDirectory::new(config.check_back_services.clone()));
    let client = Arc::new(HttpCheckBackClient::new(
        directory,
        Duration::from_millis(config.check_back_timeout_ms),
    )?);

    let worker = Worker::new(
        WorkerSettings::from_config(&config),
        Arc::new(RedisLock::new(redis)),
        CheckBackReconciler::new(store.clone(), configs, client),
        SendingTimeoutReconciler::new(store),
    );

    // Run with graceful shutdown on Ctrl+C
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal, stopping gracefully..."),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    worker.run(cancel).await;

    tracing::info!("Courier worker stopped.");
    Ok(())
}
