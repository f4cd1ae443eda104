//! Courier API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::{connect_with_retry, run_migrations};
use courier_common::redis_pool::create_redis_pool;
use courier_engine::config_service::BusinessConfigService;
use courier_engine::postgres::PgStore;
use courier_engine::tx_notification::TxNotificationService;
use courier_notifier::RedisQueueSender;

use courier_api::middleware::failover::RateLimitFailoverGate;
use courier_api::middleware::redis_backends::{RedisFailoverRegistry, RedisRateLimiter};
use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting courier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = connect_with_retry(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    // Create Redis connection
    let redis = create_redis_pool(&config.redis_url).await?;

    // Wire the transactional service
    let store = Arc::new(PgStore::new(pool));
    let configs = Arc::new(BusinessConfigService::new(
        store.clone(),
        config.config_cache_capacity,
        Duration::from_secs(config.config_cache_ttl_secs),
    ));
    let sender = Arc::new(RedisQueueSender::new(redis.clone()));
    let tx_service = Arc::new(TxNotificationService::new(
        store.clone(),
        store,
        configs,
        sender,
    ));

    // Wire the failover gate
    let gate = Arc::new(RateLimitFailoverGate::new(
        Arc::new(RedisRateLimiter::new(
            redis.clone(),
            config.rate_limit_max_requests,
            Duration::from_millis(config.rate_limit_window_ms),
        )),
        Arc::new(RedisFailoverRegistry::new(redis)),
        config.rate_limit_key.clone(),
        config.instance_id.clone(),
    ));

    let addr: SocketAddr = config.api_listen_addr.parse().map_err(|e| {
        anyhow::anyhow!("Invalid API_LISTEN_ADDR '{}': {}", config.api_listen_addr, e)
    })?;

    // Build application state and router
    let state = AppState::new(tx_service, gate, config);
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
