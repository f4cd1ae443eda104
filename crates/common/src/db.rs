use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::types::RetryPolicy;

/// Create a PostgreSQL connection pool.
///
/// `max_connections` controls the maximum number of connections in the pool.
/// Pass `AppConfig::db_max_connections` for the user-configured value (default 20).
pub async fn create_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Connected to PostgreSQL");
    Ok(pool)
}

/// Connect to PostgreSQL, backing off exponentially while the database comes up.
pub async fn connect_with_retry(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let policy = RetryPolicy::Exponential {
        initial_interval_ms: 1_000,
        max_interval_ms: 10_000,
        max_retries: 10,
    };

    let mut attempts = 0u32;
    loop {
        match create_pool(database_url, max_connections).await {
            Ok(pool) => return Ok(pool),
            Err(e) => {
                attempts += 1;
                let Some(delay) = policy.next_with_retries(attempts) else {
                    return Err(e.context(format!("database unreachable after {} attempts", attempts)));
                };
                tracing::warn!(
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "PostgreSQL not ready, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Apply the schema migrations shipped with the workspace.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}
