use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Address the API server binds to (default: 0.0.0.0:3000)
    pub api_listen_addr: String,

    /// Identity of this process in the failover registry
    pub instance_id: String,

    /// Position of this instance among its peers, used for shard ownership
    pub instance_index: u32,

    /// Number of instances sharing the reconciliation workload
    pub instance_count: u32,

    /// Total number of reconciliation shards
    pub total_shards: u32,

    /// Process-wide cap on concurrently running reconciliation passes
    pub max_concurrent_passes: usize,

    /// Transactions fetched per check-back pass
    pub check_back_batch_size: u32,

    /// Concurrent check-back RPCs per pass
    pub check_back_concurrency: usize,

    /// Per-call check-back timeout in milliseconds
    pub check_back_timeout_ms: u64,

    /// Seconds a notification may stay SENDING before it is failed
    pub sending_timeout_secs: u64,

    /// Number of business configs held in memory
    pub config_cache_capacity: u64,

    /// Seconds a cached business config stays valid
    pub config_cache_ttl_secs: u64,

    /// Logical key the request-path rate limiter counts against
    pub rate_limit_key: String,

    /// Requests admitted per window before the instance is considered limited
    pub rate_limit_max_requests: u64,

    /// Rate limiter window in milliseconds
    pub rate_limit_window_ms: u64,

    /// Check-back endpoints by service name (`CHECK_BACK_SERVICES=orders=http://orders:8080,...`)
    pub check_back_services: HashMap<String, String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let instance_id = std::env::var("INSTANCE_ID").unwrap_or_else(|_| {
            std::env::var("HOSTNAME").unwrap_or_else(|_| "courier-local".to_string())
        });

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            api_listen_addr: std::env::var("API_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            rate_limit_key: std::env::var("RATE_LIMIT_KEY")
                .unwrap_or_else(|_| format!("courier-api:{}", instance_id)),
            instance_id,
            instance_index: parse_var("INSTANCE_INDEX", 0)?,
            instance_count: parse_var("INSTANCE_COUNT", 1)?,
            total_shards: parse_var("TOTAL_SHARDS", 4)?,
            max_concurrent_passes: parse_var("MAX_CONCURRENT_PASSES", 4)?,
            check_back_batch_size: parse_var("CHECK_BACK_BATCH_SIZE", 10)?,
            check_back_concurrency: parse_var("CHECK_BACK_CONCURRENCY", 10)?,
            check_back_timeout_ms: parse_var("CHECK_BACK_TIMEOUT_MS", 3000)?,
            sending_timeout_secs: parse_var("SENDING_TIMEOUT_SECS", 60)?,
            config_cache_capacity: parse_var("CONFIG_CACHE_CAPACITY", 10_000)?,
            config_cache_ttl_secs: parse_var("CONFIG_CACHE_TTL_SECS", 600)?,
            rate_limit_max_requests: parse_var("RATE_LIMIT_MAX_REQUESTS", 1000)?,
            rate_limit_window_ms: parse_var("RATE_LIMIT_WINDOW_MS", 1000)?,
            check_back_services: parse_services(
                &std::env::var("CHECK_BACK_SERVICES").unwrap_or_default(),
            )?,
        };

        if config.instance_count == 0 || config.instance_index >= config.instance_count {
            anyhow::bail!(
                "INSTANCE_INDEX ({}) must be lower than INSTANCE_COUNT ({})",
                config.instance_index,
                config.instance_count
            );
        }
        if config.total_shards == 0 {
            anyhow::bail!("TOTAL_SHARDS must be at least 1");
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `name=url` pairs separated by commas.
pub fn parse_services(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut services = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("CHECK_BACK_SERVICES entry '{}' is not name=url", entry))?;
        services.insert(name.trim().to_string(), url.trim().to_string());
    }
    Ok(services)
}
