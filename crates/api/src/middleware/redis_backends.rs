//! Redis implementations of the failover gate's collaborators.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use courier_common::error::AppError;

use super::failover::{FailoverRegistry, RateLimiter};

pub const FAILOVER_SET_KEY: &str = "courier:failover:instances";

/// Fixed-window counter shared by every instance using the same key.
#[derive(Clone)]
pub struct RedisRateLimiter {
    redis: ConnectionManager,
    max_requests: u64,
    window: Duration,
}

impl RedisRateLimiter {
    pub fn new(redis: ConnectionManager, max_requests: u64, window: Duration) -> Self {
        Self {
            redis,
            max_requests,
            window,
        }
    }
}

/// Counter key of the window containing `now_ms`.
pub(crate) fn window_key(key: &str, now_ms: i64, window_ms: i64) -> String {
    format!("ratelimit:{}:{}", key, now_ms / window_ms.max(1))
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn is_limited(&self, key: &str) -> Result<bool, AppError> {
        let window_ms = self.window.as_millis().max(1) as i64;
        let counter = window_key(key, Utc::now().timestamp_millis(), window_ms);
        let mut conn = self.redis.clone();

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&counter, 1)
            .pexpire(&counter, window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count > self.max_requests)
    }
}

/// Tracks instances in failover as members of one Redis set.
#[derive(Clone)]
pub struct RedisFailoverRegistry {
    redis: ConnectionManager,
}

impl RedisFailoverRegistry {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl FailoverRegistry for RedisFailoverRegistry {
    async fn failover(&self, instance: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.sadd(FAILOVER_SET_KEY, instance).await?;
        Ok(())
    }

    async fn recover(&self, instance: &str) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.srem(FAILOVER_SET_KEY, instance).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_key_buckets_by_window() {
        assert_eq!(window_key("api", 1_500, 1_000), "ratelimit:api:1");
        assert_eq!(window_key("api", 1_999, 1_000), "ratelimit:api:1");
        assert_eq!(window_key("api", 2_000, 1_000), "ratelimit:api:2");
        assert_eq!(window_key("api", 42, 0), "ratelimit:api:42");
    }
}
