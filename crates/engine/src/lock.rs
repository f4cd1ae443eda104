//! Distributed lock: time-bounded mutual exclusion keyed by string.
//!
//! Each shard loop holds the lock `"{job}:{shard}"` for the duration of one
//! reconciliation pass, so at most one instance works a shard at any time.
//!
//! The Redis implementation uses `SET key token NX PX ttl` to acquire and a
//! compare-and-delete script to release, so a lease that already expired and
//! was taken over by another instance is never released by its former holder.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::error::AppError;

/// Handle to a held lock; pass it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

impl LockLease {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock for `ttl`.
    ///
    /// Returns `Ok(None)` when another holder owns the key; that is not an error.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, AppError>;

    /// Release a lease previously returned by `try_acquire`.
    async fn release(&self, lease: LockLease) -> Result<(), AppError>;
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed distributed lock.
#[derive(Clone)]
pub struct RedisLock {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            prefix: "courier:lock".to_string(),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, AppError> {
        let lease = LockLease::new(key);
        let mut conn = self.redis.clone();

        // Some("OK") when the key was set, None when someone else holds it
        let result: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| lease))
    }

    async fn release(&self, lease: LockLease) -> Result<(), AppError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.redis_key(&lease.key))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            tracing::warn!(key = %lease.key, "Lock lease had already expired before release");
        }
        Ok(())
    }
}
