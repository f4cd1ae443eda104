pub mod failover;
pub mod redis_backends;
