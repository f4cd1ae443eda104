//! Rate-limit-triggered failover gate.
//!
//! Every request is counted against a shared limiter. The first request that
//! finds this instance limited flips it into failover and registers it with
//! the failover registry, so peers and upstream routing can shed load away
//! from it. The first request admitted afterwards flips it back and
//! deregisters it. Only the request that wins the flip performs the side
//! effect, however many arrive concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use courier_common::error::AppError;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request against `key`; `true` once the limit is exceeded.
    async fn is_limited(&self, key: &str) -> Result<bool, AppError>;
}

#[async_trait]
pub trait FailoverRegistry: Send + Sync {
    async fn failover(&self, instance: &str) -> Result<(), AppError>;
    async fn recover(&self, instance: &str) -> Result<(), AppError>;
}

pub struct RateLimitFailoverGate {
    limiter: Arc<dyn RateLimiter>,
    registry: Arc<dyn FailoverRegistry>,
    rate_limit_key: String,
    instance_id: String,
    in_failover: AtomicBool,
}

impl RateLimitFailoverGate {
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        registry: Arc<dyn FailoverRegistry>,
        rate_limit_key: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            limiter,
            registry,
            rate_limit_key: rate_limit_key.into(),
            instance_id: instance_id.into(),
            in_failover: AtomicBool::new(false),
        }
    }

    pub fn is_in_failover(&self) -> bool {
        self.in_failover.load(Ordering::SeqCst)
    }

    /// Decide whether one request may proceed.
    ///
    /// Fails closed: a limiter error rejects the request without touching
    /// the failover state. Registry errors are logged and never surface.
    pub async fn admit(&self) -> Result<(), AppError> {
        let limited = match self.limiter.is_limited(&self.rate_limit_key).await {
            Ok(limited) => limited,
            Err(e) => {
                tracing::warn!(
                    key = %self.rate_limit_key,
                    error = %e,
                    "Rate limiter unavailable, rejecting request"
                );
                return Err(AppError::RateLimited(
                    "rate limiter unavailable".to_string(),
                ));
            }
        };

        if limited {
            if self
                .in_failover
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                match self.registry.failover(&self.instance_id).await {
                    Ok(()) => tracing::warn!(
                        instance = %self.instance_id,
                        "Rate limit exceeded, instance entered failover"
                    ),
                    Err(e) => tracing::error!(
                        instance = %self.instance_id,
                        error = %e,
                        "Failed to register failover"
                    ),
                }
            }
            return Err(AppError::RateLimited(format!(
                "instance {} is over its request limit",
                self.instance_id
            )));
        }

        if self
            .in_failover
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            match self.registry.recover(&self.instance_id).await {
                Ok(()) => tracing::info!(
                    instance = %self.instance_id,
                    "Instance recovered from failover"
                ),
                Err(e) => tracing::error!(
                    instance = %self.instance_id,
                    error = %e,
                    "Failed to deregister failover"
                ),
            }
        }

        Ok(())
    }
}

/// Axum middleware running [`RateLimitFailoverGate::admit`] before the handler.
///
/// Install with `axum::middleware::from_fn_with_state(gate, failover_gate)`.
pub async fn failover_gate(
    State(gate): State<Arc<RateLimitFailoverGate>>,
    request: Request,
    next: Next,
) -> Response {
    match gate.admit().await {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
