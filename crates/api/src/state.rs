//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_common::config::AppConfig;
use courier_engine::tx_notification::TxNotificationService;

use crate::middleware::failover::RateLimitFailoverGate;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub tx_service: Arc<TxNotificationService>,
    pub gate: Arc<RateLimitFailoverGate>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(
        tx_service: Arc<TxNotificationService>,
        gate: Arc<RateLimitFailoverGate>,
        config: AppConfig,
    ) -> Self {
        Self {
            tx_service,
            gate,
            config,
        }
    }
}
