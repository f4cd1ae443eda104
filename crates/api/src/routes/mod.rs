pub mod health;
pub mod tx;

use axum::Router;
use axum::middleware::from_fn_with_state;

use crate::middleware::failover::failover_gate;
use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    let gated = tx::router().route_layer(from_fn_with_state(state.gate.clone(), failover_gate));

    Router::new()
        .merge(health::router())
        .merge(gated)
        .with_state(state)
}
