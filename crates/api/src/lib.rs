//! HTTP ingress of the courier platform.
//!
//! Endpoints:
//! - GET  /health
//! - POST /api/tx/prepare
//! - POST /api/tx/{biz_id}/{key}/commit
//! - POST /api/tx/{biz_id}/{key}/cancel
//! - GET  /api/tx/{biz_id}/{key}
//!
//! The transactional endpoints sit behind the rate-limit failover gate.

pub mod middleware;
pub mod routes;
pub mod state;
