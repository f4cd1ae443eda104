//! Transactional notification routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use courier_common::error::AppError;
use courier_common::types::TxNotification;
use courier_engine::tx_notification::PrepareParams;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/tx/prepare", post(prepare))
        .route("/api/tx/{biz_id}/{key}", get(get_tx))
        .route("/api/tx/{biz_id}/{key}/commit", post(commit))
        .route("/api/tx/{biz_id}/{key}/cancel", post(cancel))
}

/// POST /api/tx/prepare: Record a notification pending the caller's transaction.
async fn prepare(
    State(state): State<AppState>,
    Json(params): Json<PrepareParams>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let notification_id = state.tx_service.prepare(params).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "notification_id": notification_id })),
    ))
}

/// POST /api/tx/:biz_id/:key/commit: Release the notification for delivery.
async fn commit(
    State(state): State<AppState>,
    Path((biz_id, key)): Path<(i64, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.tx_service.commit(biz_id, &key).await?;
    Ok(Json(json!({ "status": "commit" })))
}

/// POST /api/tx/:biz_id/:key/cancel: Withdraw the notification.
async fn cancel(
    State(state): State<AppState>,
    Path((biz_id, key)): Path<(i64, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.tx_service.cancel(biz_id, &key).await?;
    Ok(Json(json!({ "status": "cancel" })))
}

/// GET /api/tx/:biz_id/:key: Current state of a transaction.
async fn get_tx(
    State(state): State<AppState>,
    Path((biz_id, key)): Path<(i64, String)>,
) -> Result<Json<TxNotification>, AppError> {
    Ok(Json(state.tx_service.get(biz_id, &key).await?))
}
