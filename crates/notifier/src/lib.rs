//! Hands committed notifications to the delivery pipeline.
//!
//! Channel workers consume the Redis list `courier:notifications:pending`
//! and deliver through the vendor adapter of each channel. This crate only
//! produces onto that list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{Channel, Notification};
use courier_engine::sender::NotificationSender;

pub const DEFAULT_QUEUE_KEY: &str = "courier:notifications:pending";

/// Message pushed for every notification that must be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub notification_id: Uuid,
    pub biz_id: i64,
    pub key: String,
    pub channel: Channel,
    pub receivers: Vec<String>,
    pub template_id: i64,
    pub template_version_id: i64,
    pub template_params: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedNotification {
    pub fn from_notification(notification: &Notification, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            notification_id: notification.id,
            biz_id: notification.biz_id,
            key: notification.key.clone(),
            channel: notification.channel,
            receivers: notification.receivers.clone(),
            template_id: notification.template_id,
            template_version_id: notification.template_version_id,
            template_params: notification.template_params.clone(),
            enqueued_at,
        }
    }
}

/// [`NotificationSender`] that pushes onto a Redis list.
#[derive(Clone)]
pub struct RedisQueueSender {
    redis: ConnectionManager,
    queue_key: String,
}

impl RedisQueueSender {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_queue(redis, DEFAULT_QUEUE_KEY)
    }

    pub fn with_queue(redis: ConnectionManager, queue_key: impl Into<String>) -> Self {
        Self {
            redis,
            queue_key: queue_key.into(),
        }
    }
}

#[async_trait]
impl NotificationSender for RedisQueueSender {
    async fn send(&self, notification: &Notification) -> Result<(), AppError> {
        let message = QueuedNotification::from_notification(notification, Utc::now());
        let payload = serde_json::to_string(&message)
            .map_err(|e| AppError::Internal(format!("Failed to encode notification: {}", e)))?;

        let mut conn = self.redis.clone();
        let depth: i64 = conn.lpush(&self.queue_key, payload).await?;

        tracing::debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            queue = %self.queue_key,
            depth,
            "Notification queued for delivery"
        );
        Ok(())
    }
}
