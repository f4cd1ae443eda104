//! Persistence seams used by the transactional core.
//!
//! Postgres implementations live in [`crate::postgres`]; in-memory ones for
//! tests live in [`crate::testing`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{BusinessConfig, Notification, SendStatus, TxNotification, TxStatus};

use crate::sharding::ShardId;

#[async_trait]
pub trait TxNotificationRepository: Send + Sync {
    /// Persist a notification and its transactional envelope atomically.
    ///
    /// Fails with `AppError::Conflict` if `(biz_id, key)` already exists.
    async fn create(
        &self,
        notification: &Notification,
        tx: &TxNotification,
    ) -> Result<Uuid, AppError>;

    async fn get(&self, biz_id: i64, key: &str) -> Result<Option<TxNotification>, AppError>;

    /// PREPARE transactions of `shard` whose check-back is due at `now_ms`,
    /// oldest first.
    async fn find_check_back(
        &self,
        shard: ShardId,
        now_ms: i64,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<TxNotification>, AppError>;

    /// Move the transaction `(biz_id, key)` out of PREPARE together with its
    /// notification. Fails with `AppError::NotFound` if no PREPARE row matches.
    async fn update_status(
        &self,
        biz_id: i64,
        key: &str,
        status: TxStatus,
        notification_status: SendStatus,
    ) -> Result<(), AppError>;

    /// Write back check-back results for a batch of transactions and set their
    /// notifications to `notification_status`, all or nothing.
    ///
    /// Rows no longer in PREPARE are left untouched.
    async fn update_check_status(
        &self,
        txns: &[TxNotification],
        notification_status: SendStatus,
    ) -> Result<(), AppError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<Notification, AppError>;

    /// Fail up to `limit` notifications of `shard` stuck in SENDING since
    /// before `older_than`. Returns the number of rows changed.
    async fn mark_timeout_sending_as_failed(
        &self,
        shard: ShardId,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, AppError>;
}

#[async_trait]
pub trait BusinessConfigRepository: Send + Sync {
    /// Load the configs that exist among `ids` in one round trip.
    async fn get_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>, AppError>;
}
