//! Transactional notification service: Prepare, then Commit or Cancel.
//!
//! A business prepares a notification before its own transaction commits,
//! then confirms or withdraws it. Transactions left in PREPARE are resolved
//! later by the check-back reconciler.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    Channel, Notification, SendStatus, SendStrategy, TxNotification, TxStatus,
};

use crate::config_service::BusinessConfigService;
use crate::repository::{NotificationRepository, TxNotificationRepository};
use crate::sender::NotificationSender;

/// Parameters for preparing a transactional notification.
#[derive(Debug, Clone, Deserialize)]
pub struct PrepareParams {
    pub biz_id: i64,
    pub key: String,
    pub receivers: Vec<String>,
    pub channel: Channel,
    pub template_id: i64,
    #[serde(default)]
    pub template_version_id: i64,
    #[serde(default)]
    pub template_params: serde_json::Value,
    pub send_strategy: SendStrategy,
}

pub struct TxNotificationService {
    tx_repo: Arc<dyn TxNotificationRepository>,
    notification_repo: Arc<dyn NotificationRepository>,
    configs: Arc<BusinessConfigService>,
    sender: Arc<dyn NotificationSender>,
}

impl TxNotificationService {
    pub fn new(
        tx_repo: Arc<dyn TxNotificationRepository>,
        notification_repo: Arc<dyn NotificationRepository>,
        configs: Arc<BusinessConfigService>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            tx_repo,
            notification_repo,
            configs,
            sender,
        }
    }

    /// Persist a notification in PREPARE together with its transactional
    /// envelope. Returns the notification id.
    pub async fn prepare(&self, params: PrepareParams) -> Result<Uuid, AppError> {
        let now = Utc::now();
        Self::validate(&params, now)?;

        let (scheduled_start_at, scheduled_end_at) = params
            .send_strategy
            .send_window(now)
            .map_err(AppError::Validation)?;
        let notification = Notification {
            id: Uuid::new_v4(),
            biz_id: params.biz_id,
            key: params.key,
            receivers: params.receivers,
            channel: params.channel,
            template_id: params.template_id,
            template_version_id: params.template_version_id,
            template_params: params.template_params,
            send_strategy: params.send_strategy,
            status: SendStatus::Prepare,
            scheduled_start_at,
            scheduled_end_at,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        // A failed lookup leaves the deadline at 0: the first check-back pass
        // picks the transaction up and resolves it against the config then.
        let next_check_at = match self.configs.get_by_id(notification.biz_id).await {
            Ok(config) => config
                .and_then(|c| c.txn_config)
                .map(|txn| txn.first_check_at(now.timestamp_millis()))
                .unwrap_or(0),
            Err(e) => {
                tracing::warn!(
                    biz_id = notification.biz_id,
                    error = %e,
                    "Business config lookup failed during prepare"
                );
                0
            }
        };

        let tx = TxNotification::prepare(&notification, next_check_at);
        let id = self.tx_repo.create(&notification, &tx).await?;

        tracing::info!(
            notification_id = %id,
            tx_id = %tx.tx_id,
            biz_id = tx.biz_id,
            key = %tx.key,
            next_check_at,
            "Transactional notification prepared"
        );

        Ok(id)
    }

    /// Confirm a prepared notification; it becomes PENDING for delivery and
    /// is sent right away if its strategy is immediate.
    pub async fn commit(&self, biz_id: i64, key: &str) -> Result<(), AppError> {
        self.tx_repo
            .update_status(biz_id, key, TxStatus::Commit, SendStatus::Pending)
            .await?;

        tracing::info!(biz_id, key = %key, "Transactional notification committed");

        let notification = self.notification_repo.get_by_key(biz_id, key).await?;
        if notification.send_strategy.is_immediate() {
            self.sender.send(&notification).await?;
        }

        Ok(())
    }

    /// Withdraw a prepared notification.
    pub async fn cancel(&self, biz_id: i64, key: &str) -> Result<(), AppError> {
        self.tx_repo
            .update_status(biz_id, key, TxStatus::Cancel, SendStatus::Canceled)
            .await?;

        tracing::info!(biz_id, key = %key, "Transactional notification cancelled");
        Ok(())
    }

    pub async fn get(&self, biz_id: i64, key: &str) -> Result<TxNotification, AppError> {
        self.tx_repo.get(biz_id, key).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "Transaction for business {} and key {} not found",
                biz_id, key
            ))
        })
    }

    fn validate(params: &PrepareParams, now: chrono::DateTime<Utc>) -> Result<(), AppError> {
        if params.biz_id <= 0 {
            return Err(AppError::Validation("biz_id must be positive".to_string()));
        }
        if params.key.trim().is_empty() {
            return Err(AppError::Validation("key is required".to_string()));
        }
        if params.receivers.is_empty() || params.receivers.iter().any(|r| r.trim().is_empty()) {
            return Err(AppError::Validation(
                "at least one non-empty receiver is required".to_string(),
            ));
        }
        if params.template_id <= 0 {
            return Err(AppError::Validation("template_id must be positive".to_string()));
        }
        params
            .send_strategy
            .validate(now)
            .map_err(AppError::Validation)
    }
}
