use async_trait::async_trait;

use courier_common::error::AppError;
use courier_common::types::Notification;

/// Entry point of the delivery pipeline for notifications that must go out now.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), AppError>;
}
