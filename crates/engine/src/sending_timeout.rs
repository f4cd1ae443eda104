//! Reclaims notifications stuck in SENDING.
//!
//! A notification that was handed to a channel but never reported back stays
//! SENDING forever unless something bounds it. Each pass fails a batch of the
//! shard's notifications that have not moved for longer than the timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use courier_common::error::AppError;

use crate::repository::NotificationRepository;
use crate::scheduler::{LoopStep, LoopWork};
use crate::sharding::ShardId;

#[derive(Debug, Clone)]
pub struct SendingTimeoutOptions {
    pub timeout: Duration,
    pub batch_size: u32,
    /// Sleep after a pass that did not fill a whole batch.
    pub idle_interval: Duration,
}

impl Default for SendingTimeoutOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            batch_size: 10,
            idle_interval: Duration::from_secs(10),
        }
    }
}

pub struct SendingTimeoutReconciler {
    repo: Arc<dyn NotificationRepository>,
    options: SendingTimeoutOptions,
}

impl SendingTimeoutReconciler {
    pub fn new(repo: Arc<dyn NotificationRepository>) -> Self {
        Self {
            repo,
            options: SendingTimeoutOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SendingTimeoutOptions) -> Self {
        self.options = options;
        self
    }

    /// Fail one batch of timed-out notifications; returns how many changed.
    pub async fn run_pass(&self, shard: ShardId) -> Result<u64, AppError> {
        let timeout = chrono::Duration::from_std(self.options.timeout)
            .map_err(|e| AppError::Config(format!("Invalid sending timeout: {}", e)))?;
        let older_than = Utc::now() - timeout;

        let affected = self
            .repo
            .mark_timeout_sending_as_failed(shard, older_than, self.options.batch_size)
            .await?;

        if affected > 0 {
            tracing::info!(
                shard = %shard,
                affected,
                "Failed notifications stuck in SENDING"
            );
        }
        Ok(affected)
    }
}

#[async_trait]
impl LoopWork for SendingTimeoutReconciler {
    async fn run_once(
        &self,
        shard: ShardId,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<LoopStep> {
        let affected = self.run_pass(shard).await?;
        if affected < self.options.batch_size as u64 {
            Ok(LoopStep::Idle(self.options.idle_interval))
        } else {
            Ok(LoopStep::Busy)
        }
    }
}
