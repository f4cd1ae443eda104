//! Check-back reconciliation.
//!
//! Transactions still in PREPARE once their deadline passes are resolved by
//! asking the owning business. One pass works a single shard:
//!
//! 1. fetch a batch of due transactions, oldest first
//! 2. load the business configs of the batch in one lookup
//! 3. check back every transaction concurrently, bounded by `max_concurrency`
//! 4. write the results back in at most three bulk updates, one per outcome
//!    group, collecting every group's error
//!
//! A business without a transactional policy cannot be asked, so its
//! transactions fail without an RPC. Inconclusive answers (unknown, errors,
//! timeouts, panics) reschedule the transaction until its retry policy runs
//! out, at which point it fails.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use courier_common::error::AppError;
use courier_common::types::{BusinessConfig, SendStatus, TxNotification, TxStatus, TxnConfig};

use crate::check_back_client::{CheckBackClient, CheckBackStatus};
use crate::config_service::BusinessConfigService;
use crate::repository::TxNotificationRepository;
use crate::scheduler::{LoopStep, LoopWork, panic_message};
use crate::sharding::ShardId;

#[derive(Debug, Clone)]
pub struct CheckBackOptions {
    pub batch_size: u32,
    pub max_concurrency: usize,
    /// Bound on a single check-back RPC.
    pub rpc_timeout: Duration,
    /// Bound on a whole pass, fetch to write-back.
    pub pass_timeout: Duration,
    /// Sleep after a pass that found nothing due.
    pub idle_interval: Duration,
}

impl Default for CheckBackOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrency: 10,
            rpc_timeout: Duration::from_secs(3),
            pass_timeout: Duration::from_secs(10),
            idle_interval: Duration::from_secs(1),
        }
    }
}

/// Counts of what one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub fetched: usize,
    pub committed: usize,
    pub cancelled: usize,
    pub failed: usize,
    pub rescheduled: usize,
}

pub struct CheckBackReconciler {
    tx_repo: Arc<dyn TxNotificationRepository>,
    configs: Arc<BusinessConfigService>,
    client: Arc<dyn CheckBackClient>,
    options: CheckBackOptions,
}

impl CheckBackReconciler {
    pub fn new(
        tx_repo: Arc<dyn TxNotificationRepository>,
        configs: Arc<BusinessConfigService>,
        client: Arc<dyn CheckBackClient>,
    ) -> Self {
        Self {
            tx_repo,
            configs,
            client,
            options: CheckBackOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CheckBackOptions) -> Self {
        self.options = options;
        self
    }

    /// Run one reconciliation pass over `shard`.
    pub async fn run_pass(&self, shard: ShardId) -> Result<PassReport, AppError> {
        let now_ms = Utc::now().timestamp_millis();
        let txns = self
            .tx_repo
            .find_check_back(shard, now_ms, 0, self.options.batch_size)
            .await?;

        if txns.is_empty() {
            return Ok(PassReport::default());
        }

        let fetched = txns.len();
        let biz_ids: Vec<i64> = txns.iter().map(|t| t.biz_id).collect();
        let configs = self.configs.get_by_ids(&biz_ids).await?;

        let resolved = self.check_back_all(txns, &configs).await;
        self.write_back(shard, fetched, resolved).await
    }

    async fn check_back_all(
        &self,
        txns: Vec<TxNotification>,
        configs: &HashMap<i64, BusinessConfig>,
    ) -> Vec<TxNotification> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut resolved = Vec::with_capacity(txns.len());

        for tx in txns {
            let Some(txn_config) = configs.get(&tx.biz_id).and_then(|c| c.txn_config.clone())
            else {
                tracing::info!(
                    tx_id = %tx.tx_id,
                    biz_id = tx.biz_id,
                    "No transactional policy for business, failing transaction"
                );
                let mut tx = tx;
                tx.finish(TxStatus::Fail);
                resolved.push(tx);
                continue;
            };

            let client = self.client.clone();
            let permits = permits.clone();
            let rpc_timeout = self.options.rpc_timeout;
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                check_back_one(client.as_ref(), tx, &txn_config, rpc_timeout).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(tx) => resolved.push(tx),
                Err(e) => tracing::error!(error = %e, "Check-back task aborted"),
            }
        }

        resolved
    }

    async fn write_back(
        &self,
        shard: ShardId,
        fetched: usize,
        resolved: Vec<TxNotification>,
    ) -> Result<PassReport, AppError> {
        let mut report = PassReport {
            fetched,
            ..PassReport::default()
        };

        let mut retry = Vec::new();
        let mut fail = Vec::new();
        let mut commit = Vec::new();
        for tx in resolved {
            match tx.status {
                TxStatus::Prepare => {
                    report.rescheduled += 1;
                    retry.push(tx);
                }
                TxStatus::Commit => {
                    report.committed += 1;
                    commit.push(tx);
                }
                TxStatus::Cancel => {
                    report.cancelled += 1;
                    fail.push(tx);
                }
                TxStatus::Fail => {
                    report.failed += 1;
                    fail.push(tx);
                }
            }
        }

        let mut errors = Vec::new();
        for (group, status) in [
            (retry, SendStatus::Prepare),
            (fail, SendStatus::Failed),
            (commit, SendStatus::Pending),
        ] {
            if group.is_empty() {
                continue;
            }
            if let Err(e) = self.tx_repo.update_check_status(&group, status).await {
                tracing::error!(
                    shard = %shard,
                    notification_status = %status,
                    rows = group.len(),
                    error = %e,
                    "Failed to write back check-back results"
                );
                errors.push(e);
            }
        }

        if let Some(err) = AppError::aggregate(errors) {
            return Err(err);
        }

        tracing::debug!(
            shard = %shard,
            fetched = report.fetched,
            committed = report.committed,
            cancelled = report.cancelled,
            failed = report.failed,
            rescheduled = report.rescheduled,
            "Check-back pass complete"
        );
        Ok(report)
    }
}

/// Ask the business about `tx` and fold the answer into its next state.
async fn check_back_one(
    client: &dyn CheckBackClient,
    mut tx: TxNotification,
    config: &TxnConfig,
    rpc_timeout: Duration,
) -> TxNotification {
    let call = AssertUnwindSafe(tokio::time::timeout(
        rpc_timeout,
        client.check(&config.service_name, &tx.key),
    ))
    .catch_unwind()
    .await;

    tx.check_count += 1;

    let outcome = match call {
        Ok(Ok(Ok(status))) => Ok(status),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(_)) => Err(format!("timed out after {:?}", rpc_timeout)),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    };

    match outcome {
        Ok(CheckBackStatus::Committed) => tx.finish(TxStatus::Commit),
        Ok(CheckBackStatus::Cancelled) => tx.finish(TxStatus::Cancel),
        Ok(CheckBackStatus::Unknown) => {
            tx.schedule_next_check(config, Utc::now().timestamp_millis());
        }
        Err(reason) => {
            tracing::warn!(
                tx_id = %tx.tx_id,
                service = %config.service_name,
                attempt = tx.check_count,
                reason = %reason,
                "Check-back failed"
            );
            tx.schedule_next_check(config, Utc::now().timestamp_millis());
        }
    }

    if tx.status == TxStatus::Fail {
        tracing::info!(
            tx_id = %tx.tx_id,
            attempts = tx.check_count,
            "Check-back retries exhausted, failing transaction"
        );
    }

    tx
}

#[async_trait]
impl LoopWork for CheckBackReconciler {
    async fn run_once(
        &self,
        shard: ShardId,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<LoopStep> {
        let report = tokio::time::timeout(self.options.pass_timeout, self.run_pass(shard))
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "Check-back pass on shard {} exceeded {:?}",
                    shard, self.options.pass_timeout
                ))
            })??;

        if report.fetched == 0 {
            Ok(LoopStep::Idle(self.options.idle_interval))
        } else {
            Ok(LoopStep::Busy)
        }
    }
}
