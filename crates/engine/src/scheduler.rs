//! Sharded loop scheduler.
//!
//! Runs one long-lived loop per owned shard. Every iteration:
//! 1. takes the distributed lock `"{lock_key}:{shard}"` (busy means another
//!    instance works the shard right now; wait and retry)
//! 2. takes a permit from the process-wide [`ResourceSemaphore`]
//! 3. runs the unit of work once, inside a panic boundary
//! 4. releases permit and lock, then paces itself on the [`LoopStep`]
//!
//! Cancellation is observed between steps. Nothing new is acquired once the
//! token fires, and a pass already running is allowed to finish.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::lock::{DistributedLock, LockLease};
use crate::semaphore::ResourceSemaphore;
use crate::sharding::{ShardId, ShardingStrategy};

/// What a unit of work asks the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStep {
    /// Work was found; run again immediately.
    Busy,
    /// Nothing (or little) to do; sleep before the next attempt.
    Idle(Duration),
}

/// A unit of work driven by the scheduler, once per iteration per shard.
#[async_trait]
pub trait LoopWork: Send + Sync + 'static {
    async fn run_once(&self, shard: ShardId, cancel: &CancellationToken)
    -> anyhow::Result<LoopStep>;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Lease length of the shard lock. Must exceed the longest pass.
    pub lock_ttl: Duration,
    /// Wait before retrying when the shard lock is held elsewhere.
    pub lock_retry_interval: Duration,
    /// Wait after a failed or panicked pass.
    pub error_backoff: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_retry_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

pub struct ShardedLoopScheduler {
    lock: Arc<dyn DistributedLock>,
    lock_key: String,
    sharding: Arc<dyn ShardingStrategy>,
    semaphore: ResourceSemaphore,
    options: SchedulerOptions,
}

impl ShardedLoopScheduler {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        lock_key: impl Into<String>,
        sharding: Arc<dyn ShardingStrategy>,
        semaphore: ResourceSemaphore,
    ) -> Self {
        Self {
            lock,
            lock_key: lock_key.into(),
            sharding,
            semaphore,
            options: SchedulerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Run `work` on every owned shard until `cancel` fires.
    ///
    /// Resolves once every shard loop has exited and released what it held.
    pub async fn run<W: LoopWork>(&self, work: Arc<W>, cancel: CancellationToken) {
        let shards = self.sharding.owned_shards();
        if shards.is_empty() {
            tracing::info!(lock_key = %self.lock_key, "No shards owned, scheduler idle");
            return;
        }

        tracing::info!(
            lock_key = %self.lock_key,
            shards = shards.len(),
            "Starting sharded loops"
        );

        let mut loops = JoinSet::new();
        for shard in shards {
            let shard_loop = ShardLoop {
                lock: self.lock.clone(),
                lock_key: format!("{}:{}", self.lock_key, shard),
                shard,
                semaphore: self.semaphore.clone(),
                options: self.options.clone(),
                work: work.clone(),
                cancel: cancel.clone(),
            };
            loops.spawn(shard_loop.run());
        }

        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(lock_key = %self.lock_key, error = %e, "Shard loop task failed");
            }
        }

        tracing::info!(lock_key = %self.lock_key, "All shard loops stopped");
    }
}

struct ShardLoop<W> {
    lock: Arc<dyn DistributedLock>,
    lock_key: String,
    shard: ShardId,
    semaphore: ResourceSemaphore,
    options: SchedulerOptions,
    work: Arc<W>,
    cancel: CancellationToken,
}

impl<W: LoopWork> ShardLoop<W> {
    async fn run(self) {
        tracing::debug!(lock_key = %self.lock_key, "Shard loop started");

        while !self.cancel.is_cancelled() {
            if let Some(pause) = self.iterate().await
                && !self.pause(pause).await
            {
                break;
            }
        }

        tracing::debug!(lock_key = %self.lock_key, "Shard loop stopped");
    }

    /// One lock → permit → work → release cycle. Returns how long to wait
    /// before the next cycle, `None` to continue right away.
    async fn iterate(&self) -> Option<Duration> {
        let lease = match self
            .lock
            .try_acquire(&self.lock_key, self.options.lock_ttl)
            .await
        {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                tracing::trace!(lock_key = %self.lock_key, "Shard held by another instance");
                return Some(self.options.lock_retry_interval);
            }
            Err(e) => {
                tracing::warn!(lock_key = %self.lock_key, error = %e, "Failed to acquire shard lock");
                return Some(self.options.lock_retry_interval);
            }
        };

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.semaphore.acquire() => Some(permit),
        };

        let permit = match permit {
            Some(Ok(permit)) => permit,
            Some(Err(e)) => {
                tracing::warn!(lock_key = %self.lock_key, error = %e, "Failed to acquire pass permit");
                self.release(lease).await;
                return Some(self.options.error_backoff);
            }
            None => {
                self.release(lease).await;
                return None;
            }
        };

        let outcome = AssertUnwindSafe(self.work.run_once(self.shard, &self.cancel))
            .catch_unwind()
            .await;

        drop(permit);
        self.release(lease).await;

        match outcome {
            Ok(Ok(LoopStep::Busy)) => None,
            Ok(Ok(LoopStep::Idle(pause))) => Some(pause),
            Ok(Err(e)) => {
                tracing::warn!(lock_key = %self.lock_key, error = %e, "Reconciliation pass failed");
                Some(self.options.error_backoff)
            }
            Err(panic) => {
                tracing::error!(
                    lock_key = %self.lock_key,
                    panic = %panic_message(panic.as_ref()),
                    "Reconciliation pass panicked"
                );
                Some(self.options.error_backoff)
            }
        }
    }

    async fn release(&self, lease: LockLease) {
        if let Err(e) = self.lock.release(lease).await {
            // the lease still expires on its own after lock_ttl
            tracing::warn!(lock_key = %self.lock_key, error = %e, "Failed to release shard lock");
        }
    }

    /// Sleep for `pause`; returns `false` if cancelled meanwhile.
    async fn pause(&self, pause: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(pause) => true,
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
