//! Runs the reconciliation jobs of one worker process.
//!
//! Both jobs share one [`ResourceSemaphore`], so `max_concurrent_passes`
//! bounds the passes of the whole process, not of each job.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_engine::check_back::{CheckBackOptions, CheckBackReconciler};
use courier_engine::lock::DistributedLock;
use courier_engine::scheduler::{SchedulerOptions, ShardedLoopScheduler};
use courier_engine::semaphore::ResourceSemaphore;
use courier_engine::sending_timeout::{SendingTimeoutOptions, SendingTimeoutReconciler};
use courier_engine::sharding::{ShardingStrategy, StaticSharding};

pub const CHECK_BACK_LOCK_KEY: &str = "check_back";
pub const SENDING_TIMEOUT_LOCK_KEY: &str = "sending_timeout";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub instance_index: u32,
    pub instance_count: u32,
    pub total_shards: u32,
    pub max_concurrent_passes: usize,
    pub scheduler: SchedulerOptions,
    pub check_back: CheckBackOptions,
    pub sending_timeout: SendingTimeoutOptions,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let check_back = CheckBackOptions {
            batch_size: config.check_back_batch_size,
            max_concurrency: config.check_back_concurrency,
            rpc_timeout: Duration::from_millis(config.check_back_timeout_ms),
            ..CheckBackOptions::default()
        };
        let scheduler = SchedulerOptions {
            // a lease must outlive the longest pass it guards
            lock_ttl: SchedulerOptions::default()
                .lock_ttl
                .max(check_back.pass_timeout * 2),
            ..SchedulerOptions::default()
        };

        Self {
            instance_index: config.instance_index,
            instance_count: config.instance_count,
            total_shards: config.total_shards,
            max_concurrent_passes: config.max_concurrent_passes,
            scheduler,
            check_back,
            sending_timeout: SendingTimeoutOptions {
                timeout: Duration::from_secs(config.sending_timeout_secs),
                ..SendingTimeoutOptions::default()
            },
        }
    }
}

pub struct Worker {
    settings: WorkerSettings,
    lock: Arc<dyn DistributedLock>,
    semaphore: ResourceSemaphore,
    check_back: Arc<CheckBackReconciler>,
    sending_timeout: Arc<SendingTimeoutReconciler>,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        lock: Arc<dyn DistributedLock>,
        check_back: CheckBackReconciler,
        sending_timeout: SendingTimeoutReconciler,
    ) -> Self {
        let semaphore = ResourceSemaphore::new(settings.max_concurrent_passes);
        let check_back = check_back.with_options(settings.check_back.clone());
        let sending_timeout = sending_timeout.with_options(settings.sending_timeout.clone());
        Self {
            settings,
            lock,
            semaphore,
            check_back: Arc::new(check_back),
            sending_timeout: Arc::new(sending_timeout),
        }
    }

    fn scheduler(&self, lock_key: &str) -> ShardedLoopScheduler {
        let sharding: Arc<dyn ShardingStrategy> = Arc::new(StaticSharding::new(
            self.settings.instance_index,
            self.settings.instance_count,
            self.settings.total_shards,
        ));
        ShardedLoopScheduler::new(self.lock.clone(), lock_key, sharding, self.semaphore.clone())
            .with_options(self.settings.scheduler.clone())
    }

    /// Run both jobs until `cancel` fires and every loop has wound down.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            instance_index = self.settings.instance_index,
            instance_count = self.settings.instance_count,
            total_shards = self.settings.total_shards,
            max_concurrent_passes = self.settings.max_concurrent_passes,
            "Worker starting reconciliation jobs"
        );

        let check_back = self.scheduler(CHECK_BACK_LOCK_KEY);
        let sending_timeout = self.scheduler(SENDING_TIMEOUT_LOCK_KEY);

        tokio::join!(
            check_back.run(self.check_back.clone(), cancel.clone()),
            sending_timeout.run(self.sending_timeout.clone(), cancel.clone()),
        );

        tracing::info!("Worker reconciliation jobs stopped");
    }
}
