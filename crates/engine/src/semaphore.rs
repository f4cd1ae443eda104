use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use courier_common::error::AppError;

/// Bounded permit pool capping how many reconciliation passes run at once in
/// this process, across every shard loop and job.
#[derive(Debug, Clone)]
pub struct ResourceSemaphore {
    inner: Arc<Semaphore>,
    max_permits: usize,
}

impl ResourceSemaphore {
    pub fn new(max_permits: usize) -> Self {
        let max_permits = max_permits.max(1);
        Self {
            inner: Arc::new(Semaphore::new(max_permits)),
            max_permits,
        }
    }

    /// Wait for a permit. The permit is returned to the pool when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AppError> {
        self.inner
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Internal("resource semaphore closed".to_string()))
    }

    pub fn available_permits(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Stop handing out permits; pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.inner.close();
    }
}
