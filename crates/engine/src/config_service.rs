//! Business configuration lookup with a bounded in-process cache.
//!
//! Entries expire after a TTL and can be invalidated explicitly when a
//! business updates its policy. Only existing configs are cached, so a
//! business that registers a policy later is picked up on the next lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use courier_common::error::AppError;
use courier_common::types::BusinessConfig;

use crate::repository::BusinessConfigRepository;

pub struct BusinessConfigService {
    repo: Arc<dyn BusinessConfigRepository>,
    cache: Cache<i64, BusinessConfig>,
}

impl BusinessConfigService {
    pub fn new(repo: Arc<dyn BusinessConfigRepository>, capacity: u64, ttl: Duration) -> Self {
        Self {
            repo,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Look up the configs of `biz_ids`, hitting storage once for every id
    /// not already cached. Ids without a config are absent from the result.
    pub async fn get_by_ids(&self, biz_ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>, AppError> {
        let unique: HashSet<i64> = biz_ids.iter().copied().collect();
        let mut found = HashMap::with_capacity(unique.len());
        let mut missing = Vec::new();

        for id in unique {
            match self.cache.get(&id).await {
                Some(config) => {
                    found.insert(id, config);
                }
                None => missing.push(id),
            }
        }

        if !missing.is_empty() {
            let loaded = self.repo.get_by_ids(&missing).await?;
            tracing::debug!(
                requested = missing.len(),
                loaded = loaded.len(),
                "Loaded business configs"
            );
            for (id, config) in loaded {
                self.cache.insert(id, config.clone()).await;
                found.insert(id, config);
            }
        }

        Ok(found)
    }

    pub async fn get_by_id(&self, biz_id: i64) -> Result<Option<BusinessConfig>, AppError> {
        Ok(self.get_by_ids(&[biz_id]).await?.remove(&biz_id))
    }

    /// Drop the cached config of `biz_id`.
    pub async fn invalidate(&self, biz_id: i64) {
        self.cache.invalidate(&biz_id).await;
    }
}
