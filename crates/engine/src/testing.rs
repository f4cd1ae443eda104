//! In-memory collaborators for tests and local experiments.
//!
//! Each type mirrors the observable contract of its production counterpart
//! (guarded transitions, shard filtering, lease expiry) and records enough
//! about its usage for assertions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BusinessConfig, Channel, DEFAULT_SEND_WINDOW_SECS, Notification, SendStatus, SendStrategy,
    TxNotification, TxStatus, TxnConfig,
};

use crate::check_back_client::{CheckBackClient, CheckBackStatus};
use crate::lock::{DistributedLock, LockLease};
use crate::repository::{BusinessConfigRepository, NotificationRepository, TxNotificationRepository};
use crate::sender::NotificationSender;
use crate::sharding::ShardId;

// ---------------------------------------------------------------------------
// Lock
// ---------------------------------------------------------------------------

/// Process-local [`DistributedLock`] with lease expiry.
#[derive(Default)]
pub struct MemoryLock {
    leases: Mutex<HashMap<String, (String, Instant)>>,
    attempts: AtomicUsize,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases currently held and not yet expired.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.leases
            .lock()
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    /// Number of `try_acquire` calls, successful or not.
    pub fn acquire_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .lock()
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, AppError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some((_, expires)) = leases.get(key)
            && *expires > now
        {
            return Ok(None);
        }

        let lease = LockLease::new(key);
        leases.insert(key.to_string(), (lease.token.clone(), now + ttl));
        Ok(Some(lease))
    }

    async fn release(&self, lease: LockLease) -> Result<(), AppError> {
        let mut leases = self.leases.lock();
        if leases
            .get(&lease.key)
            .is_some_and(|(token, _)| *token == lease.token)
        {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// Build a PREPARE notification with an immediate strategy.
pub fn sample_notification(biz_id: i64, key: &str) -> Notification {
    let now = Utc::now();
    let strategy = SendStrategy::Immediate;
    let scheduled_start_at = now;
    let scheduled_end_at = now + chrono::Duration::seconds(DEFAULT_SEND_WINDOW_SECS);
    Notification {
        id: Uuid::new_v4(),
        biz_id,
        key: key.to_string(),
        receivers: vec!["user@example.com".to_string()],
        channel: Channel::Email,
        template_id: 1,
        template_version_id: 1,
        template_params: serde_json::json!({}),
        send_strategy: strategy,
        status: SendStatus::Prepare,
        scheduled_start_at,
        scheduled_end_at,
        version: 0,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Default)]
struct StoreState {
    notifications: HashMap<Uuid, Notification>,
    txns: HashMap<(i64, String), TxNotification>,
    configs: HashMap<i64, BusinessConfig>,
}

/// Implements every repository trait over shared in-memory tables.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    config_lookups: AtomicUsize,
    update_check_calls: AtomicUsize,
    failing_updates: Mutex<HashSet<SendStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_config(&self, biz_id: i64, txn_config: Option<TxnConfig>) {
        self.state.lock().configs.insert(
            biz_id,
            BusinessConfig {
                id: biz_id,
                txn_config,
                updated_at: Utc::now(),
            },
        );
    }

    /// Insert a PREPARE notification and transaction due at `next_check_at`.
    pub fn seed_prepared(&self, biz_id: i64, key: &str, next_check_at: i64) -> TxNotification {
        let notification = sample_notification(biz_id, key);
        let tx = TxNotification::prepare(&notification, next_check_at);
        let mut state = self.state.lock();
        state.notifications.insert(notification.id, notification);
        state.txns.insert((biz_id, key.to_string()), tx.clone());
        tx
    }

    /// Insert a bare notification in `status`, last touched at `updated_at`.
    pub fn seed_notification(
        &self,
        biz_id: i64,
        key: &str,
        status: SendStatus,
        updated_at: DateTime<Utc>,
    ) -> Uuid {
        let mut notification = sample_notification(biz_id, key);
        notification.status = status;
        notification.updated_at = updated_at;
        let id = notification.id;
        self.state.lock().notifications.insert(id, notification);
        id
    }

    pub fn tx(&self, biz_id: i64, key: &str) -> Option<TxNotification> {
        self.state.lock().txns.get(&(biz_id, key.to_string())).cloned()
    }

    pub fn tx_count(&self) -> usize {
        self.state.lock().txns.len()
    }

    pub fn notification(&self, id: Uuid) -> Option<Notification> {
        self.state.lock().notifications.get(&id).cloned()
    }

    /// Number of `BusinessConfigRepository::get_by_ids` calls.
    pub fn config_lookups(&self) -> usize {
        self.config_lookups.load(Ordering::SeqCst)
    }

    /// Number of `update_check_status` calls.
    pub fn update_check_calls(&self) -> usize {
        self.update_check_calls.load(Ordering::SeqCst)
    }

    /// Make `update_check_status` fail for the group targeting `status`.
    pub fn fail_updates_for(&self, status: SendStatus) {
        self.failing_updates.lock().insert(status);
    }
}

#[async_trait]
impl TxNotificationRepository for MemoryStore {
    async fn create(
        &self,
        notification: &Notification,
        tx: &TxNotification,
    ) -> Result<Uuid, AppError> {
        let mut state = self.state.lock();
        let key = (tx.biz_id, tx.key.clone());
        if state.txns.contains_key(&key) {
            return Err(AppError::Conflict(format!(
                "Notification ({}, {}) already exists",
                tx.biz_id, tx.key
            )));
        }
        state.notifications.insert(notification.id, notification.clone());
        state.txns.insert(key, tx.clone());
        Ok(notification.id)
    }

    async fn get(&self, biz_id: i64, key: &str) -> Result<Option<TxNotification>, AppError> {
        Ok(self.tx(biz_id, key))
    }

    async fn find_check_back(
        &self,
        shard: ShardId,
        now_ms: i64,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<TxNotification>, AppError> {
        let state = self.state.lock();
        let mut due: Vec<TxNotification> = state
            .txns
            .values()
            .filter(|t| {
                t.status == TxStatus::Prepare && t.next_check_at <= now_ms && shard.contains(t.biz_id)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| (a.created_at, a.tx_id).cmp(&(b.created_at, b.tx_id)));

        Ok(due
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn update_status(
        &self,
        biz_id: i64,
        key: &str,
        status: TxStatus,
        notification_status: SendStatus,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let notification_id = match state.txns.get_mut(&(biz_id, key.to_string())) {
            Some(tx) if tx.status == TxStatus::Prepare => {
                tx.finish(status);
                tx.updated_at = now;
                tx.notification_id
            }
            _ => {
                return Err(AppError::NotFound(format!(
                    "No prepared transaction for business {} and key {}",
                    biz_id, key
                )));
            }
        };

        if let Some(n) = state.notifications.get_mut(&notification_id)
            && n.status == SendStatus::Prepare
        {
            n.status = notification_status;
            n.version += 1;
            n.updated_at = now;
        }
        Ok(())
    }

    async fn update_check_status(
        &self,
        txns: &[TxNotification],
        notification_status: SendStatus,
    ) -> Result<(), AppError> {
        self.update_check_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_updates.lock().contains(&notification_status) {
            return Err(AppError::Internal(format!(
                "injected failure updating {} group",
                notification_status
            )));
        }

        let mut state = self.state.lock();
        let now = Utc::now();
        let mut touched = Vec::new();

        for update in txns {
            if let Some(tx) = state.txns.get_mut(&(update.biz_id, update.key.clone()))
                && tx.status == TxStatus::Prepare
            {
                tx.status = update.status;
                tx.check_count = update.check_count;
                tx.next_check_at = update.next_check_at;
                tx.updated_at = now;
                touched.push(tx.notification_id);
            }
        }

        if notification_status != SendStatus::Prepare {
            for id in touched {
                if let Some(n) = state.notifications.get_mut(&id)
                    && n.status == SendStatus::Prepare
                {
                    n.status = notification_status;
                    n.version += 1;
                    n.updated_at = now;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<Notification, AppError> {
        self.state
            .lock()
            .notifications
            .values()
            .find(|n| n.biz_id == biz_id && n.key == key)
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Notification for business {} and key {} not found",
                    biz_id, key
                ))
            })
    }

    async fn mark_timeout_sending_as_failed(
        &self,
        shard: ShardId,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, AppError> {
        let mut state = self.state.lock();
        let mut stuck: Vec<(DateTime<Utc>, Uuid)> = state
            .notifications
            .values()
            .filter(|n| {
                n.status == SendStatus::Sending && n.updated_at < older_than && shard.contains(n.biz_id)
            })
            .map(|n| (n.updated_at, n.id))
            .collect();
        stuck.sort();
        stuck.truncate(limit as usize);

        let now = Utc::now();
        for (_, id) in &stuck {
            if let Some(n) = state.notifications.get_mut(id) {
                n.status = SendStatus::Failed;
                n.version += 1;
                n.updated_at = now;
            }
        }
        Ok(stuck.len() as u64)
    }
}

#[async_trait]
impl BusinessConfigRepository for MemoryStore {
    async fn get_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>, AppError> {
        self.config_lookups.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.configs.get(id).map(|c| (*id, c.clone())))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Check-back client
// ---------------------------------------------------------------------------

/// One scripted reaction of [`ScriptedCheckBackClient`].
#[derive(Debug, Clone)]
pub enum CheckBackReply {
    Status(CheckBackStatus),
    Error,
    Panic,
    /// Never answers; exercises call timeouts.
    Hang,
}

/// Answers check-backs from per-key queues, falling back to a default reply.
pub struct ScriptedCheckBackClient {
    replies: Mutex<HashMap<String, VecDeque<CheckBackReply>>>,
    default: Mutex<CheckBackReply>,
    calls: Mutex<Vec<String>>,
}

impl Default for ScriptedCheckBackClient {
    fn default() -> Self {
        Self::new(CheckBackReply::Status(CheckBackStatus::Unknown))
    }
}

impl ScriptedCheckBackClient {
    pub fn new(default: CheckBackReply) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            default: Mutex::new(default),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, key: &str, reply: CheckBackReply) {
        self.replies
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_default(&self, reply: CheckBackReply) {
        *self.default.lock() = reply;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl CheckBackClient for ScriptedCheckBackClient {
    async fn check(&self, service_name: &str, key: &str) -> Result<CheckBackStatus, AppError> {
        self.calls.lock().push(key.to_string());
        let reply = self
            .replies
            .lock()
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| self.default.lock().clone());

        match reply {
            CheckBackReply::Status(status) => Ok(status),
            CheckBackReply::Error => Err(AppError::Rpc(format!(
                "scripted failure from '{}'",
                service_name
            ))),
            CheckBackReply::Panic => panic!("scripted panic checking back '{}'", key),
            CheckBackReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(CheckBackStatus::Unknown)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sender
// ---------------------------------------------------------------------------

/// Records the ids of sent notifications.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Uuid>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Uuid> {
        self.sent.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, notification: &Notification) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Internal("delivery pipeline unavailable".to_string()));
        }
        self.sent.lock().push(notification.id);
        Ok(())
    }
}
