use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default width, in seconds, of the send window for strategies that only fix a start time.
pub const DEFAULT_SEND_WINDOW_SECS: i64 = 30 * 60;

/// Longest delay a `Delayed` strategy may ask for.
pub const MAX_DELAY_SECS: u64 = 366 * 24 * 60 * 60;

fn default_send_window() -> chrono::Duration {
    chrono::Duration::seconds(DEFAULT_SEND_WINDOW_SECS)
}

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    InApp,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Sms => write!(f, "sms"),
            Channel::Email => write!(f, "email"),
            Channel::InApp => write!(f, "in_app"),
        }
    }
}

/// Delivery status of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Prepare,
    Pending,
    Sending,
    Succeeded,
    Failed,
    Canceled,
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStatus::Prepare => write!(f, "prepare"),
            SendStatus::Pending => write!(f, "pending"),
            SendStatus::Sending => write!(f, "sending"),
            SendStatus::Succeeded => write!(f, "succeeded"),
            SendStatus::Failed => write!(f, "failed"),
            SendStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Status of the transactional envelope around a notification.
///
/// `Prepare` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Prepare,
    Commit,
    Cancel,
    Fail,
}

impl TxStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Prepare)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxStatus::Prepare => write!(f, "prepare"),
            TxStatus::Commit => write!(f, "commit"),
            TxStatus::Cancel => write!(f, "cancel"),
            TxStatus::Fail => write!(f, "fail"),
        }
    }
}

/// How and when a notification should be handed to the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SendStrategy {
    /// Send as soon as the notification becomes PENDING.
    Immediate,
    /// Send after a fixed delay.
    Delayed { delay_seconds: u64 },
    /// Send at a fixed point in time.
    Scheduled { send_at: DateTime<Utc> },
    /// Send at any point inside the window.
    TimeWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Send at any point before the deadline.
    Deadline { deadline: DateTime<Utc> },
}

impl SendStrategy {
    pub fn is_immediate(&self) -> bool {
        matches!(self, SendStrategy::Immediate)
    }

    /// Check the strategy is internally coherent at `now`.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), String> {
        match self {
            SendStrategy::TimeWindow { start, end } if start >= end => {
                Err("time window start must be before its end".to_string())
            }
            SendStrategy::Deadline { deadline } if *deadline <= now => {
                Err("deadline must be in the future".to_string())
            }
            SendStrategy::Delayed { delay_seconds } if *delay_seconds > MAX_DELAY_SECS => Err(
                format!("delay_seconds must not exceed {}", MAX_DELAY_SECS),
            ),
            _ => self.send_window(now).map(|_| ()),
        }
    }

    /// Compute the `(start, end)` send window relative to `now`.
    ///
    /// Fails when the window would fall outside the representable time range.
    pub fn send_window(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), String> {
        let window_from = |start: DateTime<Utc>| {
            start
                .checked_add_signed(default_send_window())
                .map(|end| (start, end))
                .ok_or_else(|| "send window is out of range".to_string())
        };

        match self {
            SendStrategy::Immediate => window_from(now),
            SendStrategy::Delayed { delay_seconds } => {
                let start = i64::try_from(*delay_seconds)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| "delay_seconds is out of range".to_string())?;
                window_from(start)
            }
            SendStrategy::Scheduled { send_at } => window_from(*send_at),
            SendStrategy::TimeWindow { start, end } => Ok((*start, *end)),
            SendStrategy::Deadline { deadline } => Ok((now, *deadline)),
        }
    }
}

/// A message to be delivered through one channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub biz_id: i64,
    pub key: String,
    pub receivers: Vec<String>,
    pub channel: Channel,
    pub template_id: i64,
    pub template_version_id: i64,
    pub template_params: serde_json::Value,
    #[sqlx(json)]
    pub send_strategy: SendStrategy,
    pub status: SendStatus,
    pub scheduled_start_at: DateTime<Utc>,
    pub scheduled_end_at: DateTime<Utc>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The transactional envelope tracking the business transaction behind one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TxNotification {
    pub tx_id: Uuid,
    pub notification_id: Uuid,
    pub biz_id: i64,
    pub key: String,
    pub status: TxStatus,
    /// Number of check-back RPCs issued so far.
    pub check_count: i32,
    /// Epoch milliseconds of the next check-back; 0 means none scheduled.
    pub next_check_at: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TxNotification {
    /// Build a fresh PREPARE envelope for `notification`.
    pub fn prepare(notification: &Notification, next_check_at: i64) -> Self {
        Self {
            tx_id: Uuid::new_v4(),
            notification_id: notification.id,
            biz_id: notification.biz_id,
            key: notification.key.clone(),
            status: TxStatus::Prepare,
            check_count: 0,
            next_check_at,
            created_at: notification.created_at,
            updated_at: notification.updated_at,
        }
    }

    /// Reschedule after an inconclusive check-back, or give up when the
    /// business's retry policy is exhausted.
    pub fn schedule_next_check(&mut self, config: &TxnConfig, now_ms: i64) {
        let next = config
            .retry_policy
            .as_ref()
            .and_then(|policy| policy.next_with_retries(self.check_count.max(0) as u32));

        match next {
            Some(delay) => {
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                self.next_check_at = now_ms.saturating_add(delay_ms);
            }
            None => {
                self.next_check_at = 0;
                self.status = TxStatus::Fail;
            }
        }
    }

    /// Move to a terminal status and clear the deadline.
    pub fn finish(&mut self, status: TxStatus) {
        self.status = status;
        self.next_check_at = 0;
    }
}

/// Backoff policy for repeated check-backs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    Fixed {
        interval_ms: u64,
        max_retries: u32,
    },
    Exponential {
        initial_interval_ms: u64,
        max_interval_ms: u64,
        max_retries: u32,
    },
}

impl RetryPolicy {
    /// Delay before the next attempt, given that `retries` attempts have been made.
    ///
    /// Returns `None` once `retries` exceeds the policy's maximum.
    pub fn next_with_retries(&self, retries: u32) -> Option<Duration> {
        match self {
            RetryPolicy::Fixed {
                interval_ms,
                max_retries,
            } => (retries <= *max_retries).then(|| Duration::from_millis(*interval_ms)),
            RetryPolicy::Exponential {
                initial_interval_ms,
                max_interval_ms,
                max_retries,
            } => {
                if retries > *max_retries {
                    return None;
                }
                let shift = retries.saturating_sub(1).min(32);
                let interval = initial_interval_ms
                    .saturating_mul(1u64 << shift)
                    .min(*max_interval_ms);
                Some(Duration::from_millis(interval))
            }
        }
    }
}

/// Per-business transactional policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Name under which the business's check-back endpoint is registered.
    pub service_name: String,
    /// Seconds between Prepare and the first check-back.
    pub initial_delay: u64,
    pub retry_policy: Option<RetryPolicy>,
}

impl TxnConfig {
    /// Epoch milliseconds of the first check-back for a transaction prepared at `now_ms`.
    pub fn first_check_at(&self, now_ms: i64) -> i64 {
        let delay_ms = i64::try_from(self.initial_delay)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        now_ms.saturating_add(delay_ms)
    }
}

/// Business configuration as far as this platform is concerned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessConfig {
    pub id: i64,
    pub txn_config: Option<TxnConfig>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn_config(retry_policy: Option<RetryPolicy>) -> TxnConfig {
        TxnConfig {
            service_name: "order-service".to_string(),
            initial_delay: 5,
            retry_policy,
        }
    }

    fn prepared_tx() -> TxNotification {
        let now = Utc::now();
        TxNotification {
            tx_id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            biz_id: 1,
            key: "k1".to_string(),
            status: TxStatus::Prepare,
            check_count: 0,
            next_check_at: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_fixed_policy_allows_up_to_max_retries() {
        let policy = RetryPolicy::Fixed {
            interval_ms: 500,
            max_retries: 3,
        };
        assert_eq!(policy.next_with_retries(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_with_retries(3), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_with_retries(4), None);
    }

    #[test]
    fn test_exponential_policy_doubles_and_caps() {
        let policy = RetryPolicy::Exponential {
            initial_interval_ms: 100,
            max_interval_ms: 1000,
            max_retries: 10,
        };
        assert_eq!(policy.next_with_retries(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_with_retries(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_with_retries(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.next_with_retries(5), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_with_retries(11), None);
    }

    #[test]
    fn test_schedule_next_check_reschedules() {
        let mut tx = prepared_tx();
        tx.check_count = 1;
        let config = txn_config(Some(RetryPolicy::Fixed {
            interval_ms: 2000,
            max_retries: 3,
        }));

        tx.schedule_next_check(&config, 10_000);
        assert_eq!(tx.status, TxStatus::Prepare);
        assert_eq!(tx.next_check_at, 12_000);
    }

    #[test]
    fn test_schedule_next_check_gives_up_when_exhausted() {
        let mut tx = prepared_tx();
        tx.check_count = 4;
        let config = txn_config(Some(RetryPolicy::Fixed {
            interval_ms: 2000,
            max_retries: 3,
        }));

        tx.schedule_next_check(&config, 10_000);
        assert_eq!(tx.status, TxStatus::Fail);
        assert_eq!(tx.next_check_at, 0);
    }

    #[test]
    fn test_schedule_next_check_without_policy_fails() {
        let mut tx = prepared_tx();
        tx.check_count = 1;
        tx.schedule_next_check(&txn_config(None), 10_000);
        assert_eq!(tx.status, TxStatus::Fail);
        assert_eq!(tx.next_check_at, 0);
    }

    #[test]
    fn test_send_window_for_strategies() {
        let now = Utc::now();
        assert_eq!(
            SendStrategy::Immediate.send_window(now),
            Ok((now, now + default_send_window()))
        );

        let (start, _) = SendStrategy::Delayed { delay_seconds: 60 }
            .send_window(now)
            .unwrap();
        assert_eq!(start, now + chrono::Duration::seconds(60));

        let deadline = now + chrono::Duration::hours(2);
        assert_eq!(
            SendStrategy::Deadline { deadline }.send_window(now),
            Ok((now, deadline))
        );
    }

    #[test]
    fn test_out_of_range_strategies_are_rejected() {
        let now = Utc::now();

        let huge_delay = SendStrategy::Delayed {
            delay_seconds: 100_000_000_000_000_000,
        };
        assert!(huge_delay.validate(now).is_err());
        assert!(huge_delay.send_window(now).is_err());

        let over_bound = SendStrategy::Delayed {
            delay_seconds: MAX_DELAY_SECS + 1,
        };
        assert!(over_bound.validate(now).is_err());
        assert!(SendStrategy::Delayed { delay_seconds: MAX_DELAY_SECS }
            .validate(now)
            .is_ok());

        let at_the_end_of_time = SendStrategy::Scheduled {
            send_at: DateTime::<Utc>::MAX_UTC,
        };
        assert!(at_the_end_of_time.validate(now).is_err());
        assert!(at_the_end_of_time.send_window(now).is_err());
    }

    #[test]
    fn test_schedule_next_check_saturates_huge_interval() {
        let mut tx = prepared_tx();
        tx.check_count = 1;
        let config = txn_config(Some(RetryPolicy::Fixed {
            interval_ms: u64::MAX,
            max_retries: 3,
        }));

        tx.schedule_next_check(&config, 10_000);
        assert_eq!(tx.status, TxStatus::Prepare);
        assert_eq!(tx.next_check_at, i64::MAX);
    }

    #[test]
    fn test_first_check_at_saturates() {
        let mut config = txn_config(None);
        assert_eq!(config.first_check_at(1_000), 6_000);

        config.initial_delay = u64::MAX;
        assert_eq!(config.first_check_at(1_000), i64::MAX);
    }

    #[test]
    fn test_strategy_validation() {
        let now = Utc::now();
        let inverted = SendStrategy::TimeWindow {
            start: now,
            end: now - chrono::Duration::minutes(1),
        };
        assert!(inverted.validate(now).is_err());

        let past = SendStrategy::Deadline {
            deadline: now - chrono::Duration::seconds(1),
        };
        assert!(past.validate(now).is_err());
        assert!(SendStrategy::Immediate.validate(now).is_ok());
    }

    #[test]
    fn test_strategy_json_shape() {
        let strategy: SendStrategy =
            serde_json::from_value(serde_json::json!({"type": "delayed", "delay_seconds": 30}))
                .unwrap();
        assert_eq!(strategy, SendStrategy::Delayed { delay_seconds: 30 });
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TxStatus::Prepare.is_terminal());
        assert!(TxStatus::Commit.is_terminal());
        assert!(TxStatus::Cancel.is_terminal());
        assert!(TxStatus::Fail.is_terminal());
    }
}
