//! PostgreSQL-backed repositories.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use courier_common::error::AppError;
use courier_common::types::{
    BusinessConfig, Notification, SendStatus, TxNotification, TxStatus, TxnConfig,
};

use crate::repository::{BusinessConfigRepository, NotificationRepository, TxNotificationRepository};
use crate::sharding::ShardId;

const TX_COLUMNS: &str =
    "tx_id, notification_id, biz_id, key, status, check_count, next_check_at, created_at, updated_at";

/// Repository implementations over a shared connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_unique(e: sqlx::Error, biz_id: i64, key: &str) -> AppError {
    let err = AppError::from(e);
    if err.is_unique_violation() {
        AppError::Conflict(format!("Notification ({}, {}) already exists", biz_id, key))
    } else {
        err
    }
}

#[async_trait]
impl TxNotificationRepository for PgStore {
    async fn create(
        &self,
        notification: &Notification,
        tx: &TxNotification,
    ) -> Result<Uuid, AppError> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, biz_id, key, receivers, channel, template_id, template_version_id,
                template_params, send_strategy, status, scheduled_start_at, scheduled_end_at,
                version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(notification.id)
        .bind(notification.biz_id)
        .bind(&notification.key)
        .bind(&notification.receivers)
        .bind(notification.channel.to_string())
        .bind(notification.template_id)
        .bind(notification.template_version_id)
        .bind(&notification.template_params)
        .bind(Json(&notification.send_strategy))
        .bind(notification.status.to_string())
        .bind(notification.scheduled_start_at)
        .bind(notification.scheduled_end_at)
        .bind(notification.version)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| map_unique(e, notification.biz_id, &notification.key))?;

        sqlx::query(
            r#"
            INSERT INTO tx_notifications (
                tx_id, notification_id, biz_id, key, status, check_count, next_check_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(tx.tx_id)
        .bind(tx.notification_id)
        .bind(tx.biz_id)
        .bind(&tx.key)
        .bind(tx.status.to_string())
        .bind(tx.check_count)
        .bind(tx.next_check_at)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await
        .map_err(|e| map_unique(e, tx.biz_id, &tx.key))?;

        db_tx.commit().await?;
        Ok(notification.id)
    }

    async fn get(&self, biz_id: i64, key: &str) -> Result<Option<TxNotification>, AppError> {
        let tx: Option<TxNotification> = sqlx::query_as(&format!(
            "SELECT {} FROM tx_notifications WHERE biz_id = $1 AND key = $2",
            TX_COLUMNS
        ))
        .bind(biz_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(tx)
    }

    async fn find_check_back(
        &self,
        shard: ShardId,
        now_ms: i64,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<TxNotification>, AppError> {
        let txns: Vec<TxNotification> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM tx_notifications
            WHERE status = $1
              AND next_check_at <= $2
              AND MOD(biz_id, $3) = $4
            ORDER BY created_at ASC, tx_id ASC
            LIMIT $5 OFFSET $6
            "#,
            TX_COLUMNS
        ))
        .bind(TxStatus::Prepare.to_string())
        .bind(now_ms)
        .bind(shard.modulus())
        .bind(shard.index as i64)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(txns)
    }

    async fn update_status(
        &self,
        biz_id: i64,
        key: &str,
        status: TxStatus,
        notification_status: SendStatus,
    ) -> Result<(), AppError> {
        let mut db_tx = self.pool.begin().await?;

        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE tx_notifications
            SET status = $1, next_check_at = 0, updated_at = NOW()
            WHERE biz_id = $2 AND key = $3 AND status = $4
            RETURNING notification_id
            "#,
        )
        .bind(status.to_string())
        .bind(biz_id)
        .bind(key)
        .bind(TxStatus::Prepare.to_string())
        .fetch_optional(&mut *db_tx)
        .await?;

        let Some((notification_id,)) = row else {
            return Err(AppError::NotFound(format!(
                "No prepared transaction for business {} and key {}",
                biz_id, key
            )));
        };

        sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, version = version + 1, updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(notification_status.to_string())
        .bind(notification_id)
        .bind(SendStatus::Prepare.to_string())
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn update_check_status(
        &self,
        txns: &[TxNotification],
        notification_status: SendStatus,
    ) -> Result<(), AppError> {
        if txns.is_empty() {
            return Ok(());
        }

        let tx_ids: Vec<Uuid> = txns.iter().map(|t| t.tx_id).collect();
        let statuses: Vec<String> = txns.iter().map(|t| t.status.to_string()).collect();
        let check_counts: Vec<i32> = txns.iter().map(|t| t.check_count).collect();
        let next_checks: Vec<i64> = txns.iter().map(|t| t.next_check_at).collect();

        let mut db_tx = self.pool.begin().await?;

        let updated: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE tx_notifications AS t
            SET status = u.status,
                check_count = u.check_count,
                next_check_at = u.next_check_at,
                updated_at = NOW()
            FROM UNNEST($1::uuid[], $2::text[], $3::int4[], $4::int8[])
                AS u(tx_id, status, check_count, next_check_at)
            WHERE t.tx_id = u.tx_id AND t.status = $5
            RETURNING t.notification_id
            "#,
        )
        .bind(&tx_ids)
        .bind(&statuses)
        .bind(&check_counts)
        .bind(&next_checks)
        .bind(TxStatus::Prepare.to_string())
        .fetch_all(&mut *db_tx)
        .await?;

        if notification_status != SendStatus::Prepare && !updated.is_empty() {
            let notification_ids: Vec<Uuid> = updated.into_iter().map(|(id,)| id).collect();
            sqlx::query(
                r#"
                UPDATE notifications
                SET status = $1, version = version + 1, updated_at = NOW()
                WHERE id = ANY($2) AND status = $3
                "#,
            )
            .bind(notification_status.to_string())
            .bind(&notification_ids)
            .bind(SendStatus::Prepare.to_string())
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn get_by_key(&self, biz_id: i64, key: &str) -> Result<Notification, AppError> {
        let notification: Notification =
            sqlx::query_as("SELECT * FROM notifications WHERE biz_id = $1 AND key = $2")
                .bind(biz_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "Notification for business {} and key {} not found",
                        biz_id, key
                    ))
                })?;

        Ok(notification)
    }

    async fn mark_timeout_sending_as_failed(
        &self,
        shard: ShardId,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = $1, version = version + 1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM notifications
                WHERE status = $2
                  AND updated_at < $3
                  AND MOD(biz_id, $4) = $5
                ORDER BY updated_at ASC
                LIMIT $6
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(SendStatus::Failed.to_string())
        .bind(SendStatus::Sending.to_string())
        .bind(older_than)
        .bind(shard.modulus())
        .bind(shard.index as i64)
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl BusinessConfigRepository for PgStore {
    async fn get_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, BusinessConfig>, AppError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(i64, Option<Json<TxnConfig>>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, txn_config, updated_at FROM business_configs WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, txn_config, updated_at)| {
                (
                    id,
                    BusinessConfig {
                        id,
                        txn_config: txn_config.map(|Json(c)| c),
                        updated_at,
                    },
                )
            })
            .collect())
    }
}
