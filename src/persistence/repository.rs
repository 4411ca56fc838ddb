//! Database Repository
//!
//! SQLite implementation of the store traits. Counter updates, task claims and
//! lease-checked completions are single statements so concurrent workers never
//! interleave a read and a write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, error, warn};

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::account::ExchangeAccount;
use crate::domain::entities::delivery::WebhookDelivery;
use crate::domain::entities::order::Order;
use crate::domain::entities::task::{Lane, TaskRecord, TaskStatus};
use crate::domain::entities::webhook::{Webhook, WebhookStatus};
use crate::domain::repositories::store::{
    AccountRepository, CancelOutcome, DeliveryRepository, OrderRepository, StoreResult,
    TaskCount, TaskStore, WebhookRepository,
};

fn query_error(what: &str, e: sqlx::Error) -> DatabaseError {
    error!("Failed to {}: {}", what, e);
    DatabaseError::QueryError(format!("Failed to {}: {}", what, e))
}

fn to_json(value: &serde_json::Value) -> String {
    value.to_string()
}

/// Store backed by a SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl WebhookRepository for SqliteStore {
    async fn create_webhook(&self, webhook: &Webhook) -> StoreResult<Webhook> {
        let record = sqlx::query_as::<_, WebhookRecord>(
            r#"
            INSERT INTO webhooks (
                user_id, name, url_path, secret, status,
                default_margin, default_leverage, default_stop_loss_pct, default_take_profit_pct,
                exchange, environment, error_threshold, auto_pause_on_errors,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
            RETURNING *
            "#,
        )
        .bind(webhook.user_id)
        .bind(&webhook.name)
        .bind(&webhook.url_path)
        .bind(&webhook.secret)
        .bind(webhook.status.as_str())
        .bind(webhook.default_margin)
        .bind(webhook.default_leverage.map(i64::from))
        .bind(webhook.default_stop_loss_pct)
        .bind(webhook.default_take_profit_pct)
        .bind(webhook.exchange.map(|e| e.name()))
        .bind(webhook.environment.map(|e| e.as_str()))
        .bind(webhook.error_threshold)
        .bind(webhook.auto_pause_on_errors)
        .bind(webhook.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("create webhook", e))?;

        debug!("Created webhook: {} at /{}", record.id, record.url_path);
        record.try_into()
    }

    async fn get_webhook(&self, id: i64) -> StoreResult<Option<Webhook>> {
        sqlx::query_as::<_, WebhookRecord>("SELECT * FROM webhooks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get webhook", e))?
            .map(Webhook::try_from)
            .transpose()
    }

    async fn get_webhook_by_path(&self, url_path: &str) -> StoreResult<Option<Webhook>> {
        sqlx::query_as::<_, WebhookRecord>("SELECT * FROM webhooks WHERE url_path = ?1")
            .bind(url_path)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get webhook by path", e))?
            .map(Webhook::try_from)
            .transpose()
    }

    async fn record_webhook_received(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE webhooks
            SET total_deliveries = total_deliveries + 1, last_delivery_at = ?1, updated_at = ?1
            WHERE id = ?2
            "#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("record webhook delivery", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("webhook {}", id)));
        }
        Ok(())
    }

    async fn record_webhook_outcome(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<Webhook> {
        let sql = if success {
            r#"
            UPDATE webhooks
            SET successful_deliveries = successful_deliveries + 1,
                consecutive_errors = 0,
                last_success_at = ?1,
                updated_at = ?1
            WHERE id = ?2
            RETURNING *
            "#
        } else {
            // SET expressions see the pre-update row
            r#"
            UPDATE webhooks
            SET failed_deliveries = failed_deliveries + 1,
                consecutive_errors = consecutive_errors + 1,
                status = CASE
                    WHEN auto_pause_on_errors AND status = 'active'
                         AND consecutive_errors + 1 >= error_threshold
                    THEN 'paused'
                    ELSE status
                END,
                updated_at = ?1
            WHERE id = ?2
            RETURNING *
            "#
        };

        let record = sqlx::query_as::<_, WebhookRecord>(sql)
            .bind(at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("record webhook outcome", e))?
            .ok_or_else(|| DatabaseError::NotFound(format!("webhook {}", id)))?;

        if record.status == WebhookStatus::Paused.as_str() && !success {
            warn!(
                webhook_id = id,
                consecutive_errors = record.consecutive_errors,
                "Webhook paused after consecutive errors"
            );
        }
        record.try_into()
    }

    async fn set_webhook_status(&self, id: i64, status: WebhookStatus) -> StoreResult<()> {
        let reset_errors = status == WebhookStatus::Active;
        let rows = sqlx::query(
            r#"
            UPDATE webhooks
            SET status = ?1,
                consecutive_errors = CASE WHEN ?2 THEN 0 ELSE consecutive_errors END,
                updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(reset_errors)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("set webhook status", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("webhook {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryRepository for SqliteStore {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<WebhookDelivery> {
        let record = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            INSERT INTO webhook_deliveries (
                webhook_id, alert_id, payload, headers, hmac_valid, payload_valid, status,
                retry_count, next_retry_at, error_message, error_details, task_id,
                created_at, processed_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            RETURNING *
            "#,
        )
        .bind(delivery.webhook_id)
        .bind(&delivery.alert_id)
        .bind(&delivery.payload)
        .bind(to_json(&delivery.headers))
        .bind(delivery.hmac_valid)
        .bind(delivery.payload_valid)
        .bind(delivery.status.as_str())
        .bind(delivery.retry_count)
        .bind(delivery.next_retry_at)
        .bind(&delivery.error_message)
        .bind(delivery.error_details.as_ref().map(to_json))
        .bind(&delivery.task_id)
        .bind(delivery.created_at)
        .bind(delivery.processed_at)
        .bind(delivery.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("create delivery", e))?;

        debug!(
            "Created delivery {} for webhook {}",
            record.id, record.webhook_id
        );
        record.try_into()
    }

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<WebhookDelivery>> {
        sqlx::query_as::<_, DeliveryRecord>("SELECT * FROM webhook_deliveries WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get delivery", e))?
            .map(WebhookDelivery::try_from)
            .transpose()
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET hmac_valid = ?1, payload_valid = ?2, status = ?3, retry_count = ?4,
                next_retry_at = ?5, orders_created = ?6, orders_executed = ?7,
                orders_failed = ?8, processing_duration_ms = ?9, error_message = ?10,
                error_details = ?11, task_id = ?12, processed_at = ?13, updated_at = ?14
            WHERE id = ?15
            "#,
        )
        .bind(delivery.hmac_valid)
        .bind(delivery.payload_valid)
        .bind(delivery.status.as_str())
        .bind(delivery.retry_count)
        .bind(delivery.next_retry_at)
        .bind(delivery.orders_created)
        .bind(delivery.orders_executed)
        .bind(delivery.orders_failed)
        .bind(delivery.processing_duration_ms)
        .bind(&delivery.error_message)
        .bind(delivery.error_details.as_ref().map(to_json))
        .bind(&delivery.task_id)
        .bind(delivery.processed_at)
        .bind(delivery.updated_at)
        .bind(delivery.id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update delivery", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("delivery {}", delivery.id)));
        }
        Ok(())
    }

    async fn find_recent_delivery(
        &self,
        webhook_id: i64,
        alert_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookDelivery>> {
        sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE webhook_id = ?1 AND alert_id = ?2 AND created_at >= ?3
              AND hmac_valid = 1 AND payload_valid = 1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(webhook_id)
        .bind(alert_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("find recent delivery", e))?
        .map(WebhookDelivery::try_from)
        .transpose()
    }

    async fn purge_deliveries_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        // Orders keep their history; only the delivery link is dropped
        sqlx::query(
            r#"
            UPDATE orders SET webhook_delivery_id = NULL
            WHERE webhook_delivery_id IN (
                SELECT id FROM webhook_deliveries
                WHERE created_at < ?1 AND status IN ('success', 'failed')
            )
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("detach orders from purged deliveries", e))?;

        let rows = sqlx::query(
            "DELETE FROM webhook_deliveries WHERE created_at < ?1 AND status IN ('success', 'failed')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("purge deliveries", e))?
        .rows_affected();

        Ok(rows)
    }
}

#[async_trait]
impl OrderRepository for SqliteStore {
    async fn create_order(&self, order: &Order) -> StoreResult<Order> {
        let record = sqlx::query_as::<_, OrderRecord>(
            r#"
            INSERT INTO orders (
                user_id, account_id, webhook_delivery_id, client_order_id, exchange_order_id,
                exchange, symbol, side, order_type, role, quantity, price, stop_price,
                reduce_only, filled_quantity, filled_notional, average_fill_price, status,
                retry_count, failure_reason, exchange_error_code,
                created_at, submitted_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)
            RETURNING *
            "#,
        )
        .bind(order.user_id)
        .bind(order.account_id)
        .bind(order.webhook_delivery_id)
        .bind(&order.client_order_id)
        .bind(&order.exchange_order_id)
        .bind(order.exchange.name())
        .bind(&order.symbol)
        .bind(order.side.as_str())
        .bind(order.order_type.as_str())
        .bind(order.role.as_str())
        .bind(order.quantity)
        .bind(order.price)
        .bind(order.stop_price)
        .bind(order.reduce_only)
        .bind(order.filled_quantity)
        .bind(order.filled_notional)
        .bind(order.average_fill_price)
        .bind(order.status.as_str())
        .bind(order.retry_count)
        .bind(&order.failure_reason)
        .bind(&order.exchange_error_code)
        .bind(order.created_at)
        .bind(order.submitted_at)
        .bind(order.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("create order", e))?;

        debug!(
            "Created order {} ({}) for {}",
            record.id, record.client_order_id, record.symbol
        );
        record.try_into()
    }

    async fn get_order(&self, id: i64) -> StoreResult<Option<Order>> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get order", e))?
            .map(Order::try_from)
            .transpose()
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> StoreResult<Option<Order>> {
        sqlx::query_as::<_, OrderRecord>("SELECT * FROM orders WHERE client_order_id = ?1")
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get order by client id", e))?
            .map(Order::try_from)
            .transpose()
    }

    async fn update_order(&self, order: &Order) -> StoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET exchange_order_id = ?1, quantity = ?2, price = ?3, stop_price = ?4,
                filled_quantity = ?5, filled_notional = ?6, average_fill_price = ?7,
                status = ?8, retry_count = ?9, failure_reason = ?10,
                exchange_error_code = ?11, submitted_at = ?12, updated_at = ?13
            WHERE id = ?14
            "#,
        )
        .bind(&order.exchange_order_id)
        .bind(order.quantity)
        .bind(order.price)
        .bind(order.stop_price)
        .bind(order.filled_quantity)
        .bind(order.filled_notional)
        .bind(order.average_fill_price)
        .bind(order.status.as_str())
        .bind(order.retry_count)
        .bind(&order.failure_reason)
        .bind(&order.exchange_error_code)
        .bind(order.submitted_at)
        .bind(order.updated_at)
        .bind(order.id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update order", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("order {}", order.id)));
        }
        Ok(())
    }

    async fn orders_for_delivery(&self, delivery_id: i64) -> StoreResult<Vec<Order>> {
        sqlx::query_as::<_, OrderRecord>(
            "SELECT * FROM orders WHERE webhook_delivery_id = ?1 ORDER BY id",
        )
        .bind(delivery_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list orders for delivery", e))?
        .into_iter()
        .map(Order::try_from)
        .collect()
    }
}

#[async_trait]
impl AccountRepository for SqliteStore {
    async fn create_account(&self, account: &ExchangeAccount) -> StoreResult<ExchangeAccount> {
        let record = sqlx::query_as::<_, AccountRecord>(
            r#"
            INSERT INTO exchange_accounts (
                user_id, name, exchange, environment, api_key_encrypted,
                api_secret_encrypted, passphrase_encrypted, is_active, is_default,
                health_status, available_balance, open_exposure, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            RETURNING *
            "#,
        )
        .bind(account.user_id)
        .bind(&account.name)
        .bind(account.exchange.name())
        .bind(account.environment.as_str())
        .bind(&account.api_key_encrypted)
        .bind(&account.api_secret_encrypted)
        .bind(&account.passphrase_encrypted)
        .bind(account.is_active)
        .bind(account.is_default)
        .bind(account.health_status.as_str())
        .bind(account.available_balance)
        .bind(account.open_exposure)
        .bind(account.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("create account", e))?;

        record.try_into()
    }

    async fn get_account(&self, id: i64) -> StoreResult<Option<ExchangeAccount>> {
        sqlx::query_as::<_, AccountRecord>("SELECT * FROM exchange_accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get account", e))?
            .map(ExchangeAccount::try_from)
            .transpose()
    }

    async fn list_accounts_for_user(&self, user_id: i64) -> StoreResult<Vec<ExchangeAccount>> {
        sqlx::query_as::<_, AccountRecord>(
            "SELECT * FROM exchange_accounts WHERE user_id = ?1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list accounts", e))?
        .into_iter()
        .map(ExchangeAccount::try_from)
        .collect()
    }

    async fn list_active_accounts(&self) -> StoreResult<Vec<ExchangeAccount>> {
        sqlx::query_as::<_, AccountRecord>(
            "SELECT * FROM exchange_accounts WHERE is_active = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("list active accounts", e))?
        .into_iter()
        .map(ExchangeAccount::try_from)
        .collect()
    }

    async fn update_account(&self, account: &ExchangeAccount) -> StoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE exchange_accounts
            SET name = ?1, is_active = ?2, is_default = ?3, health_status = ?4,
                last_health_check_at = ?5, last_healthy_at = ?6, last_error = ?7,
                available_balance = ?8, open_exposure = ?9, total_orders = ?10,
                successful_orders = ?11, failed_orders = ?12, last_used_at = ?13,
                updated_at = ?14
            WHERE id = ?15
            "#,
        )
        .bind(&account.name)
        .bind(account.is_active)
        .bind(account.is_default)
        .bind(account.health_status.as_str())
        .bind(account.last_health_check_at)
        .bind(account.last_healthy_at)
        .bind(&account.last_error)
        .bind(account.available_balance)
        .bind(account.open_exposure)
        .bind(account.total_orders)
        .bind(account.successful_orders)
        .bind(account.failed_orders)
        .bind(account.last_used_at)
        .bind(account.updated_at)
        .bind(account.id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update account", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("account {}", account.id)));
        }
        Ok(())
    }
}

fn kind_json(task: &TaskRecord) -> StoreResult<String> {
    serde_json::to_string(&task.kind).map_err(|e| DatabaseError::QueryError(e.to_string()))
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &TaskRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, lane, kind, priority, status, attempts, max_attempts, next_run_at,
                cancel_requested, last_error, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&task.id)
        .bind(task.lane.as_str())
        .bind(kind_json(task)?)
        .bind(task.priority)
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_attempts))
        .bind(task.next_run_at)
        .bind(task.cancel_requested)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("insert task", e))?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("get task", e))?
            .map(TaskRecord::try_from)
            .transpose()
    }

    async fn claim_next_task(
        &self,
        lane: Lane,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>> {
        let token = uuid::Uuid::new_v4().to_string();
        sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'running', attempts = attempts + 1, lease_owner = ?1,
                lease_token = ?2, lease_expires_at = ?3, started_at = ?4, updated_at = ?4
            WHERE id = (
                SELECT id FROM tasks
                WHERE lane = ?5 AND status IN ('pending', 'retrying') AND next_run_at <= ?4
                ORDER BY priority DESC, next_run_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(&token)
        .bind(lease_until)
        .bind(now)
        .bind(lane.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("claim task", e))?
        .map(TaskRecord::try_from)
        .transpose()
    }

    async fn update_task_if_leased(
        &self,
        task: &TaskRecord,
        lease_token: &str,
    ) -> StoreResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, attempts = ?2, priority = ?3, next_run_at = ?4,
                lease_owner = ?5, lease_token = ?6, lease_expires_at = ?7,
                cancel_requested = (cancel_requested OR ?8), last_error = ?9,
                updated_at = ?10, started_at = ?11, finished_at = ?12
            WHERE id = ?13 AND status = 'running' AND lease_token = ?14
            "#,
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(task.priority)
        .bind(task.next_run_at)
        .bind(&task.lease_owner)
        .bind(&task.lease_token)
        .bind(task.lease_expires_at)
        .bind(task.cancel_requested)
        .bind(&task.last_error)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.finished_at)
        .bind(&task.id)
        .bind(lease_token)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("complete task", e))?
        .rows_affected();

        Ok(rows == 1)
    }

    async fn update_task(&self, task: &TaskRecord) -> StoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1, attempts = ?2, max_attempts = ?3, priority = ?4,
                next_run_at = ?5, lease_owner = ?6, lease_token = ?7,
                lease_expires_at = ?8, cancel_requested = ?9, last_error = ?10,
                updated_at = ?11, started_at = ?12, finished_at = ?13
            WHERE id = ?14
            "#,
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_attempts))
        .bind(task.priority)
        .bind(task.next_run_at)
        .bind(&task.lease_owner)
        .bind(&task.lease_token)
        .bind(task.lease_expires_at)
        .bind(task.cancel_requested)
        .bind(&task.last_error)
        .bind(task.updated_at)
        .bind(task.started_at)
        .bind(task.finished_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("update task", e))?
        .rows_affected();

        if rows == 0 {
            return Err(DatabaseError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    async fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> StoreResult<CancelOutcome> {
        let cancelled = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failure', cancel_requested = 1, last_error = 'cancelled',
                finished_at = ?1, updated_at = ?1
            WHERE id = ?2 AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("cancel task", e))?
        .rows_affected();
        if cancelled == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        let flagged = sqlx::query(
            "UPDATE tasks SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("flag task for cancellation", e))?
        .rows_affected();
        if flagged == 1 {
            return Ok(CancelOutcome::Flagged);
        }

        let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| query_error("look up task", e))?
            .is_some();
        Ok(if exists {
            CancelOutcome::AlreadyFinished
        } else {
            CancelOutcome::NotFound
        })
    }

    async fn purge_lane(&self, lane: Lane) -> StoreResult<u64> {
        let rows = sqlx::query(
            "DELETE FROM tasks WHERE lane = ?1 AND status IN ('pending', 'retrying')",
        )
        .bind(lane.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("purge lane", e))?
        .rows_affected();
        Ok(rows)
    }

    async fn purge_finished_tasks(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let rows = sqlx::query(
            "DELETE FROM tasks WHERE status IN ('success', 'failure') AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("purge finished tasks", e))?
        .rows_affected();
        Ok(rows)
    }

    async fn task_counts(&self) -> StoreResult<Vec<TaskCount>> {
        let rows = sqlx::query(
            "SELECT lane, status, COUNT(*) AS count FROM tasks GROUP BY lane, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("count tasks", e))?;

        rows.into_iter()
            .map(|row| {
                let lane: String = row.get("lane");
                let status: String = row.get("status");
                Ok(TaskCount {
                    lane: lane.parse::<Lane>().map_err(DatabaseError::Decode)?,
                    status: status.parse::<TaskStatus>().map_err(DatabaseError::Decode)?,
                    count: row.get("count"),
                })
            })
            .collect()
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = CASE
                    WHEN attempts < max_attempts AND cancel_requested = 0 THEN 'retrying'
                    ELSE 'failure'
                END,
                finished_at = CASE
                    WHEN attempts < max_attempts AND cancel_requested = 0 THEN finished_at
                    ELSE ?1
                END,
                next_run_at = ?1,
                last_error = CASE WHEN cancel_requested = 1 THEN 'cancelled' ELSE 'lease expired' END,
                lease_owner = NULL, lease_token = NULL, lease_expires_at = NULL,
                updated_at = ?1
            WHERE status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at < ?1)
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("reclaim leases", e))?;

        if !rows.is_empty() {
            warn!("Reclaimed {} task(s) with expired leases", rows.len());
        }
        rows.into_iter().map(TaskRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange::{Environment, Exchange};
    use crate::domain::entities::order::{OrderRole, OrderSide, OrderStatus, OrderType};
    use crate::domain::entities::task::TaskKind;
    use crate::persistence::{init_database, DatabaseConfig};
    use chrono::Duration;

    async fn store() -> SqliteStore {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        };
        SqliteStore::new(init_database(&config).await.unwrap())
    }

    #[tokio::test]
    async fn test_webhook_auto_pause_in_sql() {
        let store = store().await;
        let mut webhook = Webhook::new(1, "tv", "abc", Some("s"));
        webhook.error_threshold = 2;
        let webhook = store.create_webhook(&webhook).await.unwrap();

        let now = Utc::now();
        let after = store.record_webhook_outcome(webhook.id, false, now).await.unwrap();
        assert_eq!(after.status, WebhookStatus::Active);
        let after = store.record_webhook_outcome(webhook.id, false, now).await.unwrap();
        assert_eq!(after.status, WebhookStatus::Paused);
        assert_eq!(after.failed_deliveries, 2);

        store
            .set_webhook_status(webhook.id, WebhookStatus::Active)
            .await
            .unwrap();
        let after = store.record_webhook_outcome(webhook.id, true, now).await.unwrap();
        assert_eq!(after.consecutive_errors, 0);
        assert_eq!(after.successful_deliveries, 1);
        assert!(after.is_active());
    }

    #[tokio::test]
    async fn test_delivery_roundtrip_and_dedup_lookup() {
        let store = store().await;
        let webhook = store
            .create_webhook(&Webhook::new(1, "tv", "p1", None))
            .await
            .unwrap();
        let delivery = WebhookDelivery::new(
            webhook.id,
            r#"{"ticker":"BTCUSDT"}"#,
            serde_json::json!({"x-signature": "abc"}),
            Some("alert-1".into()),
        );
        let mut saved = store.create_delivery(&delivery).await.unwrap();
        assert!(saved.id > 0);
        assert_eq!(saved.headers["x-signature"], "abc");

        saved.mark_processing().unwrap();
        saved.mark_success(5).unwrap();
        saved.orders_created = 1;
        store.update_delivery(&saved).await.unwrap();

        let found = store
            .find_recent_delivery(webhook.id, "alert-1", Utc::now() - Duration::seconds(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, saved.id);
        assert_eq!(found.orders_created, 1);
        assert_eq!(found.processing_duration_ms, Some(5));
    }

    #[tokio::test]
    async fn test_order_lookup_by_client_id() {
        let store = store().await;
        let mut order = Order::new(
            1,
            2,
            Exchange::Bybit,
            "wh9-e".into(),
            "ETHUSDT".into(),
            OrderSide::Sell,
            OrderType::Market,
            OrderRole::Entry,
            0.5,
            None,
        )
        .unwrap();
        order = store.create_order(&order).await.unwrap();
        order.transition(OrderStatus::Submitted).unwrap();
        order.exchange_order_id = Some("123".into());
        store.update_order(&order).await.unwrap();

        let loaded = store.get_order_by_client_id("wh9-e").await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Submitted);
        assert_eq!(loaded.exchange, Exchange::Bybit);
        assert_eq!(loaded.exchange_order_id.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn test_account_roundtrip() {
        let store = store().await;
        let account = ExchangeAccount::new(
            3,
            "main",
            Exchange::Binance,
            Environment::Testnet,
            "enc-k".into(),
            "enc-s".into(),
        );
        let mut saved = store.create_account(&account).await.unwrap();
        saved.available_balance = 1500.0;
        store.update_account(&saved).await.unwrap();

        let accounts = store.list_accounts_for_user(3).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].available_balance, 1500.0);
    }

    #[tokio::test]
    async fn test_task_claim_and_lease_check() {
        let store = store().await;
        let task = TaskRecord::new(
            Lane::WebhookProcessing,
            TaskKind::ProcessWebhook { delivery_id: 1 },
            9,
            3,
        );
        store.insert_task(&task).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let mut claimed = store
            .claim_next_task(Lane::WebhookProcessing, "w-1", now + Duration::minutes(5), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, 1);
        let token = claimed.lease_token.clone().unwrap();

        // Nothing else to claim
        assert!(store
            .claim_next_task(Lane::WebhookProcessing, "w-2", now + Duration::minutes(5), now)
            .await
            .unwrap()
            .is_none());

        claimed.status = TaskStatus::Success;
        claimed.lease_token = None;
        assert!(!store.update_task_if_leased(&claimed, "stale").await.unwrap());
        assert!(store.update_task_if_leased(&claimed, &token).await.unwrap());

        let counts = store.task_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![TaskCount {
                lane: Lane::WebhookProcessing,
                status: TaskStatus::Success,
                count: 1
            }]
        );
    }
}
