//! Database Models
//!
//! Row structs for the SQLite tables and their conversion into domain entities.
//! Enums are stored as their lowercase string form, JSON columns as TEXT.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

use super::DatabaseError;
use crate::domain::entities::account::ExchangeAccount;
use crate::domain::entities::delivery::WebhookDelivery;
use crate::domain::entities::order::Order;
use crate::domain::entities::task::TaskRecord;
use crate::domain::entities::webhook::Webhook;

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, DatabaseError> {
    value.parse::<T>().map_err(DatabaseError::Decode)
}

fn parse_opt<T: FromStr<Err = String>>(value: Option<&str>) -> Result<Option<T>, DatabaseError> {
    value.map(parse).transpose()
}

fn parse_json(value: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(value).map_err(|e| DatabaseError::Decode(e.to_string()))
}

/// Webhook record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub url_path: String,
    pub secret: Option<String>,
    pub status: String,
    pub default_margin: Option<f64>,
    pub default_leverage: Option<i64>,
    pub default_stop_loss_pct: Option<f64>,
    pub default_take_profit_pct: Option<f64>,
    pub exchange: Option<String>,
    pub environment: Option<String>,
    pub total_deliveries: i64,
    pub successful_deliveries: i64,
    pub failed_deliveries: i64,
    pub consecutive_errors: i64,
    pub error_threshold: i64,
    pub auto_pause_on_errors: bool,
    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRecord> for Webhook {
    type Error = DatabaseError;

    fn try_from(r: WebhookRecord) -> Result<Self, Self::Error> {
        Ok(Webhook {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            url_path: r.url_path,
            secret: r.secret,
            status: parse(&r.status)?,
            default_margin: r.default_margin,
            default_leverage: r.default_leverage.map(|l| l.clamp(1, u32::MAX as i64) as u32),
            default_stop_loss_pct: r.default_stop_loss_pct,
            default_take_profit_pct: r.default_take_profit_pct,
            exchange: parse_opt(r.exchange.as_deref())?,
            environment: parse_opt(r.environment.as_deref())?,
            total_deliveries: r.total_deliveries,
            successful_deliveries: r.successful_deliveries,
            failed_deliveries: r.failed_deliveries,
            consecutive_errors: r.consecutive_errors,
            error_threshold: r.error_threshold,
            auto_pause_on_errors: r.auto_pause_on_errors,
            last_delivery_at: r.last_delivery_at,
            last_success_at: r.last_success_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// Delivery record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    pub id: i64,
    pub webhook_id: i64,
    pub alert_id: Option<String>,
    pub payload: String,
    pub headers: String, // JSON string
    pub hmac_valid: bool,
    pub payload_valid: bool,
    pub status: String,
    pub retry_count: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub orders_created: i64,
    pub orders_executed: i64,
    pub orders_failed: i64,
    pub processing_duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_details: Option<String>, // JSON string
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRecord> for WebhookDelivery {
    type Error = DatabaseError;

    fn try_from(r: DeliveryRecord) -> Result<Self, Self::Error> {
        Ok(WebhookDelivery {
            id: r.id,
            webhook_id: r.webhook_id,
            alert_id: r.alert_id,
            payload: r.payload,
            headers: parse_json(&r.headers)?,
            hmac_valid: r.hmac_valid,
            payload_valid: r.payload_valid,
            status: parse(&r.status)?,
            retry_count: r.retry_count as i32,
            next_retry_at: r.next_retry_at,
            orders_created: r.orders_created as i32,
            orders_executed: r.orders_executed as i32,
            orders_failed: r.orders_failed as i32,
            processing_duration_ms: r.processing_duration_ms,
            error_message: r.error_message,
            error_details: r.error_details.as_deref().map(parse_json).transpose()?,
            task_id: r.task_id,
            created_at: r.created_at,
            processed_at: r.processed_at,
            updated_at: r.updated_at,
        })
    }
}

/// Order record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: i64,
    pub user_id: i64,
    pub account_id: i64,
    pub webhook_delivery_id: Option<i64>,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub role: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub filled_quantity: f64,
    pub filled_notional: f64,
    pub average_fill_price: Option<f64>,
    pub status: String,
    pub retry_count: i64,
    pub failure_reason: Option<String>,
    pub exchange_error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRecord> for Order {
    type Error = DatabaseError;

    fn try_from(r: OrderRecord) -> Result<Self, Self::Error> {
        Ok(Order {
            id: r.id,
            user_id: r.user_id,
            account_id: r.account_id,
            webhook_delivery_id: r.webhook_delivery_id,
            client_order_id: r.client_order_id,
            exchange_order_id: r.exchange_order_id,
            exchange: parse(&r.exchange)?,
            symbol: r.symbol,
            side: parse(&r.side)?,
            order_type: parse(&r.order_type)?,
            role: parse(&r.role)?,
            quantity: r.quantity,
            price: r.price,
            stop_price: r.stop_price,
            reduce_only: r.reduce_only,
            filled_quantity: r.filled_quantity,
            filled_notional: r.filled_notional,
            average_fill_price: r.average_fill_price,
            status: parse(&r.status)?,
            retry_count: r.retry_count as i32,
            failure_reason: r.failure_reason,
            exchange_error_code: r.exchange_error_code,
            created_at: r.created_at,
            submitted_at: r.submitted_at,
            updated_at: r.updated_at,
        })
    }
}

/// Exchange account record in database
#[derive(Debug, Clone, FromRow)]
pub struct AccountRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub exchange: String,
    pub environment: String,
    pub api_key_encrypted: String,
    pub api_secret_encrypted: String,
    pub passphrase_encrypted: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub health_status: String,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub available_balance: f64,
    pub open_exposure: f64,
    pub total_orders: i64,
    pub successful_orders: i64,
    pub failed_orders: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRecord> for ExchangeAccount {
    type Error = DatabaseError;

    fn try_from(r: AccountRecord) -> Result<Self, Self::Error> {
        Ok(ExchangeAccount {
            id: r.id,
            user_id: r.user_id,
            name: r.name,
            exchange: parse(&r.exchange)?,
            environment: parse(&r.environment)?,
            api_key_encrypted: r.api_key_encrypted,
            api_secret_encrypted: r.api_secret_encrypted,
            passphrase_encrypted: r.passphrase_encrypted,
            is_active: r.is_active,
            is_default: r.is_default,
            health_status: parse(&r.health_status)?,
            last_health_check_at: r.last_health_check_at,
            last_healthy_at: r.last_healthy_at,
            last_error: r.last_error,
            available_balance: r.available_balance,
            open_exposure: r.open_exposure,
            total_orders: r.total_orders,
            successful_orders: r.successful_orders,
            failed_orders: r.failed_orders,
            last_used_at: r.last_used_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// Task record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub lane: String,
    pub kind: String, // JSON string
    pub priority: i64,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub next_run_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = DatabaseError;

    fn try_from(r: TaskRow) -> Result<Self, Self::Error> {
        let kind = serde_json::from_str(&r.kind)
            .map_err(|e| DatabaseError::Decode(format!("task {} kind: {}", r.id, e)))?;
        Ok(TaskRecord {
            lane: parse(&r.lane)?,
            kind,
            priority: r.priority as i32,
            status: parse(&r.status)?,
            attempts: r.attempts.max(0) as u32,
            max_attempts: r.max_attempts.max(1) as u32,
            next_run_at: r.next_run_at,
            lease_owner: r.lease_owner,
            lease_token: r.lease_token,
            lease_expires_at: r.lease_expires_at,
            cancel_requested: r.cancel_requested,
            last_error: r.last_error,
            created_at: r.created_at,
            updated_at: r.updated_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            id: r.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::task::{Lane, TaskKind, TaskStatus};

    #[test]
    fn test_task_row_roundtrip_fields() {
        let now = Utc::now();
        let row = TaskRow {
            id: "t1".into(),
            lane: "order_execution".into(),
            kind: r#"{"type":"execute_order","order_id":5}"#.into(),
            priority: 10,
            status: "retrying".into(),
            attempts: 2,
            max_attempts: 4,
            next_run_at: now,
            lease_owner: None,
            lease_token: None,
            lease_expires_at: None,
            cancel_requested: false,
            last_error: Some("timeout".into()),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        let task = TaskRecord::try_from(row).unwrap();
        assert_eq!(task.lane, Lane::OrderExecution);
        assert_eq!(task.kind, TaskKind::ExecuteOrder { order_id: 5 });
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.attempts, 2);
    }

    #[test]
    fn test_bad_enum_is_decode_error() {
        let now = Utc::now();
        let row = TaskRow {
            id: "t1".into(),
            lane: "bogus".into(),
            kind: r#"{"type":"reclaim_leases"}"#.into(),
            priority: 1,
            status: "pending".into(),
            attempts: 0,
            max_attempts: 1,
            next_run_at: now,
            lease_owner: None,
            lease_token: None,
            lease_expires_at: None,
            cancel_requested: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        assert!(matches!(
            TaskRecord::try_from(row),
            Err(DatabaseError::Decode(_))
        ));
    }
}
