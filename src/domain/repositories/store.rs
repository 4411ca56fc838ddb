//! Storage traits for the dispatch core
//!
//! Implemented by the SQLite repositories and by the in-memory store used in
//! tests. Methods that must be atomic (counters, claims, lease-checked updates)
//! are single calls so each backend can make them atomic its own way.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::account::ExchangeAccount;
use crate::domain::entities::delivery::WebhookDelivery;
use crate::domain::entities::order::Order;
use crate::domain::entities::task::{Lane, TaskRecord, TaskStatus};
use crate::domain::entities::webhook::{Webhook, WebhookStatus};
use crate::persistence::DatabaseError;

pub type StoreResult<T> = Result<T, DatabaseError>;

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    async fn create_webhook(&self, webhook: &Webhook) -> StoreResult<Webhook>;

    async fn get_webhook(&self, id: i64) -> StoreResult<Option<Webhook>>;

    async fn get_webhook_by_path(&self, url_path: &str) -> StoreResult<Option<Webhook>>;

    /// Bump `total_deliveries` and `last_delivery_at`
    async fn record_webhook_received(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Apply a delivery outcome to the counters, auto-pausing on the error
    /// threshold. Returns the webhook after the update.
    async fn record_webhook_outcome(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<Webhook>;

    async fn set_webhook_status(&self, id: i64, status: WebhookStatus) -> StoreResult<()>;
}

#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<WebhookDelivery>;

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<WebhookDelivery>>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()>;

    /// Most recent accepted delivery of `webhook_id` for `alert_id` created at
    /// or after `since`. Rejected deliveries (bad signature or payload) never match.
    async fn find_recent_delivery(
        &self,
        webhook_id: i64,
        alert_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookDelivery>>;

    /// Delete finished deliveries created before `cutoff`
    async fn purge_deliveries_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, order: &Order) -> StoreResult<Order>;

    async fn get_order(&self, id: i64) -> StoreResult<Option<Order>>;

    async fn get_order_by_client_id(&self, client_order_id: &str) -> StoreResult<Option<Order>>;

    async fn update_order(&self, order: &Order) -> StoreResult<()>;

    async fn orders_for_delivery(&self, delivery_id: i64) -> StoreResult<Vec<Order>>;
}

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn create_account(&self, account: &ExchangeAccount) -> StoreResult<ExchangeAccount>;

    async fn get_account(&self, id: i64) -> StoreResult<Option<ExchangeAccount>>;

    async fn list_accounts_for_user(&self, user_id: i64) -> StoreResult<Vec<ExchangeAccount>>;

    async fn list_active_accounts(&self) -> StoreResult<Vec<ExchangeAccount>>;

    async fn update_account(&self, account: &ExchangeAccount) -> StoreResult<()>;
}

/// Result of a cancel request against the task store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Task was queued and is now failed as cancelled
    Cancelled,
    /// Task is running; the flag is honored before any retry
    Flagged,
    /// Task already finished
    AlreadyFinished,
    NotFound,
}

/// Count of tasks in one lane and status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCount {
    pub lane: Lane,
    pub status: TaskStatus,
    pub count: i64,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &TaskRecord) -> StoreResult<()>;

    async fn get_task(&self, id: &str) -> StoreResult<Option<TaskRecord>>;

    /// Atomically claim the highest-priority due task of `lane`: status becomes
    /// `running`, attempts is incremented and a fresh lease is attached.
    async fn claim_next_task(
        &self,
        lane: Lane,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>>;

    /// Persist `task` only if `lease_token` is still the active lease.
    /// Returns false when the lease was lost.
    async fn update_task_if_leased(&self, task: &TaskRecord, lease_token: &str)
        -> StoreResult<bool>;

    /// Unconditional write, for admin operations on non-running tasks
    async fn update_task(&self, task: &TaskRecord) -> StoreResult<()>;

    async fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> StoreResult<CancelOutcome>;

    /// Delete queued tasks of a lane
    async fn purge_lane(&self, lane: Lane) -> StoreResult<u64>;

    /// Delete finished tasks older than `cutoff`
    async fn purge_finished_tasks(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn task_counts(&self) -> StoreResult<Vec<TaskCount>>;

    /// Requeue running tasks whose lease expired, failing those out of attempts.
    /// Returns the tasks as written back.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>>;
}

/// Everything the dispatch core needs from storage
pub trait Store:
    WebhookRepository + DeliveryRepository + OrderRepository + AccountRepository + TaskStore
{
}

impl<T> Store for T where
    T: WebhookRepository + DeliveryRepository + OrderRepository + AccountRepository + TaskStore
{
}
