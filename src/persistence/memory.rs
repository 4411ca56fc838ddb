//! In-memory store
//!
//! Same contract as the SQLite repositories, backed by maps behind one mutex.
//! Used by tests and by `DATABASE_URL=memory` runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::DatabaseError;
use crate::domain::entities::account::ExchangeAccount;
use crate::domain::entities::delivery::{DeliveryStatus, WebhookDelivery};
use crate::domain::entities::order::Order;
use crate::domain::entities::task::{Lane, TaskRecord, TaskStatus};
use crate::domain::entities::webhook::{Webhook, WebhookStatus};
use crate::domain::repositories::store::{
    AccountRepository, CancelOutcome, DeliveryRepository, OrderRepository, StoreResult,
    TaskCount, TaskStore, WebhookRepository,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    webhooks: HashMap<i64, Webhook>,
    deliveries: HashMap<i64, WebhookDelivery>,
    orders: HashMap<i64, Order>,
    accounts: HashMap<i64, ExchangeAccount>,
    tasks: HashMap<String, TaskRecord>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| DatabaseError::QueryError("in-memory store poisoned".to_string()))
    }
}

#[async_trait]
impl WebhookRepository for InMemoryStore {
    async fn create_webhook(&self, webhook: &Webhook) -> StoreResult<Webhook> {
        let mut tables = self.lock()?;
        if tables
            .webhooks
            .values()
            .any(|w| w.url_path == webhook.url_path)
        {
            return Err(DatabaseError::QueryError(format!(
                "Webhook path already exists: {}",
                webhook.url_path
            )));
        }
        let mut record = webhook.clone();
        record.id = tables.next_id();
        tables.webhooks.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_webhook(&self, id: i64) -> StoreResult<Option<Webhook>> {
        Ok(self.lock()?.webhooks.get(&id).cloned())
    }

    async fn get_webhook_by_path(&self, url_path: &str) -> StoreResult<Option<Webhook>> {
        Ok(self
            .lock()?
            .webhooks
            .values()
            .find(|w| w.url_path == url_path)
            .cloned())
    }

    async fn record_webhook_received(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let webhook = tables
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("webhook {}", id)))?;
        webhook.record_received(at);
        Ok(())
    }

    async fn record_webhook_outcome(
        &self,
        id: i64,
        success: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<Webhook> {
        let mut tables = self.lock()?;
        let webhook = tables
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("webhook {}", id)))?;
        if success {
            webhook.record_success(at);
        } else {
            webhook.record_failure(at);
        }
        Ok(webhook.clone())
    }

    async fn set_webhook_status(&self, id: i64, status: WebhookStatus) -> StoreResult<()> {
        let mut tables = self.lock()?;
        let webhook = tables
            .webhooks
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("webhook {}", id)))?;
        webhook.set_status(status, Utc::now());
        Ok(())
    }
}

#[async_trait]
impl DeliveryRepository for InMemoryStore {
    async fn create_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<WebhookDelivery> {
        let mut tables = self.lock()?;
        let mut record = delivery.clone();
        record.id = tables.next_id();
        tables.deliveries.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_delivery(&self, id: i64) -> StoreResult<Option<WebhookDelivery>> {
        Ok(self.lock()?.deliveries.get(&id).cloned())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        let mut tables = self.lock()?;
        match tables.deliveries.get_mut(&delivery.id) {
            Some(existing) => {
                *existing = delivery.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("delivery {}", delivery.id))),
        }
    }

    async fn find_recent_delivery(
        &self,
        webhook_id: i64,
        alert_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Option<WebhookDelivery>> {
        Ok(self
            .lock()?
            .deliveries
            .values()
            .filter(|d| {
                d.webhook_id == webhook_id
                    && d.alert_id.as_deref() == Some(alert_id)
                    && d.hmac_valid
                    && d.payload_valid
                    && d.created_at >= since
            })
            .max_by_key(|d| (d.created_at, d.id))
            .cloned())
    }

    async fn purge_deliveries_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.lock()?;
        let before = tables.deliveries.len();
        tables.deliveries.retain(|_, d| {
            let finished = matches!(d.status, DeliveryStatus::Success | DeliveryStatus::Failed);
            !(finished && d.created_at < cutoff)
        });
        Ok((before - tables.deliveries.len()) as u64)
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn create_order(&self, order: &Order) -> StoreResult<Order> {
        let mut tables = self.lock()?;
        if tables
            .orders
            .values()
            .any(|o| o.client_order_id == order.client_order_id)
        {
            return Err(DatabaseError::QueryError(format!(
                "Duplicate client order id: {}",
                order.client_order_id
            )));
        }
        let mut record = order.clone();
        record.id = tables.next_id();
        tables.orders.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_order(&self, id: i64) -> StoreResult<Option<Order>> {
        Ok(self.lock()?.orders.get(&id).cloned())
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> StoreResult<Option<Order>> {
        Ok(self
            .lock()?
            .orders
            .values()
            .find(|o| o.client_order_id == client_order_id)
            .cloned())
    }

    async fn update_order(&self, order: &Order) -> StoreResult<()> {
        let mut tables = self.lock()?;
        match tables.orders.get_mut(&order.id) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("order {}", order.id))),
        }
    }

    async fn orders_for_delivery(&self, delivery_id: i64) -> StoreResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .lock()?
            .orders
            .values()
            .filter(|o| o.webhook_delivery_id == Some(delivery_id))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }
}

#[async_trait]
impl AccountRepository for InMemoryStore {
    async fn create_account(&self, account: &ExchangeAccount) -> StoreResult<ExchangeAccount> {
        let mut tables = self.lock()?;
        let mut record = account.clone();
        record.id = tables.next_id();
        tables.accounts.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_account(&self, id: i64) -> StoreResult<Option<ExchangeAccount>> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn list_accounts_for_user(&self, user_id: i64) -> StoreResult<Vec<ExchangeAccount>> {
        let mut accounts: Vec<ExchangeAccount> = self
            .lock()?
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn list_active_accounts(&self) -> StoreResult<Vec<ExchangeAccount>> {
        let mut accounts: Vec<ExchangeAccount> = self
            .lock()?
            .accounts
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn update_account(&self, account: &ExchangeAccount) -> StoreResult<()> {
        let mut tables = self.lock()?;
        match tables.accounts.get_mut(&account.id) {
            Some(existing) => {
                *existing = account.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("account {}", account.id))),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn insert_task(&self, task: &TaskRecord) -> StoreResult<()> {
        self.lock()?.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<TaskRecord>> {
        Ok(self.lock()?.tasks.get(id).cloned())
    }

    async fn claim_next_task(
        &self,
        lane: Lane,
        worker_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskRecord>> {
        let mut tables = self.lock()?;
        let next_id = tables
            .tasks
            .values()
            .filter(|t| t.lane == lane && t.status.is_queued() && t.next_run_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.next_run_at.cmp(&b.next_run_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|t| t.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };
        let task = match tables.tasks.get_mut(&id) {
            Some(task) => task,
            None => return Ok(None),
        };
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.lease_owner = Some(worker_id.to_string());
        task.lease_token = Some(uuid::Uuid::new_v4().to_string());
        task.lease_expires_at = Some(lease_until);
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn update_task_if_leased(
        &self,
        task: &TaskRecord,
        lease_token: &str,
    ) -> StoreResult<bool> {
        let mut tables = self.lock()?;
        match tables.tasks.get_mut(&task.id) {
            Some(existing) if existing.holds_lease(lease_token) => {
                // Cancel flag may have been set while the task ran
                let cancel_requested = existing.cancel_requested || task.cancel_requested;
                *existing = task.clone();
                existing.cancel_requested = cancel_requested;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_task(&self, task: &TaskRecord) -> StoreResult<()> {
        let mut tables = self.lock()?;
        match tables.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(DatabaseError::NotFound(format!("task {}", task.id))),
        }
    }

    async fn cancel_task(&self, id: &str, now: DateTime<Utc>) -> StoreResult<CancelOutcome> {
        let mut tables = self.lock()?;
        let Some(task) = tables.tasks.get_mut(id) else {
            return Ok(CancelOutcome::NotFound);
        };
        let outcome = match task.status {
            TaskStatus::Pending | TaskStatus::Retrying => {
                task.status = TaskStatus::Failure;
                task.cancel_requested = true;
                task.last_error = Some("cancelled".to_string());
                task.finished_at = Some(now);
                CancelOutcome::Cancelled
            }
            TaskStatus::Running => {
                task.cancel_requested = true;
                CancelOutcome::Flagged
            }
            TaskStatus::Success | TaskStatus::Failure => return Ok(CancelOutcome::AlreadyFinished),
        };
        task.updated_at = now;
        Ok(outcome)
    }

    async fn purge_lane(&self, lane: Lane) -> StoreResult<u64> {
        let mut tables = self.lock()?;
        let before = tables.tasks.len();
        tables
            .tasks
            .retain(|_, t| !(t.lane == lane && t.status.is_queued()));
        Ok((before - tables.tasks.len()) as u64)
    }

    async fn purge_finished_tasks(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.lock()?;
        let before = tables.tasks.len();
        tables
            .tasks
            .retain(|_, t| !(t.status.is_terminal() && t.updated_at < cutoff));
        Ok((before - tables.tasks.len()) as u64)
    }

    async fn task_counts(&self) -> StoreResult<Vec<TaskCount>> {
        let tables = self.lock()?;
        let mut counts: HashMap<(Lane, &'static str), (TaskStatus, i64)> = HashMap::new();
        for task in tables.tasks.values() {
            counts
                .entry((task.lane, task.status.as_str()))
                .or_insert((task.status, 0))
                .1 += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((lane, _), (status, count))| TaskCount {
                lane,
                status,
                count,
            })
            .collect())
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> StoreResult<Vec<TaskRecord>> {
        let mut tables = self.lock()?;
        let mut reclaimed = Vec::new();
        for task in tables.tasks.values_mut() {
            let expired = task.status == TaskStatus::Running
                && task.lease_expires_at.map(|at| at < now).unwrap_or(true);
            if !expired {
                continue;
            }
            if task.attempts_left() && !task.cancel_requested {
                task.status = TaskStatus::Retrying;
            } else {
                task.status = TaskStatus::Failure;
                task.finished_at = Some(now);
            }
            task.next_run_at = now;
            task.last_error = Some(
                if task.cancel_requested { "cancelled" } else { "lease expired" }.to_string(),
            );
            task.lease_owner = None;
            task.lease_token = None;
            task.lease_expires_at = None;
            task.updated_at = now;
            reclaimed.push(task.clone());
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::task::TaskKind;
    use chrono::Duration;

    fn task(priority: i32) -> TaskRecord {
        TaskRecord::new(
            Lane::WebhookProcessing,
            TaskKind::ProcessWebhook { delivery_id: 1 },
            priority,
            3,
        )
    }

    #[tokio::test]
    async fn test_claim_prefers_priority_then_age() {
        let store = InMemoryStore::new();
        let low = task(1);
        let high = task(9);
        store.insert_task(&low).await.unwrap();
        store.insert_task(&high).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        let claimed = store
            .claim_next_task(Lane::WebhookProcessing, "w1", now + Duration::seconds(30), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.lease_token.is_some());
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_other_lanes() {
        let store = InMemoryStore::new();
        let mut later = task(5);
        later.next_run_at = Utc::now() + Duration::minutes(5);
        store.insert_task(&later).await.unwrap();

        let now = Utc::now();
        assert!(store
            .claim_next_task(Lane::WebhookProcessing, "w1", now, now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim_next_task(Lane::Maintenance, "w1", now, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_complete() {
        let store = InMemoryStore::new();
        store.insert_task(&task(1)).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        let mut claimed = store
            .claim_next_task(Lane::WebhookProcessing, "w1", now, now)
            .await
            .unwrap()
            .unwrap();
        let token = claimed.lease_token.clone().unwrap();

        // Lease expires and the task is reclaimed
        assert_eq!(
            store
                .reclaim_expired_leases(now + Duration::seconds(5))
                .await
                .unwrap()
                .len(),
            1
        );

        claimed.status = TaskStatus::Success;
        assert!(!store.update_task_if_leased(&claimed, &token).await.unwrap());
        let stored = store.get_task(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Retrying);
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let store = InMemoryStore::new();
        let queued = task(1);
        store.insert_task(&queued).await.unwrap();
        assert_eq!(
            store.cancel_task(&queued.id, Utc::now()).await.unwrap(),
            CancelOutcome::Cancelled
        );
        let stored = store.get_task(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failure);
        assert_eq!(stored.last_error.as_deref(), Some("cancelled"));

        let running = task(1);
        store.insert_task(&running).await.unwrap();
        let now = Utc::now() + Duration::seconds(1);
        store
            .claim_next_task(Lane::WebhookProcessing, "w1", now + Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(
            store.cancel_task(&running.id, now).await.unwrap(),
            CancelOutcome::Flagged
        );
        assert_eq!(
            store.cancel_task("missing", now).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_find_recent_delivery_respects_window() {
        let store = InMemoryStore::new();
        let mut old = WebhookDelivery::new(1, "{}", serde_json::json!({}), Some("a".into()));
        old.created_at = Utc::now() - Duration::seconds(60);
        store.create_delivery(&old).await.unwrap();

        let since = Utc::now() - Duration::seconds(10);
        assert!(store
            .find_recent_delivery(1, "a", since)
            .await
            .unwrap()
            .is_none());

        let fresh = WebhookDelivery::new(1, "{}", serde_json::json!({}), Some("a".into()));
        let fresh = store.create_delivery(&fresh).await.unwrap();
        let found = store
            .find_recent_delivery(1, "a", since)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, fresh.id);
        assert!(store
            .find_recent_delivery(2, "a", since)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_recent_delivery_skips_rejected() {
        let store = InMemoryStore::new();
        let mut forged = WebhookDelivery::new(1, "{}", serde_json::json!({}), Some("a".into()));
        forged.hmac_valid = false;
        forged.mark_failed("signature verification failed", None).unwrap();
        store.create_delivery(&forged).await.unwrap();

        let since = Utc::now() - Duration::seconds(10);
        assert!(store
            .find_recent_delivery(1, "a", since)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id_rejected() {
        use crate::domain::entities::exchange::Exchange;
        use crate::domain::entities::order::{OrderRole, OrderSide, OrderType};

        let store = InMemoryStore::new();
        let order = Order::new(
            1,
            1,
            Exchange::Binance,
            "wh1-e".into(),
            "BTCUSDT".into(),
            OrderSide::Buy,
            OrderType::Market,
            OrderRole::Entry,
            0.01,
            None,
        )
        .unwrap();
        store.create_order(&order).await.unwrap();
        assert!(store.create_order(&order).await.is_err());
    }
}
