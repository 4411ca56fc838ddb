//! Order dispatch for accepted alerts
//!
//! Turns a pending delivery into exchange orders: resolve the trading request,
//! pick an account, decrypt its credentials, place the entry order and then
//! the native stop-loss / take-profit orders.
//!
//! Every order row is written `pending` with a deterministic client order id
//! (`wh<delivery>-<role>`) before it is sent. A retried task looks the order
//! up on the exchange by that id instead of submitting it twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::orchestrator::TaskHandler;
use crate::domain::entities::account::{ExchangeAccount, HealthStatus};
use crate::domain::entities::delivery::{DeliveryStatus, WebhookDelivery};
use crate::domain::entities::order::{Order, OrderRole, OrderSide, OrderStatus, OrderType};
use crate::domain::entities::signal::{Sizing, TradingRequest};
use crate::domain::entities::task::{TaskKind, TaskRecord};
use crate::domain::entities::webhook::WebhookStatus;
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeClientProvider, ExchangeError, OrderAck, OrderRequest, PositionInfo,
};
use crate::domain::repositories::store::Store;
use crate::domain::services::account_selector::{AccountCriteria, AccountSelector};
use crate::domain::services::credential_vault::CredentialVault;
use crate::domain::services::keyed_locks::KeyedLocks;
use crate::domain::services::payload_normalizer::normalize;
use crate::domain::services::positions_cache::{CacheKind, PositionsCache};
use crate::domain::value_objects::symbol_rules::SymbolRules;

/// Client order id shared by every attempt at the same order
pub fn client_order_id(delivery_id: i64, role: OrderRole) -> String {
    format!("wh{}-{}", delivery_id, role.tag())
}

/// What to place for one role
#[derive(Debug, Clone)]
struct OrderSpec {
    role: OrderRole,
    side: OrderSide,
    order_type: OrderType,
    quantity: f64,
    price: Option<f64>,
    stop_price: Option<f64>,
    reduce_only: bool,
    /// Price used for the notional check of market orders
    reference_price: f64,
}

pub struct OrderDispatcher {
    store: Arc<dyn Store>,
    selector: AccountSelector,
    vault: Arc<CredentialVault>,
    clients: Arc<dyn ExchangeClientProvider>,
    cache: Arc<PositionsCache>,
    account_locks: KeyedLocks<i64>,
}

impl OrderDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        selector: AccountSelector,
        vault: Arc<CredentialVault>,
        clients: Arc<dyn ExchangeClientProvider>,
        cache: Arc<PositionsCache>,
    ) -> Self {
        Self {
            store,
            selector,
            vault,
            clients,
            cache,
            account_locks: KeyedLocks::new(),
        }
    }

    /// Process one accepted delivery end to end
    pub async fn process_delivery(&self, delivery_id: i64, attempt: u32) -> DispatchResult<()> {
        let started = Instant::now();
        let mut delivery = self
            .store
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| DispatchError::ValidationFailure(format!("delivery {} not found", delivery_id)))?;

        if delivery.status == DeliveryStatus::Success {
            debug!(delivery_id, "Delivery already processed");
            return Ok(());
        }
        if delivery.status == DeliveryStatus::Failed {
            // Manual retry of an exhausted delivery
            delivery
                .mark_retrying(delivery.retry_count, Utc::now(), "requeued")
                .map_err(DispatchError::InternalFailure)?;
        }
        delivery
            .mark_processing()
            .map_err(DispatchError::InternalFailure)?;
        delivery.retry_count = attempt.saturating_sub(1) as i32;
        self.store.update_delivery(&delivery).await?;

        let webhook = self
            .store
            .get_webhook(delivery.webhook_id)
            .await?
            .ok_or_else(|| {
                DispatchError::ValidationFailure(format!("webhook {} not found", delivery.webhook_id))
            })?;
        let payload: Value = serde_json::from_str(&delivery.payload)
            .map_err(|e| DispatchError::ValidationFailure(format!("stored payload: {}", e)))?;
        let signal = normalize(&payload)?;
        let request =
            TradingRequest::from_signal(&signal, &webhook).map_err(DispatchError::ValidationFailure)?;

        let criteria = AccountCriteria {
            exchange: request.exchange,
            environment: request.environment,
        };
        let account = self
            .selector
            .select(request.user_id, &criteria)
            .await?
            .ok_or_else(|| {
                DispatchError::AccountUnavailable(format!(
                    "no tradable account for user {}",
                    request.user_id
                ))
            })?;

        info!(
            delivery_id,
            account_id = account.id,
            exchange = %account.exchange,
            symbol = %request.symbol,
            action = request.action.as_str(),
            attempt,
            "Dispatching alert"
        );

        let result = {
            let _guard = self.account_locks.lock(account.id).await;
            let result = self.dispatch_on_account(&request, &account, &delivery).await;
            self.cache.invalidate(request.user_id, None);
            result
        };

        self.refresh_order_counters(&mut delivery).await?;
        match result {
            Ok(protective_errors) => {
                delivery.error_message = if protective_errors.is_empty() {
                    None
                } else {
                    Some(protective_errors.join("; "))
                };
                delivery
                    .mark_success(started.elapsed().as_millis() as i64)
                    .map_err(DispatchError::InternalFailure)?;
                self.store.update_delivery(&delivery).await?;
                self.store
                    .record_webhook_outcome(webhook.id, true, Utc::now())
                    .await?;
                self.record_account_outcome(account.id, None).await?;
                info!(
                    delivery_id,
                    orders_created = delivery.orders_created,
                    orders_failed = delivery.orders_failed,
                    duration_ms = delivery.processing_duration_ms,
                    "Delivery processed"
                );
                Ok(())
            }
            Err(err) => {
                self.store.update_delivery(&delivery).await?;
                self.record_account_outcome(account.id, Some(&err)).await?;
                Err(err)
            }
        }
    }

    /// Steps run under the account lock. Returns the protective-order errors,
    /// which never fail the delivery.
    async fn dispatch_on_account(
        &self,
        request: &TradingRequest,
        account: &ExchangeAccount,
        delivery: &WebhookDelivery,
    ) -> DispatchResult<Vec<String>> {
        let credentials = self.vault.decrypt_credentials(account)?;
        let client = self
            .clients
            .client(account.exchange, account.environment, credentials)?;
        let rules = client.exchange_info(&request.symbol).await?;

        let entry_spec = match request.action.side() {
            Some(side) => {
                let reference = match request.price {
                    Some(p) => p,
                    None => client.ticker_price(&request.symbol).await?,
                };
                let quantity = match request.sizing {
                    Some(Sizing::Quantity(q)) => q,
                    Some(Sizing::Margin { margin, leverage }) => {
                        margin * leverage as f64 / reference
                    }
                    None => {
                        return Err(DispatchError::ValidationFailure(
                            "no order size".to_string(),
                        ))
                    }
                };
                if let Some(leverage) = request.leverage {
                    client.set_leverage(&request.symbol, leverage).await?;
                }
                OrderSpec {
                    role: OrderRole::Entry,
                    side,
                    order_type: request.order_type,
                    quantity,
                    price: request.price.filter(|_| request.order_type == OrderType::Limit),
                    stop_price: None,
                    reduce_only: false,
                    reference_price: reference,
                }
            }
            None => {
                let Some(position) = self
                    .open_position(request.user_id, account.id, &client, &request.symbol)
                    .await?
                else {
                    info!(symbol = %request.symbol, account_id = account.id, "No open position to close");
                    return Ok(Vec::new());
                };
                OrderSpec {
                    role: OrderRole::Close,
                    side: position.side.opposite(),
                    order_type: OrderType::Market,
                    quantity: position.quantity,
                    price: None,
                    stop_price: None,
                    reduce_only: true,
                    reference_price: position.mark_price.unwrap_or(position.entry_price),
                }
            }
        };

        let entry = self
            .place_order(client.as_ref(), &rules, delivery, account, &entry_spec)
            .await?;
        if entry.role != OrderRole::Entry {
            return Ok(Vec::new());
        }

        let entry_price = entry
            .average_fill_price
            .or(entry.price)
            .unwrap_or(entry_spec.reference_price);
        let protect_qty = if entry.filled_quantity > 0.0 {
            entry.filled_quantity
        } else {
            entry.quantity
        };

        let mut protective_errors = Vec::new();
        let legs = [
            (OrderRole::StopLoss, request.stop_loss, OrderType::StopMarket),
            (OrderRole::TakeProfit, request.take_profit, OrderType::TakeProfitMarket),
        ];
        for (role, level, order_type) in legs {
            let Some(level) = level else { continue };
            let trigger = match role {
                OrderRole::StopLoss => level.stop_loss_price(entry_spec.side, entry_price),
                _ => level.take_profit_price(entry_spec.side, entry_price),
            };
            let spec = OrderSpec {
                role,
                side: entry_spec.side.opposite(),
                order_type,
                quantity: protect_qty,
                price: None,
                stop_price: Some(trigger),
                reduce_only: true,
                reference_price: entry_price,
            };
            if let Err(err) = self
                .place_order(client.as_ref(), &rules, delivery, account, &spec)
                .await
            {
                warn!(
                    delivery_id = delivery.id,
                    role = role.as_str(),
                    trigger,
                    error = %err,
                    "Protective order failed"
                );
                protective_errors.push(format!("{} order failed: {}", role.as_str(), err));
            }
        }
        Ok(protective_errors)
    }

    /// Load or create the order row for `spec`, then submit or reconcile it
    async fn place_order(
        &self,
        client: &dyn ExchangeClient,
        rules: &SymbolRules,
        delivery: &WebhookDelivery,
        account: &ExchangeAccount,
        spec: &OrderSpec,
    ) -> DispatchResult<Order> {
        let cid = client_order_id(delivery.id, spec.role);
        let mut order = match self.store.get_order_by_client_id(&cid).await? {
            Some(existing) => existing,
            None => {
                let mut order = Order::new(
                    account.user_id,
                    account.id,
                    account.exchange,
                    cid,
                    rules.symbol.clone(),
                    spec.side,
                    spec.order_type,
                    spec.role,
                    spec.quantity,
                    spec.price,
                )
                .map_err(DispatchError::ValidationFailure)?;
                order.stop_price = spec.stop_price;
                order.reduce_only = spec.reduce_only;
                order.webhook_delivery_id = Some(delivery.id);
                self.store.create_order(&order).await?
            }
        };
        self.submit(client, rules, &mut order, spec.reference_price)
            .await?;
        Ok(order)
    }

    /// Send a pending order, or bring an acknowledged one up to date
    async fn submit(
        &self,
        client: &dyn ExchangeClient,
        rules: &SymbolRules,
        order: &mut Order,
        reference_price: f64,
    ) -> DispatchResult<()> {
        match order.status {
            OrderStatus::Rejected | OrderStatus::Failed => {
                return Err(DispatchError::ExchangeRejected {
                    code: order
                        .exchange_error_code
                        .clone()
                        .unwrap_or_else(|| order.status.as_str().to_string()),
                    message: order.failure_reason.clone().unwrap_or_default(),
                });
            }
            status if status.is_terminal() => return Ok(()),
            OrderStatus::Pending => {}
            _ => {
                if let Some(ack) = client.get_order(&order.symbol, &order.client_order_id).await? {
                    self.apply_ack(order, &ack).await?;
                }
                return Ok(());
            }
        }

        // An earlier attempt may have reached the exchange
        if order.retry_count > 0 {
            if let Some(ack) = client.get_order(&order.symbol, &order.client_order_id).await? {
                info!(client_order_id = %order.client_order_id, "Order found on exchange, reconciled");
                return self.apply_ack(order, &ack).await;
            }
        }

        let prepared = match rules.prepare(
            order.quantity,
            order.price,
            order.stop_price,
            Some(reference_price),
            order.reduce_only,
        ) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.fail_order(order, OrderStatus::Rejected, &err).await?;
                return Err(err.into());
            }
        };
        order.quantity = prepared.quantity;
        order.price = prepared.price;
        order.stop_price = prepared.stop_price;
        order.retry_count += 1;
        order.updated_at = Utc::now();
        self.store.update_order(order).await?;

        match client.create_order(&order_request(order)).await {
            Ok(ack) => {
                debug!(
                    client_order_id = %order.client_order_id,
                    exchange_order_id = %ack.exchange_order_id,
                    status = %ack.status,
                    "Order acknowledged"
                );
                self.apply_ack(order, &ack).await
            }
            Err(err) if err.is_retryable() => {
                // Stays pending; the next attempt reconciles by client id
                warn!(client_order_id = %order.client_order_id, error = %err, "Order submission interrupted");
                Err(err.into())
            }
            Err(err) => {
                let status = match err {
                    ExchangeError::Auth(_) => OrderStatus::Failed,
                    _ => OrderStatus::Rejected,
                };
                self.fail_order(order, status, &err).await?;
                Err(err.into())
            }
        }
    }

    async fn apply_ack(&self, order: &mut Order, ack: &OrderAck) -> DispatchResult<()> {
        order.exchange_order_id = Some(ack.exchange_order_id.clone());
        order
            .reconcile(ack.status, ack.filled_quantity, ack.average_price)
            .map_err(|e| DispatchError::InternalFailure(e.to_string()))?;
        self.store.update_order(order).await?;
        Ok(())
    }

    async fn fail_order(
        &self,
        order: &mut Order,
        status: OrderStatus,
        err: &ExchangeError,
    ) -> DispatchResult<()> {
        if let Err(e) = order.fail(status, &err.to_string(), err.code()) {
            warn!(client_order_id = %order.client_order_id, "Could not mark order failed: {}", e);
        }
        self.store.update_order(order).await?;
        Ok(())
    }

    /// Positions of one account, read through the user's cache entry
    async fn open_position(
        &self,
        user_id: i64,
        account_id: i64,
        client: &Arc<dyn ExchangeClient>,
        symbol: &str,
    ) -> DispatchResult<Option<PositionInfo>> {
        let key = account_id.to_string();
        let cached: Option<Vec<PositionInfo>> = self
            .cache
            .get(user_id, CacheKind::Positions)
            .and_then(|v| v.get(&key).cloned())
            .and_then(|v| serde_json::from_value(v).ok());

        let positions = match cached {
            Some(positions) => positions,
            None => {
                let fresh = client.positions(None).await?;
                let mut by_account: HashMap<String, Value> = self
                    .cache
                    .get(user_id, CacheKind::Positions)
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                by_account.insert(key, json!(fresh));
                self.cache
                    .set(user_id, CacheKind::Positions, json!(by_account), None);
                fresh
            }
        };
        Ok(positions
            .into_iter()
            .find(|p| p.symbol == symbol && p.quantity > 0.0))
    }

    async fn refresh_order_counters(&self, delivery: &mut WebhookDelivery) -> DispatchResult<()> {
        let orders = self.store.orders_for_delivery(delivery.id).await?;
        delivery.orders_created = orders.len() as i32;
        delivery.orders_executed = orders
            .iter()
            .filter(|o| o.status.is_acknowledged() && o.status != OrderStatus::Rejected)
            .count() as i32;
        delivery.orders_failed = orders
            .iter()
            .filter(|o| matches!(o.status, OrderStatus::Rejected | OrderStatus::Failed))
            .count() as i32;
        Ok(())
    }

    /// Usage counters, and error health when the exchange refused the keys
    async fn record_account_outcome(
        &self,
        account_id: i64,
        error: Option<&DispatchError>,
    ) -> DispatchResult<()> {
        let Some(mut account) = self.store.get_account(account_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        account.record_order_outcome(error.is_none(), now);
        if let Some(DispatchError::AuthenticationFailure(msg)) = error {
            warn!(account_id, "Exchange refused credentials, account marked unhealthy");
            account.record_health(HealthStatus::Error, Some(msg.clone()), now);
        }
        self.store.update_account(&account).await?;
        Ok(())
    }

    /// Resubmit or reconcile one persisted order
    pub async fn execute_order(&self, order_id: i64) -> DispatchResult<()> {
        let mut order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| DispatchError::ValidationFailure(format!("order {} not found", order_id)))?;
        if order.status.is_terminal() {
            debug!(order_id, status = %order.status, "Order already final");
            return Ok(());
        }

        let account = self
            .store
            .get_account(order.account_id)
            .await?
            .filter(|a| a.can_trade())
            .ok_or_else(|| {
                DispatchError::AccountUnavailable(format!(
                    "account {} cannot trade",
                    order.account_id
                ))
            })?;

        let _guard = self.account_locks.lock(account.id).await;
        let credentials = self.vault.decrypt_credentials(&account)?;
        let client = self
            .clients
            .client(account.exchange, account.environment, credentials)?;
        let rules = client.exchange_info(&order.symbol).await?;
        let reference = match order.price.or(order.stop_price) {
            Some(p) => p,
            None => client.ticker_price(&order.symbol).await?,
        };

        let result = self
            .submit(client.as_ref(), &rules, &mut order, reference)
            .await;
        self.cache.invalidate(order.user_id, None);
        result
    }

    async fn mark_delivery_retrying(
        &self,
        delivery_id: i64,
        attempts: u32,
        next_run_at: DateTime<Utc>,
        error: &DispatchError,
    ) -> DispatchResult<()> {
        let Some(mut delivery) = self.store.get_delivery(delivery_id).await? else {
            return Ok(());
        };
        delivery
            .mark_retrying(attempts as i32, next_run_at, &error.to_string())
            .map_err(DispatchError::InternalFailure)?;
        self.store.update_delivery(&delivery).await?;
        Ok(())
    }

    async fn mark_delivery_failed(
        &self,
        delivery_id: i64,
        attempts: u32,
        error: &DispatchError,
    ) -> DispatchResult<()> {
        let Some(mut delivery) = self.store.get_delivery(delivery_id).await? else {
            return Ok(());
        };
        if delivery.is_terminal() {
            return Ok(());
        }
        delivery
            .mark_failed(
                &error.to_string(),
                Some(json!({
                    "code": error.error_code(),
                    "attempts": attempts,
                    "retryable": error.is_retryable(),
                })),
            )
            .map_err(DispatchError::InternalFailure)?;
        self.store.update_delivery(&delivery).await?;

        let before = self.store.get_webhook(delivery.webhook_id).await?;
        let after = self
            .store
            .record_webhook_outcome(delivery.webhook_id, false, Utc::now())
            .await?;
        if after.status == WebhookStatus::Paused
            && before.map(|w| w.status) != Some(WebhookStatus::Paused)
        {
            warn!(
                webhook_id = after.id,
                consecutive_errors = after.consecutive_errors,
                "Webhook auto-paused after repeated failures"
            );
        }
        Ok(())
    }

    async fn mark_order_failed(&self, order_id: i64, error: &DispatchError) -> DispatchResult<()> {
        let Some(mut order) = self.store.get_order(order_id).await? else {
            return Ok(());
        };
        if order.status == OrderStatus::Pending {
            if let Err(e) = order.fail(OrderStatus::Failed, &error.to_string(), None) {
                warn!(order_id, "Could not mark order failed: {}", e);
            }
            self.store.update_order(&order).await?;
        }
        Ok(())
    }
}

fn order_request(order: &Order) -> OrderRequest {
    let request = match order.order_type {
        OrderType::Market => OrderRequest::market(
            &order.symbol,
            order.side,
            order.quantity,
            &order.client_order_id,
        ),
        OrderType::Limit => OrderRequest::limit(
            &order.symbol,
            order.side,
            order.quantity,
            order.price.unwrap_or_default(),
            &order.client_order_id,
        ),
        OrderType::StopMarket | OrderType::TakeProfitMarket => OrderRequest::conditional(
            &order.symbol,
            order.side,
            order.order_type,
            order.quantity,
            order.stop_price.unwrap_or_default(),
            &order.client_order_id,
        ),
    };
    if order.reduce_only {
        request.reduce_only()
    } else {
        request
    }
}

#[async_trait]
impl TaskHandler for OrderDispatcher {
    async fn run(&self, task: &TaskRecord) -> DispatchResult<()> {
        match task.kind {
            TaskKind::ProcessWebhook { delivery_id } => {
                self.process_delivery(delivery_id, task.attempts).await
            }
            TaskKind::ExecuteOrder { order_id } => self.execute_order(order_id).await,
            ref other => Err(DispatchError::ValidationFailure(format!(
                "order dispatcher cannot run '{}'",
                other.name()
            ))),
        }
    }

    async fn on_retry_scheduled(
        &self,
        task: &TaskRecord,
        error: &DispatchError,
        next_run_at: DateTime<Utc>,
    ) {
        if let TaskKind::ProcessWebhook { delivery_id } = task.kind {
            if let Err(e) = self
                .mark_delivery_retrying(delivery_id, task.attempts, next_run_at, error)
                .await
            {
                error!(delivery_id, "Could not mark delivery retrying: {}", e);
            }
        }
    }

    async fn on_exhausted(&self, task: &TaskRecord, error: &DispatchError) {
        let result = match task.kind {
            TaskKind::ProcessWebhook { delivery_id } => {
                self.mark_delivery_failed(delivery_id, task.attempts, error)
                    .await
            }
            TaskKind::ExecuteOrder { order_id } => self.mark_order_failed(order_id, error).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!(task_id = %task.id, "Could not record task failure: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderRole;

    #[test]
    fn test_client_order_id_is_deterministic() {
        assert_eq!(client_order_id(42, OrderRole::Entry), "wh42-e");
        assert_eq!(client_order_id(42, OrderRole::StopLoss), "wh42-sl");
        assert_eq!(client_order_id(42, OrderRole::TakeProfit), "wh42-tp");
        assert_eq!(client_order_id(42, OrderRole::Close), "wh42-x");
    }

    #[test]
    fn test_order_request_for_protective_order() {
        let mut order = Order::new(
            1,
            2,
            crate::domain::entities::exchange::Exchange::Binance,
            "wh1-sl".into(),
            "BTCUSDT".into(),
            OrderSide::Sell,
            OrderType::StopMarket,
            OrderRole::StopLoss,
            0.01,
            None,
        )
        .unwrap();
        order.stop_price = Some(49_000.0);
        order.reduce_only = true;

        let request = order_request(&order);
        assert_eq!(request.order_type, OrderType::StopMarket);
        assert_eq!(request.stop_price, Some(49_000.0));
        assert!(request.reduce_only);
        assert!(request.price.is_none());
    }
}
