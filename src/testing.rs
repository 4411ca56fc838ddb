//! In-process exchange double and fixtures for integration tests
//!
//! [`MockExchangeClient`] keeps every order it accepts, keyed by client order
//! id, so resubmitting a known id resolves to the existing order the way the
//! real exchanges do. Failures are scripted per order type or queued for the
//! next `create_order` call.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::application::orchestrator::{
    Backoff, HandlerRegistry, LanePolicy, Orchestrator, OrchestratorConfig, TaskHandler,
};
use crate::application::services::health_checker::HealthChecker;
use crate::application::services::maintenance::Maintenance;
use crate::application::services::order_dispatcher::OrderDispatcher;
use crate::application::services::webhook_pipeline::{
    DeliveryResult, PipelineConfig, WebhookPipeline,
};
use crate::domain::entities::account::{ExchangeAccount, HealthStatus};
use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::entities::order::{OrderStatus, OrderType};
use crate::domain::entities::task::{Lane, TaskKind};
use crate::domain::entities::webhook::Webhook;
use crate::domain::services::account_selector::{AccountSelector, SelectionPolicy};
use crate::domain::services::positions_cache::PositionsCache;
use crate::domain::services::signature::compute_signature;
use crate::persistence::memory::InMemoryStore;
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::exchange_client::{
    AccountInfo, ApiCredentials, Balance, ExchangeClient, ExchangeClientProvider, ExchangeError,
    ExchangeResult, OrderAck, OrderRequest, PositionInfo,
};
use crate::domain::repositories::store::Store;
use crate::domain::services::credential_vault::CredentialVault;
use crate::domain::value_objects::symbol_rules::SymbolRules;

pub const TEST_MASTER_KEY: [u8; 32] = [0x42; 32];
pub const TEST_API_KEY: &str = "test-api-key";
pub const TEST_API_SECRET: &str = "test-api-secret";

pub fn btc_rules() -> SymbolRules {
    SymbolRules {
        symbol: "BTCUSDT".to_string(),
        tick_size: 0.1,
        step_size: 0.001,
        min_qty: 0.001,
        max_qty: Some(1000.0),
        min_notional: Some(5.0),
    }
}

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    price: f64,
    rules: HashMap<String, SymbolRules>,
    positions: Vec<PositionInfo>,
    account: Option<AccountInfo>,
    connect_error: Option<ExchangeError>,
    /// Consumed one per `create_order` before any other rule applies
    queued_create_errors: VecDeque<ExchangeError>,
    failing_types: HashMap<OrderType, ExchangeError>,
    orders: HashMap<String, OrderAck>,
    next_id: u64,
}

pub struct MockExchangeClient {
    exchange: Exchange,
    state: Mutex<MockState>,
}

impl MockExchangeClient {
    pub fn new(exchange: Exchange) -> Self {
        let mut rules = HashMap::new();
        rules.insert("BTCUSDT".to_string(), btc_rules());
        Self {
            exchange,
            state: Mutex::new(MockState {
                price: 30_000.0,
                rules,
                account: Some(AccountInfo {
                    can_trade: true,
                    total_balance: 10_000.0,
                    available_balance: 8_000.0,
                    unrealized_pnl: 0.0,
                }),
                next_id: 1,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: String) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    pub fn set_price(&self, price: f64) {
        self.state().price = price;
    }

    pub fn set_rules(&self, rules: SymbolRules) {
        self.state().rules.insert(rules.symbol.clone(), rules);
    }

    pub fn set_positions(&self, positions: Vec<PositionInfo>) {
        self.state().positions = positions;
    }

    pub fn set_account_info(&self, info: AccountInfo) {
        self.state().account = Some(info);
    }

    pub fn fail_connect(&self, error: ExchangeError) {
        self.state().connect_error = Some(error);
    }

    /// Fail the next `create_order` call, whatever it carries
    pub fn fail_next_create(&self, error: ExchangeError) {
        self.state().queued_create_errors.push_back(error);
    }

    /// Fail every `create_order` of this type
    pub fn fail_order_type(&self, order_type: OrderType, error: ExchangeError) {
        self.state().failing_types.insert(order_type, error);
    }

    /// Pretend an order reached the exchange without the caller seeing the ack
    pub fn preload_order(&self, ack: OrderAck) {
        self.state().orders.insert(ack.client_order_id.clone(), ack);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls whose name starts with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn order(&self, client_order_id: &str) -> Option<OrderAck> {
        self.state().orders.get(client_order_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        self.state().orders.len()
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let state = self.record("connect".to_string());
        match &state.connect_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn account_info(&self) -> ExchangeResult<AccountInfo> {
        let state = self.record("account_info".to_string());
        state
            .account
            .clone()
            .ok_or_else(|| ExchangeError::Unavailable("account info not scripted".to_string()))
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        let state = self.record("balances".to_string());
        Ok(state
            .account
            .as_ref()
            .map(|a| {
                vec![Balance {
                    asset: "USDT".to_string(),
                    available: a.available_balance,
                    total: a.total_balance,
                }]
            })
            .unwrap_or_default())
    }

    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let state = self.record("positions".to_string());
        Ok(state
            .positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let mut state = self.record(format!("create_order:{}", request.client_order_id));

        if let Some(existing) = state.orders.get(&request.client_order_id) {
            return Ok(existing.clone());
        }
        if let Some(err) = state.queued_create_errors.pop_front() {
            return Err(err);
        }
        if let Some(err) = state.failing_types.get(&request.order_type) {
            return Err(err.clone());
        }

        let fill_price = request.price.unwrap_or(state.price);
        let (status, filled, average) = match request.order_type {
            OrderType::Market => (OrderStatus::Filled, request.quantity, Some(fill_price)),
            _ => (OrderStatus::Open, 0.0, None),
        };
        let ack = OrderAck {
            exchange_order_id: format!("mock-{}", state.next_id),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            status,
            filled_quantity: filled,
            average_price: average,
        };
        state.next_id += 1;
        state.orders.insert(ack.client_order_id.clone(), ack.clone());
        Ok(ack)
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> ExchangeResult<()> {
        let mut state = self.record(format!("cancel_order:{}", client_order_id));
        match state.orders.get_mut(client_order_id) {
            Some(ack) if !ack.status.is_terminal() => {
                ack.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Err(ExchangeError::Rejected {
                code: "-2011".to_string(),
                message: "Order already final".to_string(),
            }),
            None => Err(ExchangeError::Rejected {
                code: "-2011".to_string(),
                message: "Unknown order sent".to_string(),
            }),
        }
    }

    async fn get_order(
        &self,
        _symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<OrderAck>> {
        let state = self.record(format!("get_order:{}", client_order_id));
        Ok(state.orders.get(client_order_id).cloned())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderAck>> {
        let state = self.record("open_orders".to_string());
        Ok(state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn exchange_info(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let state = self.record(format!("exchange_info:{}", symbol));
        state
            .rules
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Validation(format!("unknown symbol {}", symbol)))
    }

    async fn ticker_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let state = self.record(format!("ticker_price:{}", symbol));
        Ok(state.price)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let _state = self.record(format!("set_leverage:{}:{}", symbol, leverage));
        Ok(())
    }
}

/// Hands out one shared [`MockExchangeClient`] for every account
pub struct MockClientProvider {
    client: Arc<MockExchangeClient>,
    built: AtomicUsize,
    failure: Mutex<Option<ExchangeError>>,
}

impl MockClientProvider {
    pub fn new(client: Arc<MockExchangeClient>) -> Self {
        Self {
            client,
            built: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, error: ExchangeError) {
        *self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    /// Number of clients built so far
    pub fn built(&self) -> usize {
        self.built.load(Ordering::SeqCst)
    }
}

impl ExchangeClientProvider for MockClientProvider {
    fn client(
        &self,
        _exchange: Exchange,
        _environment: Environment,
        credentials: ApiCredentials,
    ) -> ExchangeResult<Arc<dyn ExchangeClient>> {
        if let Some(err) = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            return Err(err);
        }
        if credentials.api_key != TEST_API_KEY || credentials.api_secret.as_str() != TEST_API_SECRET
        {
            return Err(ExchangeError::Auth("unexpected credentials".to_string()));
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

pub fn test_vault() -> Arc<CredentialVault> {
    match CredentialVault::new(&TEST_MASTER_KEY, Duration::from_secs(300), 16) {
        Ok(vault) => Arc::new(vault),
        Err(e) => unreachable!("fixed test key is valid: {}", e),
    }
}

pub async fn seed_webhook(
    store: &dyn Store,
    user_id: i64,
    url_path: &str,
    secret: Option<&str>,
) -> DispatchResult<Webhook> {
    Ok(store
        .create_webhook(&Webhook::new(user_id, "test", url_path, secret))
        .await?)
}

/// Create an account whose credentials are encrypted under its assigned id
pub async fn seed_account(
    store: &dyn Store,
    vault: &CredentialVault,
    user_id: i64,
    exchange: Exchange,
    health: HealthStatus,
) -> DispatchResult<ExchangeAccount> {
    let mut account = store
        .create_account(&ExchangeAccount::new(
            user_id,
            &format!("{}-{}", exchange, user_id),
            exchange,
            Environment::Testnet,
            String::new(),
            String::new(),
        ))
        .await?;

    let context = account.credential_context();
    account.api_key_encrypted = vault.encrypt(TEST_API_KEY, &context)?;
    account.api_secret_encrypted = vault.encrypt(TEST_API_SECRET, &context)?;
    account.available_balance = 8_000.0;
    account.record_health(health, None, chrono::Utc::now());
    store.update_account(&account).await?;

    store
        .get_account(account.id)
        .await?
        .ok_or_else(|| DispatchError::InternalFailure("seeded account vanished".to_string()))
}

/// The dispatch core wired against an in-memory store and one mock exchange
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub vault: Arc<CredentialVault>,
    pub cache: Arc<PositionsCache>,
    pub exchange: Arc<MockExchangeClient>,
    pub provider: Arc<MockClientProvider>,
    pub orchestrator: Arc<Orchestrator>,
    pub pipeline: Arc<WebhookPipeline>,
}

impl Harness {
    pub fn new(exchange: Exchange, config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let vault = test_vault();
        let cache = Arc::new(PositionsCache::default());
        let mock = Arc::new(MockExchangeClient::new(exchange));
        let provider = Arc::new(MockClientProvider::new(mock.clone()));

        let dispatcher: Arc<dyn TaskHandler> = Arc::new(OrderDispatcher::new(
            store.clone(),
            AccountSelector::new(store.clone(), SelectionPolicy::default()),
            vault.clone(),
            provider.clone(),
            cache.clone(),
        ));
        let health: Arc<dyn TaskHandler> =
            Arc::new(HealthChecker::new(store.clone(), vault.clone(), provider.clone()));
        let registry = HandlerRegistry::new()
            .with(TaskKind::ProcessWebhook { delivery_id: 0 }.name(), dispatcher.clone())
            .with(TaskKind::ExecuteOrder { order_id: 0 }.name(), dispatcher)
            .with(TaskKind::HealthCheck { account_id: 0 }.name(), health);
        let maintenance: Arc<dyn TaskHandler> =
            Arc::new(Maintenance::new(store.clone(), registry.clone()));
        let registry = registry
            .with(TaskKind::PurgeDeliveries { older_than_days: 0 }.name(), maintenance.clone())
            .with(TaskKind::ReclaimLeases.name(), maintenance);

        let orchestrator = Arc::new(Orchestrator::new(store.clone(), registry, config));
        let pipeline = Arc::new(WebhookPipeline::new(
            store.clone(),
            orchestrator.clone(),
            PipelineConfig::default(),
        ));

        Self {
            store,
            vault,
            cache,
            exchange: mock,
            provider,
            orchestrator,
            pipeline,
        }
    }

    /// Webhook retries run as soon as they are scheduled
    pub fn without_backoff(exchange: Exchange) -> Self {
        let mut config = OrchestratorConfig::default();
        for lane in Lane::all() {
            let mut policy = LanePolicy::defaults(lane);
            policy.backoff = Backoff::Fixed(Duration::ZERO);
            config.lanes.set(lane, policy);
        }
        Self::new(exchange, config)
    }

    /// Run due tasks of `lane` until none is left; returns how many ran
    pub async fn drain(&self, lane: Lane) -> DispatchResult<usize> {
        let mut ran = 0;
        while self.orchestrator.run_once(lane, "test-worker").await?.is_some() {
            ran += 1;
        }
        Ok(ran)
    }

    /// Submit `payload` to `url_path`, signed with `secret` when given
    pub async fn send(
        &self,
        url_path: &str,
        payload: &Value,
        secret: Option<&str>,
    ) -> DispatchResult<DeliveryResult> {
        let signature = match secret {
            Some(secret) => {
                Some(compute_signature(secret, payload).map_err(DispatchError::InternalFailure)?)
            }
            None => None,
        };
        self.pipeline
            .receive(
                url_path,
                payload.to_string().as_bytes(),
                Value::Object(Default::default()),
                signature.as_deref(),
            )
            .await
    }
}
