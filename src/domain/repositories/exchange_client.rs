//! Exchange Client Trait
//!
//! This module defines the `ExchangeClient` trait, the common interface over the
//! exchange wire protocols. The dispatcher only talks to exchanges through it, so
//! adding an exchange means one new implementation plus a factory entry.
//!
//! All calls return [`ExchangeError`], a small taxonomy the dispatcher maps into
//! retry decisions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType};
use crate::domain::value_objects::symbol_rules::SymbolRules;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur during exchange operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    /// Credentials missing, invalid or lacking permissions
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Request failed local or exchange-side parameter checks
    #[error("Invalid order: {0}")]
    Validation(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Network failure, timeout or exchange-side outage
    #[error("Exchange unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited(_) | ExchangeError::Unavailable(_)
        )
    }

    /// Exchange error code, when the exchange supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            ExchangeError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
    /// Post-only
    Gtx,
}

/// Order as submitted to an exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: bool,
    /// Close the whole position when triggered (conditional orders only)
    pub close_position: bool,
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, quantity: f64, client_order_id: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: false,
            close_position: false,
            client_order_id: client_order_id.to_string(),
        }
    }

    pub fn limit(
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        client_order_id: &str,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            ..Self::market(symbol, side, quantity, client_order_id)
        }
    }

    /// Native stop-loss or take-profit trigger order, reduce-only
    pub fn conditional(
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        quantity: f64,
        stop_price: f64,
        client_order_id: &str,
    ) -> Self {
        Self {
            order_type,
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::market(symbol, side, quantity, client_order_id)
        }
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Exchange view of an order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: OrderStatus,
    /// Cumulative executed quantity
    pub filled_quantity: f64,
    pub average_price: Option<f64>,
}

/// Account balance information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub available: f64,
    pub total: f64,
}

/// Open position on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    /// `Buy` for long, `Sell` for short
    pub side: OrderSide,
    /// Absolute size
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub leverage: Option<u32>,
}

impl PositionInfo {
    pub fn notional(&self) -> f64 {
        self.quantity * self.mark_price.unwrap_or(self.entry_price)
    }
}

/// Account-level summary used by health checks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountInfo {
    pub can_trade: bool,
    pub total_balance: f64,
    pub available_balance: f64,
    pub unrealized_pnl: f64,
}

/// Decrypted API credentials. Only lives for the duration of a dispatch.
#[derive(Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub api_secret: Zeroizing<String>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl ApiCredentials {
    pub fn new(api_key: &str, api_secret: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            api_secret: Zeroizing::new(api_secret.to_string()),
            passphrase: None,
        }
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Exchange client trait providing common interface for all exchanges
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Verify connectivity and that the credentials are accepted
    async fn connect(&self) -> ExchangeResult<()>;

    async fn account_info(&self) -> ExchangeResult<AccountInfo>;

    async fn balances(&self) -> ExchangeResult<Vec<Balance>>;

    /// Open positions, optionally filtered by symbol
    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>>;

    /// Place an order. `request.client_order_id` is mandatory; submitting an id the
    /// exchange already knows resolves to the existing order.
    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<()>;

    /// Look an order up by client id; `None` when the exchange does not know it
    async fn get_order(
        &self,
        symbol: &str,
        client_order_id: &str,
    ) -> ExchangeResult<Option<OrderAck>>;

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderAck>>;

    /// Trading rules (tick/step size, minimums) for a symbol
    async fn exchange_info(&self, symbol: &str) -> ExchangeResult<SymbolRules>;

    async fn ticker_price(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;
}

/// Builds exchange clients for an account's exchange, environment and credentials
pub trait ExchangeClientProvider: Send + Sync {
    fn client(
        &self,
        exchange: Exchange,
        environment: Environment,
        credentials: ApiCredentials,
    ) -> ExchangeResult<Arc<dyn ExchangeClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_error_display() {
        let error = ExchangeError::Rejected {
            code: "-2019".to_string(),
            message: "Margin is insufficient".to_string(),
        };
        assert_eq!(error.to_string(), "Rejected (-2019): Margin is insufficient");
        assert_eq!(error.code(), Some("-2019"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(ExchangeError::Unavailable("timeout".into()).is_retryable());
        assert!(ExchangeError::RateLimited("429".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::Validation("qty".into()).is_retryable());
    }

    #[test]
    fn test_conditional_request_is_reduce_only() {
        let req = OrderRequest::conditional(
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::StopMarket,
            0.01,
            29_000.0,
            "wh1-sl",
        );
        assert!(req.reduce_only);
        assert_eq!(req.stop_price, Some(29_000.0));
        assert_eq!(req.price, None);
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = ApiCredentials::new("key-123", "secret-456");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("key-123"));
        assert!(!debug.contains("secret-456"));
    }

    #[test]
    fn test_position_notional_prefers_mark() {
        let pos = PositionInfo {
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            quantity: 0.5,
            entry_price: 100.0,
            mark_price: Some(110.0),
            unrealized_pnl: 5.0,
            leverage: Some(3),
        };
        assert_eq!(pos.notional(), 55.0);
    }
}
