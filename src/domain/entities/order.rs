use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::domain::entities::exchange::Exchange;

/// Relative tolerance used when comparing filled and ordered quantities
const FILL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(format!("Unknown order side: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::StopMarket => "stop_market",
            OrderType::TakeProfitMarket => "take_profit_market",
        }
    }

    pub fn is_conditional(&self) -> bool {
        matches!(self, OrderType::StopMarket | OrderType::TakeProfitMarket)
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop_market" => Ok(OrderType::StopMarket),
            "take_profit_market" => Ok(OrderType::TakeProfitMarket),
            other => Err(format!("Unknown order type: {}", other)),
        }
    }
}

/// Why an order exists within a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
    Close,
}

impl OrderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderRole::Entry => "entry",
            OrderRole::StopLoss => "stop_loss",
            OrderRole::TakeProfit => "take_profit",
            OrderRole::Close => "close",
        }
    }

    /// Short tag used inside client order ids
    pub fn tag(&self) -> &'static str {
        match self {
            OrderRole::Entry => "e",
            OrderRole::StopLoss => "sl",
            OrderRole::TakeProfit => "tp",
            OrderRole::Close => "x",
        }
    }
}

impl FromStr for OrderRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(OrderRole::Entry),
            "stop_loss" => Ok(OrderRole::StopLoss),
            "take_profit" => Ok(OrderRole::TakeProfit),
            "close" => Ok(OrderRole::Close),
            other => Err(format!("Unknown order role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::Failed
        )
    }

    /// True once the exchange has acknowledged the order in any way
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, OrderStatus::Pending | OrderStatus::Failed)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Submitted)
                | (Pending, Rejected)
                | (Pending, Failed)
                | (Submitted, Open)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Rejected)
                | (Submitted, Failed)
                | (Submitted, Canceled)
                | (Submitted, Expired)
                | (Open, PartiallyFilled)
                | (Open, Filled)
                | (Open, Canceled)
                | (Open, Expired)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Canceled)
                | (PartiallyFilled, Expired)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "submitted" => Ok(OrderStatus::Submitted),
            "open" => Ok(OrderStatus::Open),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "canceled" => Ok(OrderStatus::Canceled),
            "rejected" => Ok(OrderStatus::Rejected),
            "expired" => Ok(OrderStatus::Expired),
            "failed" => Ok(OrderStatus::Failed),
            other => Err(format!("Unknown order status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderTransitionError {
    #[error("Invalid order transition: {from} -> {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Invalid fill: {0}")]
    InvalidFill(String),

    #[error("Failure transition to {0} requires a reason")]
    MissingReason(OrderStatus),
}

/// One exchange order instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub account_id: i64,
    pub webhook_delivery_id: Option<i64>,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub exchange: Exchange,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub role: OrderRole,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub reduce_only: bool,
    pub filled_quantity: f64,
    pub filled_notional: f64,
    pub average_fill_price: Option<f64>,
    pub status: OrderStatus,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub exchange_error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: i64,
        account_id: i64,
        exchange: Exchange,
        client_order_id: String,
        symbol: String,
        side: OrderSide,
        order_type: OrderType,
        role: OrderRole,
        quantity: f64,
        price: Option<f64>,
    ) -> Result<Self, String> {
        if !quantity.is_finite() || quantity < 0.0 {
            return Err("Quantity must be non-negative".to_string());
        }
        if matches!(order_type, OrderType::Limit) && price.is_none() {
            return Err("Limit orders must have a price".to_string());
        }

        let now = Utc::now();
        Ok(Order {
            id: 0,
            user_id,
            account_id,
            webhook_delivery_id: None,
            client_order_id,
            exchange_order_id: None,
            exchange,
            symbol,
            side,
            order_type,
            role,
            quantity,
            price,
            stop_price: None,
            reduce_only: false,
            filled_quantity: 0.0,
            filled_notional: 0.0,
            average_fill_price: None,
            status: OrderStatus::Pending,
            retry_count: 0,
            failure_reason: None,
            exchange_error_code: None,
            created_at: now,
            submitted_at: None,
            updated_at: now,
        })
    }

    pub fn remaining_quantity(&self) -> f64 {
        (self.quantity - self.filled_quantity).max(0.0)
    }

    /// Move to a non-failure status along the state machine
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), OrderTransitionError> {
        if matches!(next, OrderStatus::Rejected | OrderStatus::Failed) {
            return Err(OrderTransitionError::MissingReason(next));
        }
        self.move_to(next)?;
        if next == OrderStatus::Submitted {
            self.submitted_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Terminal failure path (`rejected` or `failed`), always with a reason
    pub fn fail(
        &mut self,
        status: OrderStatus,
        reason: &str,
        exchange_code: Option<&str>,
    ) -> Result<(), OrderTransitionError> {
        if !matches!(status, OrderStatus::Rejected | OrderStatus::Failed) {
            return Err(OrderTransitionError::InvalidTransition {
                from: self.status,
                to: status,
            });
        }
        if reason.trim().is_empty() {
            return Err(OrderTransitionError::MissingReason(status));
        }
        self.move_to(status)?;
        self.failure_reason = Some(reason.to_string());
        self.exchange_error_code = exchange_code.map(|c| c.to_string());
        Ok(())
    }

    /// Apply an execution. Fills are additive; the quantity beyond what remains
    /// is clamped. Returns the quantity actually applied.
    pub fn apply_fill(&mut self, quantity: f64, price: f64) -> Result<f64, OrderTransitionError> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(OrderTransitionError::InvalidFill(format!(
                "fill quantity must be positive, got {}",
                quantity
            )));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(OrderTransitionError::InvalidFill(format!(
                "fill price must be positive, got {}",
                price
            )));
        }
        if !matches!(
            self.status,
            OrderStatus::Submitted | OrderStatus::Open | OrderStatus::PartiallyFilled
        ) {
            return Err(OrderTransitionError::InvalidTransition {
                from: self.status,
                to: OrderStatus::PartiallyFilled,
            });
        }

        let applied = quantity.min(self.remaining_quantity());
        if applied <= 0.0 {
            return Err(OrderTransitionError::InvalidFill(
                "order has no remaining quantity".to_string(),
            ));
        }

        self.filled_quantity += applied;
        self.filled_notional += applied * price;

        let tolerance = FILL_EPSILON * self.quantity.max(1.0);
        let next = if self.quantity - self.filled_quantity <= tolerance {
            self.filled_quantity = self.quantity;
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        self.average_fill_price = Some(self.filled_notional / self.filled_quantity);
        self.move_to(next)?;

        Ok(applied)
    }

    /// Bring the local record in line with the exchange's view of the order.
    /// `cumulative_filled` is the total executed quantity reported by the exchange.
    pub fn reconcile(
        &mut self,
        exchange_status: OrderStatus,
        cumulative_filled: f64,
        average_price: Option<f64>,
    ) -> Result<(), OrderTransitionError> {
        if self.status.is_terminal() {
            return Ok(());
        }
        if self.status == OrderStatus::Pending {
            self.transition(OrderStatus::Submitted)?;
        }

        let delta = cumulative_filled - self.filled_quantity;
        if delta > FILL_EPSILON * self.quantity.max(1.0) {
            if let Some(avg) = average_price.filter(|p| *p > 0.0) {
                // Price of the new slice from the cumulative average
                let slice_price = (avg * cumulative_filled - self.filled_notional) / delta;
                let price = if slice_price.is_finite() && slice_price > 0.0 {
                    slice_price
                } else {
                    avg
                };
                self.apply_fill(delta, price)?;
            }
        }

        match exchange_status {
            OrderStatus::Open if self.status == OrderStatus::Submitted => {
                self.transition(OrderStatus::Open)
            }
            OrderStatus::Filled if !self.status.is_terminal() => {
                self.transition(OrderStatus::Filled)
            }
            OrderStatus::Canceled | OrderStatus::Expired if !self.status.is_terminal() => {
                self.transition(exchange_status)
            }
            OrderStatus::Rejected if !self.status.is_terminal() => {
                self.fail(OrderStatus::Rejected, "Rejected by exchange", None)
            }
            _ => Ok(()),
        }
    }

    fn move_to(&mut self, next: OrderStatus) -> Result<(), OrderTransitionError> {
        if self.status == next && next != OrderStatus::PartiallyFilled {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(OrderTransitionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_buy(quantity: f64) -> Order {
        Order::new(
            1,
            1,
            Exchange::Binance,
            "wh1-e".to_string(),
            "BTCUSDT".to_string(),
            OrderSide::Buy,
            OrderType::Market,
            OrderRole::Entry,
            quantity,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_order_new_limit_without_price() {
        let order = Order::new(
            1,
            1,
            Exchange::Binance,
            "c".to_string(),
            "BTCUSDT".to_string(),
            OrderSide::Buy,
            OrderType::Limit,
            OrderRole::Entry,
            1.0,
            None,
        );
        assert_eq!(order.unwrap_err(), "Limit orders must have a price");
    }

    #[test]
    fn test_order_new_negative_quantity() {
        let order = Order::new(
            1,
            1,
            Exchange::Binance,
            "c".to_string(),
            "BTCUSDT".to_string(),
            OrderSide::Buy,
            OrderType::Market,
            OrderRole::Entry,
            -1.0,
            None,
        );
        assert_eq!(order.unwrap_err(), "Quantity must be non-negative");
    }

    #[test]
    fn test_partial_then_full_fill() {
        let mut order = market_buy(1.0);
        order.transition(OrderStatus::Submitted).unwrap();
        order.transition(OrderStatus::Open).unwrap();

        order.apply_fill(0.4, 100.0).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);

        order.apply_fill(0.6, 110.0).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, 1.0);
        let avg = order.average_fill_price.unwrap();
        assert!((avg - 106.0).abs() < 1e-9);
    }

    #[test]
    fn test_overfill_is_clamped() {
        let mut order = market_buy(1.0);
        order.transition(OrderStatus::Submitted).unwrap();
        let applied = order.apply_fill(1.5, 100.0).unwrap();
        assert_eq!(applied, 1.0);
        assert_eq!(order.filled_quantity, 1.0);
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.apply_fill(0.1, 100.0).is_err());
    }

    #[test]
    fn test_fill_on_pending_is_rejected() {
        let mut order = market_buy(1.0);
        assert!(order.apply_fill(0.5, 100.0).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut order = market_buy(1.0);
        order.transition(OrderStatus::Submitted).unwrap();
        order.transition(OrderStatus::Filled).unwrap();
        assert!(order.transition(OrderStatus::Canceled).is_err());
        assert!(order
            .fail(OrderStatus::Failed, "late failure", None)
            .is_err());
    }

    #[test]
    fn test_failure_requires_reason() {
        let mut order = market_buy(1.0);
        assert_eq!(
            order.transition(OrderStatus::Rejected),
            Err(OrderTransitionError::MissingReason(OrderStatus::Rejected))
        );
        assert!(order.fail(OrderStatus::Rejected, "  ", None).is_err());

        order
            .fail(OrderStatus::Rejected, "Insufficient margin", Some("-2019"))
            .unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.exchange_error_code.as_deref(), Some("-2019"));
    }

    #[test]
    fn test_reconcile_from_pending_with_cumulative_fills() {
        let mut order = market_buy(1.0);
        order
            .reconcile(OrderStatus::PartiallyFilled, 0.5, Some(100.0))
            .unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert!(order.submitted_at.is_some());

        // Second report: cumulative 1.0 at average 105 means the slice filled at 110
        order.reconcile(OrderStatus::Filled, 1.0, Some(105.0)).unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert!((order.average_fill_price.unwrap() - 105.0).abs() < 1e-9);

        // Late duplicate report is a no-op
        order.reconcile(OrderStatus::Filled, 1.0, Some(105.0)).unwrap();
        assert_eq!(order.filled_quantity, 1.0);
    }

    #[test]
    fn test_reconcile_open_conditional() {
        let mut order = market_buy(1.0);
        order.reconcile(OrderStatus::Open, 0.0, None).unwrap();
        assert_eq!(order.status, OrderStatus::Open);
    }

    #[test]
    fn test_open_cannot_go_back_to_submitted() {
        let mut order = market_buy(1.0);
        order.transition(OrderStatus::Submitted).unwrap();
        order.transition(OrderStatus::Open).unwrap();
        assert!(order.transition(OrderStatus::Submitted).is_err());
    }
}
