//! Canonical trading signal and the request derived from it

use serde::{Deserialize, Serialize};

use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::entities::order::{OrderSide, OrderType};
use crate::domain::entities::webhook::Webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    /// Flatten any open position on the symbol
    Close,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Close => "close",
        }
    }

    pub fn side(&self) -> Option<OrderSide> {
        match self {
            SignalAction::Buy => Some(OrderSide::Buy),
            SignalAction::Sell => Some(OrderSide::Sell),
            SignalAction::Close => None,
        }
    }
}

/// Stop-loss / take-profit level, absolute or relative to the entry price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ProtectiveLevel {
    Price(f64),
    /// Distance from the entry in percent (2.0 = 2%)
    Percent(f64),
}

impl ProtectiveLevel {
    /// Trigger price of a stop-loss for a position opened on `entry_side`
    pub fn stop_loss_price(&self, entry_side: OrderSide, entry_price: f64) -> f64 {
        match *self {
            ProtectiveLevel::Price(p) => p,
            ProtectiveLevel::Percent(pct) => match entry_side {
                OrderSide::Buy => entry_price * (1.0 - pct / 100.0),
                OrderSide::Sell => entry_price * (1.0 + pct / 100.0),
            },
        }
    }

    /// Trigger price of a take-profit for a position opened on `entry_side`
    pub fn take_profit_price(&self, entry_side: OrderSide, entry_price: f64) -> f64 {
        match *self {
            ProtectiveLevel::Price(p) => p,
            ProtectiveLevel::Percent(pct) => match entry_side {
                OrderSide::Buy => entry_price * (1.0 + pct / 100.0),
                OrderSide::Sell => entry_price * (1.0 - pct / 100.0),
            },
        }
    }
}

/// Alert payload after vocabulary normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub symbol: String,
    pub action: SignalAction,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub order_type: OrderType,
    pub leverage: Option<u32>,
    /// Margin in quote currency, used when no quantity is given
    pub margin: Option<f64>,
    pub stop_loss: Option<ProtectiveLevel>,
    pub take_profit: Option<ProtectiveLevel>,
    pub exchange: Option<Exchange>,
    pub environment: Option<Environment>,
    pub alert_id: Option<String>,
}

/// How the entry quantity is determined
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Sizing {
    Quantity(f64),
    /// quantity = margin * leverage / price
    Margin { margin: f64, leverage: u32 },
}

/// Fully resolved request handed to account selection and order placement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingRequest {
    pub user_id: i64,
    pub symbol: String,
    pub action: SignalAction,
    pub order_type: OrderType,
    pub sizing: Option<Sizing>,
    pub price: Option<f64>,
    pub leverage: Option<u32>,
    pub stop_loss: Option<ProtectiveLevel>,
    pub take_profit: Option<ProtectiveLevel>,
    pub exchange: Option<Exchange>,
    pub environment: Option<Environment>,
}

impl TradingRequest {
    /// Merge a signal with the webhook's defaults. Values from the alert win.
    pub fn from_signal(signal: &TradingSignal, webhook: &Webhook) -> Result<Self, String> {
        let leverage = signal.leverage.or(webhook.default_leverage);

        let sizing = match (signal.quantity, signal.margin.or(webhook.default_margin)) {
            (Some(q), _) if q > 0.0 => Some(Sizing::Quantity(q)),
            (Some(q), _) => return Err(format!("Quantity must be positive, got {}", q)),
            (None, Some(margin)) if margin > 0.0 => Some(Sizing::Margin {
                margin,
                leverage: leverage.unwrap_or(1).max(1),
            }),
            (None, Some(margin)) => {
                return Err(format!("Margin must be positive, got {}", margin))
            }
            (None, None) => None,
        };

        if sizing.is_none() && signal.action != SignalAction::Close {
            return Err("Signal has neither quantity nor margin".to_string());
        }
        if signal.order_type == OrderType::Limit && signal.price.is_none() {
            return Err("Limit signal requires a price".to_string());
        }

        let stop_loss = signal
            .stop_loss
            .or(webhook.default_stop_loss_pct.map(ProtectiveLevel::Percent));
        let take_profit = signal
            .take_profit
            .or(webhook.default_take_profit_pct.map(ProtectiveLevel::Percent));

        Ok(Self {
            user_id: webhook.user_id,
            symbol: signal.symbol.clone(),
            action: signal.action,
            order_type: signal.order_type,
            sizing,
            price: signal.price,
            leverage,
            stop_loss,
            take_profit,
            exchange: signal.exchange.or(webhook.exchange),
            environment: signal.environment.or(webhook.environment),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> TradingSignal {
        TradingSignal {
            symbol: "BTCUSDT".into(),
            action: SignalAction::Buy,
            quantity: Some(0.01),
            price: None,
            order_type: OrderType::Market,
            leverage: None,
            margin: None,
            stop_loss: None,
            take_profit: None,
            exchange: None,
            environment: None,
            alert_id: None,
        }
    }

    #[test]
    fn test_percent_levels_for_long_and_short() {
        let sl = ProtectiveLevel::Percent(2.0);
        let tp = ProtectiveLevel::Percent(4.0);
        assert!((sl.stop_loss_price(OrderSide::Buy, 100.0) - 98.0).abs() < 1e-9);
        assert!((tp.take_profit_price(OrderSide::Buy, 100.0) - 104.0).abs() < 1e-9);
        assert!((sl.stop_loss_price(OrderSide::Sell, 100.0) - 102.0).abs() < 1e-9);
        assert!((tp.take_profit_price(OrderSide::Sell, 100.0) - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_webhook_defaults_fill_gaps() {
        let mut webhook = Webhook::new(9, "tv", "p", None);
        webhook.default_stop_loss_pct = Some(1.5);
        webhook.default_leverage = Some(5);
        webhook.exchange = Some(Exchange::Bybit);

        let request = TradingRequest::from_signal(&signal(), &webhook).unwrap();
        assert_eq!(request.user_id, 9);
        assert_eq!(request.stop_loss, Some(ProtectiveLevel::Percent(1.5)));
        assert_eq!(request.take_profit, None);
        assert_eq!(request.leverage, Some(5));
        assert_eq!(request.exchange, Some(Exchange::Bybit));
        assert_eq!(request.sizing, Some(Sizing::Quantity(0.01)));
    }

    #[test]
    fn test_alert_values_override_defaults() {
        let mut webhook = Webhook::new(9, "tv", "p", None);
        webhook.default_stop_loss_pct = Some(1.5);
        let mut s = signal();
        s.stop_loss = Some(ProtectiveLevel::Price(25_000.0));

        let request = TradingRequest::from_signal(&s, &webhook).unwrap();
        assert_eq!(request.stop_loss, Some(ProtectiveLevel::Price(25_000.0)));
    }

    #[test]
    fn test_margin_sizing_from_default() {
        let mut webhook = Webhook::new(9, "tv", "p", None);
        webhook.default_margin = Some(50.0);
        webhook.default_leverage = Some(10);
        let mut s = signal();
        s.quantity = None;

        let request = TradingRequest::from_signal(&s, &webhook).unwrap();
        assert_eq!(
            request.sizing,
            Some(Sizing::Margin {
                margin: 50.0,
                leverage: 10
            })
        );
    }

    #[test]
    fn test_missing_size_is_rejected_except_close() {
        let webhook = Webhook::new(9, "tv", "p", None);
        let mut s = signal();
        s.quantity = None;
        assert!(TradingRequest::from_signal(&s, &webhook).is_err());

        s.action = SignalAction::Close;
        assert!(TradingRequest::from_signal(&s, &webhook).is_ok());
    }
}
