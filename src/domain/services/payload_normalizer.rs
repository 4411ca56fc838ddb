//! Alert payload normalization
//!
//! Signal sources disagree on vocabulary: `ticker` vs `symbol`, `qty` vs `size`,
//! "comprar" vs "buy", flat fields vs nested `position` / `risk_management`
//! objects, numbers sent as strings. Everything is mapped onto one
//! [`TradingSignal`] before a delivery is enqueued.

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::entities::order::OrderType;
use crate::domain::entities::signal::{ProtectiveLevel, SignalAction, TradingSignal};
use crate::domain::errors::DispatchError;

const SYMBOL_KEYS: &[&str] = &["symbol", "ticker", "pair", "instrument", "market", "coin"];
const ACTION_KEYS: &[&str] = &["action", "side", "signal", "order_action", "direction"];
const QUANTITY_KEYS: &[&str] = &["quantity", "qty", "size", "amount", "contracts"];
const PRICE_KEYS: &[&str] = &["price", "entry_price", "entry", "limit_price"];
const ORDER_TYPE_KEYS: &[&str] = &["order_type", "orderType", "type"];
const LEVERAGE_KEYS: &[&str] = &["leverage", "lev"];
const MARGIN_KEYS: &[&str] = &["margin", "margin_usd", "amount_usd", "investment"];
const SL_PRICE_KEYS: &[&str] = &["stop_loss", "stopLoss", "sl", "stop_loss_price"];
const SL_PERCENT_KEYS: &[&str] = &["stop_loss_pct", "stop_loss_percent", "sl_pct", "sl_percent"];
const TP_PRICE_KEYS: &[&str] = &["take_profit", "takeProfit", "tp", "take_profit_price"];
const TP_PERCENT_KEYS: &[&str] = &[
    "take_profit_pct",
    "take_profit_percent",
    "tp_pct",
    "tp_percent",
];
const ALERT_ID_KEYS: &[&str] = &["alert_id", "alertId", "signal_id", "id"];

/// Action verbs in English, Spanish, Portuguese, French and German
static ACTION_VERBS: Lazy<HashMap<&'static str, SignalAction>> = Lazy::new(|| {
    let mut verbs = HashMap::new();
    for verb in [
        "buy", "long", "enter_long", "open_long", // en
        "comprar", "compra", "largo", // es / pt
        "acheter", "achat", // fr
        "kaufen", "kauf", // de
    ] {
        verbs.insert(verb, SignalAction::Buy);
    }
    for verb in [
        "sell", "short", "enter_short", "open_short", // en
        "vender", "venta", "venda", "corto", // es / pt
        "vendre", "vente", // fr
        "verkaufen", "verkauf", // de
    ] {
        verbs.insert(verb, SignalAction::Sell);
    }
    for verb in [
        "close", "exit", "flat", "close_all", "close_long", "close_short", "exit_long",
        "exit_short", // en
        "cerrar", "salir", // es
        "fechar", "sair", // pt
        "fermer", "sortir", // fr
        "schließen", "schliessen", "glattstellen", // de
    ] {
        verbs.insert(verb, SignalAction::Close);
    }
    verbs
});

/// Parse an action verb in any supported language
pub fn parse_action(raw: &str) -> Option<SignalAction> {
    let key = raw.trim().to_lowercase().replace(|c: char| c == ' ' || c == '-', "_");
    ACTION_VERBS.get(key.as_str()).copied()
}

/// Strip TradingView decorations: `BINANCE:BTCUSDT.P` -> `BTCUSDT`
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let mut symbol = raw.trim();
    if let Some((_, rest)) = symbol.rsplit_once(':') {
        symbol = rest;
    }
    let mut symbol = symbol.to_uppercase();
    for suffix in [".P", ".PERP", "PERP"] {
        if symbol.len() > suffix.len() && symbol.ends_with(suffix) {
            symbol.truncate(symbol.len() - suffix.len());
            break;
        }
    }
    symbol.retain(|c| c != '/' && c != '-' && c != '_');
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(symbol)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flat fields first, then the nested `position` and `risk_management` objects
struct Fields<'a> {
    scopes: Vec<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn new(root: &'a Map<String, Value>) -> Self {
        let mut scopes = vec![root];
        for nested in ["position", "risk_management", "riskManagement", "order"] {
            if let Some(Value::Object(obj)) = root.get(nested) {
                scopes.push(obj);
            }
        }
        Self { scopes }
    }

    fn find(&self, keys: &[&str]) -> Option<&'a Value> {
        self.scopes.iter().find_map(|scope| {
            keys.iter()
                .find_map(|k| scope.get(*k).filter(|v| !v.is_null() && !v.is_object()))
        })
    }

    fn text(&self, keys: &[&str]) -> Option<String> {
        self.find(keys).and_then(as_text)
    }

    fn number(&self, keys: &[&str], label: &str) -> Result<Option<f64>, DispatchError> {
        match self.find(keys) {
            None => Ok(None),
            Some(v) => as_number(v).map(Some).ok_or_else(|| {
                DispatchError::ValidationFailure(format!("{} is not a number: {}", label, v))
            }),
        }
    }
}

/// A level given as `"2%"` is relative, a plain number is an absolute price
fn protective_level(
    fields: &Fields<'_>,
    price_keys: &[&str],
    percent_keys: &[&str],
    label: &str,
) -> Result<Option<ProtectiveLevel>, DispatchError> {
    if let Some(pct) = fields.number(percent_keys, label)? {
        return positive(pct, label).map(|p| Some(ProtectiveLevel::Percent(p)));
    }
    match fields.find(price_keys) {
        None => Ok(None),
        Some(value) => {
            let is_percent = matches!(value, Value::String(s) if s.trim().ends_with('%'));
            let number = as_number(value).ok_or_else(|| {
                DispatchError::ValidationFailure(format!("{} is not a number: {}", label, value))
            })?;
            let number = positive(number, label)?;
            Ok(Some(if is_percent {
                ProtectiveLevel::Percent(number)
            } else {
                ProtectiveLevel::Price(number)
            }))
        }
    }
}

fn positive(value: f64, label: &str) -> Result<f64, DispatchError> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(DispatchError::ValidationFailure(format!(
            "{} must be positive, got {}",
            label, value
        )))
    }
}

/// Map an alert payload onto a canonical trading signal
pub fn normalize(payload: &Value) -> Result<TradingSignal, DispatchError> {
    let root = payload.as_object().ok_or_else(|| {
        DispatchError::ValidationFailure("Alert payload must be a JSON object".to_string())
    })?;
    let fields = Fields::new(root);

    let raw_symbol = fields
        .text(SYMBOL_KEYS)
        .ok_or_else(|| DispatchError::ValidationFailure("Missing symbol".to_string()))?;
    let symbol = normalize_symbol(&raw_symbol).ok_or_else(|| {
        DispatchError::ValidationFailure(format!("Invalid symbol: {}", raw_symbol))
    })?;

    let raw_action = fields
        .text(ACTION_KEYS)
        .ok_or_else(|| DispatchError::ValidationFailure("Missing action".to_string()))?;
    let action = parse_action(&raw_action).ok_or_else(|| {
        DispatchError::ValidationFailure(format!("Unknown action: {}", raw_action))
    })?;

    let quantity = fields
        .number(QUANTITY_KEYS, "quantity")?
        .map(|q| positive(q, "quantity"))
        .transpose()?;
    let price = fields
        .number(PRICE_KEYS, "price")?
        .map(|p| positive(p, "price"))
        .transpose()?;
    let margin = fields
        .number(MARGIN_KEYS, "margin")?
        .map(|m| positive(m, "margin"))
        .transpose()?;

    let leverage = match fields.number(LEVERAGE_KEYS, "leverage")? {
        None => None,
        Some(l) if (1.0..=125.0).contains(&l) => Some(l.round() as u32),
        Some(l) => {
            return Err(DispatchError::ValidationFailure(format!(
                "Leverage out of range: {}",
                l
            )))
        }
    };

    let order_type = match fields.text(ORDER_TYPE_KEYS).map(|t| t.to_lowercase()) {
        Some(t) if t == "limit" => OrderType::Limit,
        Some(t) if t == "market" => OrderType::Market,
        Some(other) => {
            return Err(DispatchError::ValidationFailure(format!(
                "Unsupported order type: {}",
                other
            )))
        }
        None => OrderType::Market,
    };
    if order_type == OrderType::Limit && price.is_none() {
        return Err(DispatchError::ValidationFailure(
            "Limit order requires a price".to_string(),
        ));
    }

    let stop_loss = protective_level(&fields, SL_PRICE_KEYS, SL_PERCENT_KEYS, "stop_loss")?;
    let take_profit = protective_level(&fields, TP_PRICE_KEYS, TP_PERCENT_KEYS, "take_profit")?;

    let exchange = match fields.text(&["exchange"]) {
        Some(raw) => Some(raw.parse::<Exchange>().map_err(DispatchError::ValidationFailure)?),
        None => None,
    };

    let environment = match fields.text(&["environment", "env", "mode"]) {
        Some(raw) => Some(
            raw.parse::<Environment>()
                .map_err(DispatchError::ValidationFailure)?,
        ),
        None => match root.get("testnet") {
            Some(Value::Bool(true)) => Some(Environment::Testnet),
            Some(Value::Bool(false)) => Some(Environment::Mainnet),
            _ => None,
        },
    };

    Ok(TradingSignal {
        symbol,
        action,
        quantity,
        price,
        order_type,
        leverage,
        margin,
        stop_loss,
        take_profit,
        exchange,
        environment,
        alert_id: extract_alert_id(payload),
    })
}

/// Explicit alert id from the payload, if the source sent one
pub fn extract_alert_id(payload: &Value) -> Option<String> {
    let root = payload.as_object()?;
    ALERT_ID_KEYS
        .iter()
        .find_map(|k| root.get(*k).and_then(as_text))
}
