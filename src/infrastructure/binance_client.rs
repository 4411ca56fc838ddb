//! Binance USDT-M futures adapter
//!
//! Signed endpoints take the parameters as a query string with `timestamp`
//! and `recvWindow` appended, signed with HMAC-SHA256 (hex) under the API
//! secret. The key travels in `X-MBX-APIKEY`.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::entities::order::{OrderSide, OrderStatus, OrderType};
use crate::domain::repositories::exchange_client::{
    AccountInfo, ApiCredentials, Balance, ExchangeClient, ExchangeError, ExchangeResult, OrderAck,
    OrderRequest, PositionInfo, TimeInForce,
};
use crate::domain::value_objects::symbol_rules::{format_decimal, SymbolRules};
use crate::infrastructure::http::{
    de_f64, encode_query, parse_f64, parse_opt_f64, sign, timestamp_ms, transport_error,
};

const BINANCE_FUTURES_BASE: &str = "https://fapi.binance.com";
const BINANCE_FUTURES_TESTNET_BASE: &str = "https://testnet.binancefuture.com";

/// Binance's "order does not exist" code
const UNKNOWN_ORDER: i64 = -2013;
const DUPLICATE_CLIENT_ID: i64 = -4116;

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub api_base: String,
    pub recv_window_ms: u64,
}

impl BinanceConfig {
    pub fn new(environment: Environment, recv_window_ms: u64) -> Self {
        Self {
            api_base: match environment {
                Environment::Mainnet => BINANCE_FUTURES_BASE.to_string(),
                Environment::Testnet => BINANCE_FUTURES_TESTNET_BASE.to_string(),
            },
            recv_window_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BinanceApiError {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    order_id: i64,
    client_order_id: String,
    symbol: String,
    status: String,
    #[serde(default, deserialize_with = "de_f64")]
    executed_qty: f64,
    #[serde(default, deserialize_with = "de_f64")]
    avg_price: f64,
}

impl BinanceOrder {
    fn into_ack(self) -> OrderAck {
        OrderAck {
            exchange_order_id: self.order_id.to_string(),
            client_order_id: self.client_order_id,
            symbol: self.symbol,
            status: parse_order_status(&self.status),
            filled_quantity: self.executed_qty,
            average_price: (self.avg_price > 0.0).then_some(self.avg_price),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceAccount {
    #[serde(default)]
    can_trade: bool,
    #[serde(default, deserialize_with = "de_f64")]
    total_wallet_balance: f64,
    #[serde(default, deserialize_with = "de_f64")]
    available_balance: f64,
    #[serde(default, deserialize_with = "de_f64")]
    total_unrealized_profit: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceBalance {
    asset: String,
    #[serde(default, deserialize_with = "de_f64")]
    balance: f64,
    #[serde(default, deserialize_with = "de_f64")]
    available_balance: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinancePosition {
    symbol: String,
    position_amt: String,
    entry_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    un_realized_profit: String,
    #[serde(default)]
    leverage: String,
}

#[derive(Debug, Deserialize)]
struct BinanceTicker {
    price: String,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceSymbol>,
}

#[derive(Debug, Deserialize)]
struct BinanceSymbol {
    symbol: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "NEW" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::Submitted,
    }
}

fn order_type_str(order_type: OrderType) -> &'static str {
    match order_type {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopMarket => "STOP_MARKET",
        OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
    }
}

fn time_in_force_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
        TimeInForce::Gtx => "GTX",
    }
}

/// Map a Binance error code (or bare HTTP status) onto the adapter taxonomy
pub fn map_api_error(http_status: u16, code: Option<i64>, message: &str) -> ExchangeError {
    match code {
        Some(-2014) | Some(-2015) | Some(-1022) | Some(-1002) => {
            ExchangeError::Auth(message.to_string())
        }
        Some(-1003) | Some(-1015) => ExchangeError::RateLimited(message.to_string()),
        Some(-1000) | Some(-1001) | Some(-1006) | Some(-1007) | Some(-1008) => {
            ExchangeError::Unavailable(message.to_string())
        }
        Some(c) if (-1199..=-1100).contains(&c) => ExchangeError::Validation(message.to_string()),
        Some(c) => ExchangeError::Rejected {
            code: c.to_string(),
            message: message.to_string(),
        },
        None => match http_status {
            401 | 403 => ExchangeError::Auth(message.to_string()),
            418 | 429 => ExchangeError::RateLimited(message.to_string()),
            s if s >= 500 => ExchangeError::Unavailable(message.to_string()),
            s => ExchangeError::Rejected {
                code: format!("http_{}", s),
                message: message.to_string(),
            },
        },
    }
}

/// Query parameters of a new order, in submission order
pub fn order_params(request: &OrderRequest, rules: Option<&SymbolRules>) -> Vec<(&'static str, String)> {
    let qty_precision = rules.map(|r| r.quantity_precision()).unwrap_or(8);
    let px_precision = rules.map(|r| r.price_precision()).unwrap_or(8);

    let mut params = vec![
        ("symbol", request.symbol.clone()),
        ("side", request.side.to_string()),
        ("type", order_type_str(request.order_type).to_string()),
    ];
    if request.close_position && request.order_type.is_conditional() {
        params.push(("closePosition", "true".to_string()));
    } else {
        params.push(("quantity", format_decimal(request.quantity, qty_precision)));
        if request.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }
    }
    if let Some(price) = request.price {
        params.push(("price", format_decimal(price, px_precision)));
    }
    if let Some(tif) = request.time_in_force {
        params.push(("timeInForce", time_in_force_str(tif).to_string()));
    }
    if let Some(stop) = request.stop_price {
        params.push(("stopPrice", format_decimal(stop, px_precision)));
        params.push(("workingType", "MARK_PRICE".to_string()));
    }
    params.push(("newClientOrderId", request.client_order_id.clone()));
    params.push(("newOrderRespType", "RESULT".to_string()));
    params
}

pub fn parse_symbol_rules(symbol: &str, filters: &[serde_json::Value]) -> SymbolRules {
    let mut rules = SymbolRules {
        symbol: symbol.to_string(),
        tick_size: 0.0,
        step_size: 0.0,
        min_qty: 0.0,
        max_qty: None,
        min_notional: None,
    };
    let field = |f: &serde_json::Value, name: &str| -> f64 {
        f.get(name).and_then(|v| v.as_str()).map(parse_f64).unwrap_or(0.0)
    };
    for filter in filters {
        match filter.get("filterType").and_then(|v| v.as_str()) {
            Some("PRICE_FILTER") => rules.tick_size = field(filter, "tickSize"),
            Some("LOT_SIZE") => {
                rules.step_size = field(filter, "stepSize");
                rules.min_qty = field(filter, "minQty");
                rules.max_qty = Some(field(filter, "maxQty")).filter(|v| *v > 0.0);
            }
            Some("MIN_NOTIONAL") => {
                rules.min_notional = Some(field(filter, "notional")).filter(|v| *v > 0.0);
            }
            _ => {}
        }
    }
    rules
}

pub struct BinanceClient {
    client: Client,
    config: BinanceConfig,
    credentials: ApiCredentials,
}

impl BinanceClient {
    pub fn new(client: Client, config: BinanceConfig, credentials: ApiCredentials) -> Self {
        Self {
            client,
            config,
            credentials,
        }
    }

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> ExchangeResult<T> {
        let query = encode_query(params);
        let url = if query.is_empty() {
            format!("{}{}", self.config.api_base, path)
        } else {
            format!("{}{}?{}", self.config.api_base, path, query)
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;
        Self::decode(path, response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> ExchangeResult<T> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("recvWindow", self.config.recv_window_ms.to_string()));
        all.push(("timestamp", timestamp_ms()?.to_string()));
        let query = encode_query(&all);
        let signature = sign(&self.credentials.api_secret, &query)?;
        let url = format!(
            "{}{}?{}&signature={}",
            self.config.api_base, path, query, signature
        );

        debug!(method = %method, path, "Binance signed request");
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await
            .map_err(|e| transport_error(path, e))?;
        Self::decode(path, response).await
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> ExchangeResult<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(path, e))?;

        if !status.is_success() {
            let parsed: Option<BinanceApiError> = serde_json::from_str(&body).ok();
            return Err(match parsed {
                Some(err) => map_api_error(status.as_u16(), Some(err.code), &err.msg),
                None => map_api_error(status.as_u16(), None, &body),
            });
        }
        serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Unavailable(format!("{}: unexpected response: {}", path, e))
        })
    }
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let _: serde_json::Value = self.public("/fapi/v1/ping", &[]).await?;
        Ok(())
    }

    async fn account_info(&self) -> ExchangeResult<AccountInfo> {
        let account: BinanceAccount = self.signed(Method::GET, "/fapi/v2/account", &[]).await?;
        Ok(AccountInfo {
            can_trade: account.can_trade,
            total_balance: account.total_wallet_balance,
            available_balance: account.available_balance,
            unrealized_pnl: account.total_unrealized_profit,
        })
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        let rows: Vec<BinanceBalance> = self.signed(Method::GET, "/fapi/v2/balance", &[]).await?;
        Ok(rows
            .into_iter()
            .filter(|b| b.balance != 0.0)
            .map(|b| Balance {
                asset: b.asset,
                available: b.available_balance,
                total: b.balance,
            })
            .collect())
    }

    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let rows: Vec<BinancePosition> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|p| {
                let amount = parse_f64(&p.position_amt);
                if amount == 0.0 {
                    return None;
                }
                Some(PositionInfo {
                    symbol: p.symbol,
                    side: if amount > 0.0 { OrderSide::Buy } else { OrderSide::Sell },
                    quantity: amount.abs(),
                    entry_price: parse_f64(&p.entry_price),
                    mark_price: parse_opt_f64(&p.mark_price),
                    unrealized_pnl: parse_f64(&p.un_realized_profit),
                    leverage: p.leverage.parse().ok(),
                })
            })
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        if request.client_order_id.is_empty() {
            return Err(ExchangeError::Validation("client order id is required".into()));
        }
        let params = order_params(request, None);
        match self
            .signed::<BinanceOrder>(Method::POST, "/fapi/v1/order", &params)
            .await
        {
            Ok(order) => {
                info!(
                    symbol = %request.symbol,
                    client_order_id = %request.client_order_id,
                    order_type = order_type_str(request.order_type),
                    "Binance order placed"
                );
                Ok(order.into_ack())
            }
            Err(ExchangeError::Rejected { code, message })
                if code == DUPLICATE_CLIENT_ID.to_string() =>
            {
                debug!(client_order_id = %request.client_order_id, "Duplicate client id, fetching existing order");
                self.get_order(&request.symbol, &request.client_order_id)
                    .await?
                    .ok_or(ExchangeError::Rejected { code, message })
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        let _: BinanceOrder = self.signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<Option<OrderAck>> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("origClientOrderId", client_order_id.to_string()),
        ];
        match self
            .signed::<BinanceOrder>(Method::GET, "/fapi/v1/order", &params)
            .await
        {
            Ok(order) => Ok(Some(order.into_ack())),
            Err(ExchangeError::Rejected { code, .. }) if code == UNKNOWN_ORDER.to_string() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderAck>> {
        let params: Vec<(&str, String)> = symbol
            .map(|s| vec![("symbol", s.to_string())])
            .unwrap_or_default();
        let rows: Vec<BinanceOrder> = self
            .signed(Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        Ok(rows.into_iter().map(BinanceOrder::into_ack).collect())
    }

    async fn exchange_info(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let info: BinanceExchangeInfo = self.public("/fapi/v1/exchangeInfo", &[]).await?;
        info.symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .map(|s| parse_symbol_rules(&s.symbol, &s.filters))
            .ok_or_else(|| ExchangeError::Validation(format!("unknown symbol {}", symbol)))
    }

    async fn ticker_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let ticker: BinanceTicker = self
            .public("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_opt_f64(&ticker.price)
            .ok_or_else(|| ExchangeError::Unavailable(format!("no price for {}", symbol)))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed(Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_per_environment() {
        assert_eq!(
            BinanceConfig::new(Environment::Mainnet, 5000).api_base,
            BINANCE_FUTURES_BASE
        );
        assert_eq!(
            BinanceConfig::new(Environment::Testnet, 5000).api_base,
            BINANCE_FUTURES_TESTNET_BASE
        );
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(map_api_error(401, Some(-2015), "bad key"), ExchangeError::Auth(_)));
        assert!(matches!(map_api_error(429, Some(-1003), "slow"), ExchangeError::RateLimited(_)));
        assert!(matches!(map_api_error(503, None, "down"), ExchangeError::Unavailable(_)));
        assert!(matches!(map_api_error(400, Some(-1111), "precision"), ExchangeError::Validation(_)));
        assert_eq!(
            map_api_error(400, Some(-2019), "margin"),
            ExchangeError::Rejected {
                code: "-2019".into(),
                message: "margin".into()
            }
        );
    }

    #[test]
    fn test_stop_market_params() {
        let request = OrderRequest::conditional(
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::StopMarket,
            0.01,
            49_000.0,
            "wh7-sl",
        );
        let params = order_params(&request, None);
        let get = |k: &str| params.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("type"), Some("STOP_MARKET"));
        assert_eq!(get("stopPrice"), Some("49000"));
        assert_eq!(get("reduceOnly"), Some("true"));
        assert_eq!(get("newClientOrderId"), Some("wh7-sl"));
        assert_eq!(get("price"), None);
    }

    #[test]
    fn test_close_position_omits_quantity() {
        let mut request = OrderRequest::conditional(
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::TakeProfitMarket,
            0.01,
            55_000.0,
            "wh7-tp",
        );
        request.close_position = true;
        let params = order_params(&request, None);
        assert!(params.iter().any(|(k, v)| *k == "closePosition" && v == "true"));
        assert!(!params.iter().any(|(k, _)| *k == "quantity" || *k == "reduceOnly"));
    }

    #[test]
    fn test_symbol_rules_from_filters() {
        let filters = vec![
            json!({"filterType": "PRICE_FILTER", "tickSize": "0.10"}),
            json!({"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"}),
            json!({"filterType": "MIN_NOTIONAL", "notional": "100"}),
        ];
        let rules = parse_symbol_rules("BTCUSDT", &filters);
        assert_eq!(rules.tick_size, 0.1);
        assert_eq!(rules.step_size, 0.001);
        assert_eq!(rules.max_qty, Some(1000.0));
        assert_eq!(rules.min_notional, Some(100.0));
    }

    #[test]
    fn test_order_ack_parsing() {
        let raw = r#"{"orderId": 123, "clientOrderId": "wh1-e", "symbol": "BTCUSDT",
            "status": "PARTIALLY_FILLED", "executedQty": "0.004", "avgPrice": "50000.5"}"#;
        let order: BinanceOrder = serde_json::from_str(raw).unwrap();
        let ack = order.into_ack();
        assert_eq!(ack.exchange_order_id, "123");
        assert_eq!(ack.status, OrderStatus::PartiallyFilled);
        assert_eq!(ack.filled_quantity, 0.004);
        assert_eq!(ack.average_price, Some(50000.5));
    }
}
