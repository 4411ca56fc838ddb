//! Bybit v5 adapter (linear USDT perpetuals)
//!
//! Every response is wrapped as `{retCode, retMsg, result}`; a non-zero
//! `retCode` is an error even on HTTP 200. Signed requests carry
//! `X-BAPI-SIGN = hex(HMAC-SHA256(timestamp + apiKey + recvWindow + payload))`
//! where the payload is the query string for GET and the JSON body for POST.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
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

const BYBIT_BASE: &str = "https://api.bybit.com";
const BYBIT_TESTNET_BASE: &str = "https://api-testnet.bybit.com";

const CATEGORY: &str = "linear";
const SETTLE_COIN: &str = "USDT";

const DUPLICATE_LINK_ID: i64 = 110072;
const LEVERAGE_NOT_MODIFIED: i64 = 110043;
const ORDER_NOT_EXISTS: i64 = 110001;

#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub api_base: String,
    pub recv_window_ms: u64,
}

impl BybitConfig {
    pub fn new(environment: Environment, recv_window_ms: u64) -> Self {
        Self {
            api_base: match environment {
                Environment::Mainnet => BYBIT_BASE.to_string(),
                Environment::Testnet => BYBIT_TESTNET_BASE.to_string(),
            },
            recv_window_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrder {
    order_id: String,
    order_link_id: String,
    symbol: String,
    order_status: String,
    #[serde(default, deserialize_with = "de_f64")]
    cum_exec_qty: f64,
    #[serde(default, deserialize_with = "de_f64")]
    avg_price: f64,
}

impl BybitOrder {
    fn into_ack(self) -> OrderAck {
        OrderAck {
            exchange_order_id: self.order_id,
            client_order_id: self.order_link_id,
            symbol: self.symbol,
            status: parse_order_status(&self.order_status),
            filled_quantity: self.cum_exec_qty,
            average_price: (self.avg_price > 0.0).then_some(self.avg_price),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedOrder {
    order_id: String,
    order_link_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitWallet {
    #[serde(default, deserialize_with = "de_f64")]
    total_wallet_balance: f64,
    #[serde(default, deserialize_with = "de_f64")]
    total_available_balance: f64,
    #[serde(rename = "totalPerpUPL", default, deserialize_with = "de_f64")]
    total_perp_upl: f64,
    #[serde(default)]
    coin: Vec<BybitCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitCoin {
    coin: String,
    #[serde(default, deserialize_with = "de_f64")]
    wallet_balance: f64,
    #[serde(default, deserialize_with = "de_f64")]
    available_to_withdraw: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitPosition {
    symbol: String,
    side: String,
    size: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    leverage: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    last_price: String,
}

fn parse_order_status(status: &str) -> OrderStatus {
    match status {
        "New" | "Untriggered" | "Triggered" => OrderStatus::Open,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "Deactivated" | "PartiallyFilledCanceled" => OrderStatus::Canceled,
        "Rejected" => OrderStatus::Rejected,
        _ => OrderStatus::Submitted,
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "Buy",
        OrderSide::Sell => "Sell",
    }
}

fn time_in_force_str(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
        TimeInForce::Fok => "FOK",
        TimeInForce::Gtx => "PostOnly",
    }
}

/// 1 = trigger when price rises to the trigger, 2 = when it falls.
/// A sell stop protects a long (falls), a sell take-profit fires on a rise.
pub fn trigger_direction(order_type: OrderType, side: OrderSide) -> Option<u8> {
    match (order_type, side) {
        (OrderType::StopMarket, OrderSide::Sell) => Some(2),
        (OrderType::StopMarket, OrderSide::Buy) => Some(1),
        (OrderType::TakeProfitMarket, OrderSide::Sell) => Some(1),
        (OrderType::TakeProfitMarket, OrderSide::Buy) => Some(2),
        _ => None,
    }
}

pub fn map_ret_code(code: i64, message: &str) -> ExchangeError {
    match code {
        10003 | 10004 | 10005 | 10007 | 33004 => ExchangeError::Auth(message.to_string()),
        10006 | 10018 => ExchangeError::RateLimited(message.to_string()),
        10000 | 10016 => ExchangeError::Unavailable(message.to_string()),
        10001 => ExchangeError::Validation(message.to_string()),
        c => ExchangeError::Rejected {
            code: c.to_string(),
            message: message.to_string(),
        },
    }
}

fn map_http_status(status: u16, body: &str) -> ExchangeError {
    match status {
        401 | 403 => ExchangeError::Auth(body.to_string()),
        429 => ExchangeError::RateLimited(body.to_string()),
        s if s >= 500 => ExchangeError::Unavailable(body.to_string()),
        s => ExchangeError::Rejected {
            code: format!("http_{}", s),
            message: body.to_string(),
        },
    }
}

/// JSON body for `/v5/order/create`
pub fn order_body(request: &OrderRequest) -> Value {
    let order_type = match request.order_type {
        OrderType::Limit => "Limit",
        _ => "Market",
    };
    let mut body = json!({
        "category": CATEGORY,
        "symbol": request.symbol,
        "side": side_str(request.side),
        "orderType": order_type,
        "qty": format_decimal(request.quantity, 8),
        "orderLinkId": request.client_order_id,
        "reduceOnly": request.reduce_only,
    });
    if let Some(price) = request.price {
        body["price"] = json!(format_decimal(price, 8));
    }
    if let Some(tif) = request.time_in_force {
        body["timeInForce"] = json!(time_in_force_str(tif));
    }
    if let Some(stop) = request.stop_price {
        body["triggerPrice"] = json!(format_decimal(stop, 8));
        body["triggerBy"] = json!("MarkPrice");
        if let Some(direction) = trigger_direction(request.order_type, request.side) {
            body["triggerDirection"] = json!(direction);
        }
    }
    if request.close_position && request.order_type.is_conditional() {
        body["closeOnTrigger"] = json!(true);
    }
    body
}

pub fn parse_instrument(symbol: &str, instrument: &Value) -> SymbolRules {
    let field = |section: &str, name: &str| -> f64 {
        instrument
            .get(section)
            .and_then(|s| s.get(name))
            .and_then(|v| v.as_str())
            .map(parse_f64)
            .unwrap_or(0.0)
    };
    SymbolRules {
        symbol: symbol.to_string(),
        tick_size: field("priceFilter", "tickSize"),
        step_size: field("lotSizeFilter", "qtyStep"),
        min_qty: field("lotSizeFilter", "minOrderQty"),
        max_qty: Some(field("lotSizeFilter", "maxOrderQty")).filter(|v| *v > 0.0),
        min_notional: Some(field("lotSizeFilter", "minNotionalValue")).filter(|v| *v > 0.0),
    }
}

pub struct BybitClient {
    client: Client,
    config: BybitConfig,
    credentials: ApiCredentials,
}

impl BybitClient {
    pub fn new(client: Client, config: BybitConfig, credentials: ApiCredentials) -> Self {
        Self {
            client,
            config,
            credentials,
        }
    }

    fn auth_headers(&self, payload: &str) -> ExchangeResult<Vec<(&'static str, String)>> {
        let timestamp = timestamp_ms()?.to_string();
        let recv_window = self.config.recv_window_ms.to_string();
        let prehash = format!(
            "{}{}{}{}",
            timestamp, self.credentials.api_key, recv_window, payload
        );
        let signature = sign(&self.credentials.api_secret, &prehash)?;
        Ok(vec![
            ("X-BAPI-API-KEY", self.credentials.api_key.clone()),
            ("X-BAPI-TIMESTAMP", timestamp),
            ("X-BAPI-RECV-WINDOW", recv_window),
            ("X-BAPI-SIGN", signature),
        ])
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> ExchangeResult<T> {
        let query = encode_query(params);
        let url = format!("{}{}?{}", self.config.api_base, path, query);
        let mut request = self.client.get(&url);
        if signed {
            for (name, value) in self.auth_headers(&query)? {
                request = request.header(name, value);
            }
        }
        debug!(path, signed, "Bybit GET");
        let response = request.send().await.map_err(|e| transport_error(path, e))?;
        Self::decode(path, response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> ExchangeResult<T> {
        let payload = body.to_string();
        let mut request = self
            .client
            .post(format!("{}{}", self.config.api_base, path))
            .header("Content-Type", "application/json");
        for (name, value) in self.auth_headers(&payload)? {
            request = request.header(name, value);
        }
        debug!(path, "Bybit POST");
        let response = request
            .body(payload)
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
            return Err(map_http_status(status.as_u16(), &body));
        }
        let envelope: Envelope = serde_json::from_str(&body).map_err(|e| {
            ExchangeError::Unavailable(format!("{}: unexpected response: {}", path, e))
        })?;
        if envelope.ret_code != 0 {
            return Err(map_ret_code(envelope.ret_code, &envelope.ret_msg));
        }
        serde_json::from_value(envelope.result).map_err(|e| {
            ExchangeError::Unavailable(format!("{}: unexpected result: {}", path, e))
        })
    }

    fn is_code(err: &ExchangeError, code: i64) -> bool {
        err.code() == Some(code.to_string().as_str())
    }
}

#[async_trait]
impl ExchangeClient for BybitClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn connect(&self) -> ExchangeResult<()> {
        let _: Value = self.get("/v5/market/time", &[], false).await?;
        Ok(())
    }

    async fn account_info(&self) -> ExchangeResult<AccountInfo> {
        let wallets: ListResult<BybitWallet> = self
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
                true,
            )
            .await?;
        let wallet = wallets
            .list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Unavailable("empty wallet-balance response".into()))?;
        Ok(AccountInfo {
            // A successful signed call implies trade permission is not revoked
            can_trade: true,
            total_balance: wallet.total_wallet_balance,
            available_balance: wallet.total_available_balance,
            unrealized_pnl: wallet.total_perp_upl,
        })
    }

    async fn balances(&self) -> ExchangeResult<Vec<Balance>> {
        let wallets: ListResult<BybitWallet> = self
            .get(
                "/v5/account/wallet-balance",
                &[("accountType", "UNIFIED".to_string())],
                true,
            )
            .await?;
        Ok(wallets
            .list
            .into_iter()
            .flat_map(|w| w.coin)
            .filter(|c| c.wallet_balance != 0.0)
            .map(|c| Balance {
                asset: c.coin,
                available: c.available_to_withdraw,
                total: c.wallet_balance,
            })
            .collect())
    }

    async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let mut params = vec![("category", CATEGORY.to_string())];
        match symbol {
            Some(s) => params.push(("symbol", s.to_string())),
            None => params.push(("settleCoin", SETTLE_COIN.to_string())),
        }
        let rows: ListResult<BybitPosition> = self.get("/v5/position/list", &params, true).await?;
        Ok(rows
            .list
            .into_iter()
            .filter_map(|p| {
                let size = parse_f64(&p.size);
                if size == 0.0 {
                    return None;
                }
                let side = match p.side.as_str() {
                    "Buy" => OrderSide::Buy,
                    "Sell" => OrderSide::Sell,
                    _ => return None,
                };
                Some(PositionInfo {
                    symbol: p.symbol,
                    side,
                    quantity: size.abs(),
                    entry_price: parse_f64(&p.avg_price),
                    mark_price: parse_opt_f64(&p.mark_price),
                    unrealized_pnl: parse_f64(&p.unrealised_pnl),
                    leverage: parse_opt_f64(&p.leverage).map(|l| l.round() as u32),
                })
            })
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        if request.client_order_id.is_empty() {
            return Err(ExchangeError::Validation("client order id is required".into()));
        }
        match self
            .post::<CreatedOrder>("/v5/order/create", &order_body(request))
            .await
        {
            Ok(created) => {
                info!(
                    symbol = %request.symbol,
                    client_order_id = %created.order_link_id,
                    order_type = request.order_type.as_str(),
                    "Bybit order placed"
                );
                // Create only acknowledges; fills arrive via reconciliation
                Ok(OrderAck {
                    exchange_order_id: created.order_id,
                    client_order_id: created.order_link_id,
                    symbol: request.symbol.clone(),
                    status: OrderStatus::Submitted,
                    filled_quantity: 0.0,
                    average_price: None,
                })
            }
            Err(err) if Self::is_code(&err, DUPLICATE_LINK_ID) => {
                debug!(client_order_id = %request.client_order_id, "Duplicate orderLinkId, fetching existing order");
                self.get_order(&request.symbol, &request.client_order_id)
                    .await?
                    .ok_or(err)
            }
            Err(err) => Err(err),
        }
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderLinkId": client_order_id,
        });
        let _: Value = self.post("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn get_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<Option<OrderAck>> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
            ("orderLinkId", client_order_id.to_string()),
        ];
        match self
            .get::<ListResult<BybitOrder>>("/v5/order/realtime", &params, true)
            .await
        {
            Ok(rows) => Ok(rows.list.into_iter().next().map(BybitOrder::into_ack)),
            Err(err) if Self::is_code(&err, ORDER_NOT_EXISTS) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn open_orders(&self, symbol: Option<&str>) -> ExchangeResult<Vec<OrderAck>> {
        let mut params = vec![("category", CATEGORY.to_string())];
        match symbol {
            Some(s) => params.push(("symbol", s.to_string())),
            None => params.push(("settleCoin", SETTLE_COIN.to_string())),
        }
        params.push(("openOnly", "0".to_string()));
        let rows: ListResult<BybitOrder> = self.get("/v5/order/realtime", &params, true).await?;
        Ok(rows.list.into_iter().map(BybitOrder::into_ack).collect())
    }

    async fn exchange_info(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
        ];
        let rows: ListResult<Value> = self
            .get("/v5/market/instruments-info", &params, false)
            .await?;
        rows.list
            .first()
            .map(|instrument| parse_instrument(symbol, instrument))
            .ok_or_else(|| ExchangeError::Validation(format!("unknown symbol {}", symbol)))
    }

    async fn ticker_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let params = vec![
            ("category", CATEGORY.to_string()),
            ("symbol", symbol.to_string()),
        ];
        let rows: ListResult<BybitTicker> = self.get("/v5/market/tickers", &params, false).await?;
        rows.list
            .first()
            .and_then(|t| parse_opt_f64(&t.last_price))
            .ok_or_else(|| ExchangeError::Unavailable(format!("no price for {}", symbol)))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post::<Value>("/v5/position/set-leverage", &body).await {
            Ok(_) => Ok(()),
            Err(err) if Self::is_code(&err, LEVERAGE_NOT_MODIFIED) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_direction() {
        assert_eq!(trigger_direction(OrderType::StopMarket, OrderSide::Sell), Some(2));
        assert_eq!(trigger_direction(OrderType::StopMarket, OrderSide::Buy), Some(1));
        assert_eq!(trigger_direction(OrderType::TakeProfitMarket, OrderSide::Sell), Some(1));
        assert_eq!(trigger_direction(OrderType::TakeProfitMarket, OrderSide::Buy), Some(2));
        assert_eq!(trigger_direction(OrderType::Market, OrderSide::Buy), None);
    }

    #[test]
    fn test_ret_code_mapping() {
        assert!(matches!(map_ret_code(10003, "invalid key"), ExchangeError::Auth(_)));
        assert!(matches!(map_ret_code(10006, "too many"), ExchangeError::RateLimited(_)));
        assert!(matches!(map_ret_code(10016, "server error"), ExchangeError::Unavailable(_)));
        assert!(matches!(map_ret_code(10001, "params"), ExchangeError::Validation(_)));
        assert_eq!(map_ret_code(110007, "insufficient").code(), Some("110007"));
    }

    #[test]
    fn test_stop_loss_body() {
        let request = OrderRequest::conditional(
            "ETHUSDT",
            OrderSide::Sell,
            OrderType::StopMarket,
            0.5,
            1_800.0,
            "wh3-sl",
        );
        let body = order_body(&request);
        assert_eq!(body["orderType"], "Market");
        assert_eq!(body["side"], "Sell");
        assert_eq!(body["triggerPrice"], "1800");
        assert_eq!(body["triggerDirection"], 2);
        assert_eq!(body["reduceOnly"], true);
        assert_eq!(body["orderLinkId"], "wh3-sl");
        assert!(body.get("closeOnTrigger").is_none());
    }

    #[test]
    fn test_limit_body() {
        let request = OrderRequest::limit("ETHUSDT", OrderSide::Buy, 1.25, 2_000.5, "wh4-e");
        let body = order_body(&request);
        assert_eq!(body["orderType"], "Limit");
        assert_eq!(body["qty"], "1.25");
        assert_eq!(body["price"], "2000.5");
        assert_eq!(body["timeInForce"], "GTC");
        assert!(body.get("triggerPrice").is_none());
    }

    #[test]
    fn test_instrument_rules() {
        let instrument = json!({
            "symbol": "BTCUSDT",
            "priceFilter": {"tickSize": "0.10"},
            "lotSizeFilter": {"qtyStep": "0.001", "minOrderQty": "0.001",
                               "maxOrderQty": "100", "minNotionalValue": "5"}
        });
        let rules = parse_instrument("BTCUSDT", &instrument);
        assert_eq!(rules.tick_size, 0.1);
        assert_eq!(rules.step_size, 0.001);
        assert_eq!(rules.max_qty, Some(100.0));
        assert_eq!(rules.min_notional, Some(5.0));
    }

    #[test]
    fn test_envelope_and_order_parsing() {
        let raw = r#"{"retCode":0,"retMsg":"OK","result":{"list":[{"orderId":"abc",
            "orderLinkId":"wh1-e","symbol":"BTCUSDT","orderStatus":"Filled",
            "cumExecQty":"0.01","avgPrice":"50000"}]}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        let rows: ListResult<BybitOrder> = serde_json::from_value(envelope.result).unwrap();
        let ack = rows.list.into_iter().next().unwrap().into_ack();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.filled_quantity, 0.01);
        assert_eq!(parse_order_status("Untriggered"), OrderStatus::Open);
        assert_eq!(parse_order_status("Deactivated"), OrderStatus::Canceled);
    }
}
