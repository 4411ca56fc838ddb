//! Shared HTTP plumbing for the exchange adapters

use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::domain::repositories::exchange_client::{ExchangeError, ExchangeResult};
use crate::domain::services::signature::hmac_sha256_hex;

pub const USER_AGENT: &str = concat!("signal-dispatch/", env!("CARGO_PKG_VERSION"));

/// One pooled client for every adapter; the timeout applies to each request
pub fn build_http_client(timeout: Duration) -> ExchangeResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(5)))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ExchangeError::Unavailable(format!("HTTP client init failed: {}", e)))
}

/// Network level failures are always transient
pub fn transport_error(context: &str, err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Unavailable(format!("{}: request timed out", context))
    } else {
        ExchangeError::Unavailable(format!("{}: {}", context, err))
    }
}

pub fn timestamp_ms() -> ExchangeResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|e| ExchangeError::Unavailable(format!("Time error: {}", e)))
}

pub fn sign(secret: &str, message: &str) -> ExchangeResult<String> {
    hmac_sha256_hex(secret.as_bytes(), message.as_bytes()).map_err(ExchangeError::Auth)
}

/// `k=v&k=v` in the given order, values percent-encoded
pub fn encode_query(params: &[(&str, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in params {
        serializer.append_pair(key, value);
    }
    serializer.finish()
}

/// Exchanges send most numbers as strings; missing or garbled values read as 0
pub fn parse_f64(raw: &str) -> f64 {
    raw.trim().parse::<f64>().unwrap_or(0.0)
}

pub fn parse_opt_f64(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| *v != 0.0)
}

/// Accept both `"1.5"` and `1.5`
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Num {
        Str(String),
        Num(f64),
    }
    Ok(match Option::<Num>::deserialize(deserializer)? {
        Some(Num::Str(s)) => parse_f64(&s),
        Some(Num::Num(n)) => n,
        None => 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query_keeps_order_and_escapes() {
        let query = encode_query(&[
            ("symbol", "BTCUSDT".to_string()),
            ("newClientOrderId", "wh1-e".to_string()),
            ("note", "a b&c".to_string()),
        ]);
        assert_eq!(query, "symbol=BTCUSDT&newClientOrderId=wh1-e&note=a+b%26c");
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_f64(" 1.25 "), 1.25);
        assert_eq!(parse_f64(""), 0.0);
        assert_eq!(parse_opt_f64("0"), None);
        assert_eq!(parse_opt_f64("3.5"), Some(3.5));
    }

    #[test]
    fn test_de_f64_accepts_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Row {
            #[serde(deserialize_with = "de_f64", default)]
            v: f64,
        }
        let a: Row = serde_json::from_str(r#"{"v":"2.5"}"#).unwrap();
        let b: Row = serde_json::from_str(r#"{"v":2.5}"#).unwrap();
        let c: Row = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(a.v, 2.5);
        assert_eq!(b.v, 2.5);
        assert_eq!(c.v, 0.0);
    }

    #[test]
    fn test_client_builds() {
        assert!(build_http_client(Duration::from_secs(10)).is_ok());
    }
}
