//! Exchange Client Factory
//!
//! Builds a per-account exchange client from the account's exchange,
//! environment and decrypted credentials. The underlying HTTP connection pool
//! is shared across every client the factory hands out.

use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::domain::entities::exchange::{Environment, Exchange};
use crate::domain::repositories::exchange_client::{
    ApiCredentials, ExchangeClient, ExchangeClientProvider, ExchangeError, ExchangeResult,
};
use crate::infrastructure::binance_client::{BinanceClient, BinanceConfig};
use crate::infrastructure::bybit_client::{BybitClient, BybitConfig};
use crate::infrastructure::http::build_http_client;

pub const DEFAULT_RECV_WINDOW_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory for exchange clients
pub struct ExchangeClientFactory {
    http: Client,
    recv_window_ms: u64,
}

impl ExchangeClientFactory {
    pub fn new(request_timeout: Duration, recv_window_ms: u64) -> ExchangeResult<Self> {
        Ok(Self {
            http: build_http_client(request_timeout)?,
            recv_window_ms,
        })
    }

    /// Create a client for a specific exchange
    pub fn create(
        &self,
        exchange: Exchange,
        environment: Environment,
        credentials: ApiCredentials,
    ) -> ExchangeResult<Arc<dyn ExchangeClient>> {
        if credentials.api_key.is_empty() || credentials.api_secret.is_empty() {
            return Err(ExchangeError::Auth(format!(
                "{} credentials are incomplete",
                exchange
            )));
        }
        debug!(%exchange, %environment, "Building exchange client");
        let client: Arc<dyn ExchangeClient> = match exchange {
            Exchange::Binance => Arc::new(BinanceClient::new(
                self.http.clone(),
                BinanceConfig::new(environment, self.recv_window_ms),
                credentials,
            )),
            Exchange::Bybit => Arc::new(BybitClient::new(
                self.http.clone(),
                BybitConfig::new(environment, self.recv_window_ms),
                credentials,
            )),
        };
        Ok(client)
    }
}

impl ExchangeClientProvider for ExchangeClientFactory {
    fn client(
        &self,
        exchange: Exchange,
        environment: Environment,
        credentials: ApiCredentials,
    ) -> ExchangeResult<Arc<dyn ExchangeClient>> {
        self.create(exchange, environment, credentials)
    }
}
