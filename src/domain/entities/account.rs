//! ExchangeAccount entity - a credentialed account on one exchange

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::exchange::{Environment, Exchange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(HealthStatus::Unknown),
            "healthy" => Ok(HealthStatus::Healthy),
            "warning" => Ok(HealthStatus::Warning),
            "error" => Ok(HealthStatus::Error),
            other => Err(format!("Unknown health status: {}", other)),
        }
    }
}

/// Context the stored credentials are cryptographically bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialContext {
    pub exchange: Exchange,
    pub account_id: i64,
    pub user_id: i64,
}

impl CredentialContext {
    /// Stable byte encoding used as associated data and key-derivation info
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}",
            self.exchange.name(),
            self.account_id,
            self.user_id
        )
        .into_bytes()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeAccount {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub exchange: Exchange,
    pub environment: Environment,

    // Ciphertexts produced by the credential vault
    pub api_key_encrypted: String,
    pub api_secret_encrypted: String,
    pub passphrase_encrypted: Option<String>,

    pub is_active: bool,
    pub is_default: bool,
    pub health_status: HealthStatus,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// Free margin in quote currency at the last health check
    pub available_balance: f64,
    /// Notional of open positions at the last health check
    pub open_exposure: f64,

    pub total_orders: i64,
    pub successful_orders: i64,
    pub failed_orders: i64,
    pub last_used_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for ExchangeAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeAccount")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("name", &self.name)
            .field("exchange", &self.exchange)
            .field("environment", &self.environment)
            .field("credentials", &"[REDACTED]")
            .field("is_active", &self.is_active)
            .field("is_default", &self.is_default)
            .field("health_status", &self.health_status)
            .field("available_balance", &self.available_balance)
            .field("open_exposure", &self.open_exposure)
            .finish()
    }
}

impl ExchangeAccount {
    pub fn new(
        user_id: i64,
        name: &str,
        exchange: Exchange,
        environment: Environment,
        api_key_encrypted: String,
        api_secret_encrypted: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            name: name.to_string(),
            exchange,
            environment,
            api_key_encrypted,
            api_secret_encrypted,
            passphrase_encrypted: None,
            is_active: true,
            is_default: false,
            health_status: HealthStatus::Unknown,
            last_health_check_at: None,
            last_healthy_at: None,
            last_error: None,
            available_balance: 0.0,
            open_exposure: 0.0,
            total_orders: 0,
            successful_orders: 0,
            failed_orders: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_trade(&self) -> bool {
        self.is_active && self.health_status == HealthStatus::Healthy
    }

    pub fn credential_context(&self) -> CredentialContext {
        CredentialContext {
            exchange: self.exchange,
            account_id: self.id,
            user_id: self.user_id,
        }
    }

    /// Record a probe result from the health checker
    pub fn record_health(
        &mut self,
        status: HealthStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.health_status = status;
        self.last_health_check_at = Some(at);
        if status == HealthStatus::Healthy {
            self.last_healthy_at = Some(at);
            self.last_error = None;
        } else {
            self.last_error = error;
        }
        self.updated_at = at;
    }

    pub fn record_order_outcome(&mut self, success: bool, at: DateTime<Utc>) {
        self.total_orders += 1;
        if success {
            self.successful_orders += 1;
        } else {
            self.failed_orders += 1;
        }
        self.last_used_at = Some(at);
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> ExchangeAccount {
        ExchangeAccount::new(
            7,
            "main",
            Exchange::Binance,
            Environment::Testnet,
            "k".into(),
            "s".into(),
        )
    }

    #[test]
    fn test_can_trade_requires_active_and_healthy() {
        let mut acct = account();
        assert!(!acct.can_trade());

        acct.record_health(HealthStatus::Healthy, None, Utc::now());
        assert!(acct.can_trade());

        acct.is_active = false;
        assert!(!acct.can_trade());

        acct.is_active = true;
        acct.record_health(HealthStatus::Warning, Some("slow".into()), Utc::now());
        assert!(!acct.can_trade());
    }

    #[test]
    fn test_last_healthy_at_only_moves_on_healthy() {
        let mut acct = account();
        let t1 = Utc::now();
        acct.record_health(HealthStatus::Healthy, None, t1);
        let t2 = t1 + chrono::Duration::seconds(30);
        acct.record_health(HealthStatus::Error, Some("auth".into()), t2);

        assert_eq!(acct.last_healthy_at, Some(t1));
        assert_eq!(acct.last_health_check_at, Some(t2));
        assert_eq!(acct.last_error.as_deref(), Some("auth"));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let acct = account();
        let debug = format!("{:?}", acct);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("api_key_encrypted"));
    }

    #[test]
    fn test_credential_context_bytes() {
        let mut acct = account();
        acct.id = 3;
        assert_eq!(acct.credential_context().to_bytes(), b"binance:3:7".to_vec());
    }
}
