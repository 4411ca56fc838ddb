//! Webhook entity - a named inbound endpoint owned by a user

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::domain::entities::exchange::{Environment, Exchange};

/// Lifecycle status of a webhook endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Active,
    Paused,
    Disabled,
    Error,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Active => "active",
            WebhookStatus::Paused => "paused",
            WebhookStatus::Disabled => "disabled",
            WebhookStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for WebhookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WebhookStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(WebhookStatus::Active),
            "paused" => Ok(WebhookStatus::Paused),
            "disabled" => Ok(WebhookStatus::Disabled),
            "error" => Ok(WebhookStatus::Error),
            other => Err(format!("Unknown webhook status: {}", other)),
        }
    }
}

/// Inbound webhook endpoint with default trading parameters and delivery counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub url_path: String,
    pub secret: Option<String>,
    pub status: WebhookStatus,

    // Default trading parameters, applied when the alert omits them
    pub default_margin: Option<f64>,
    pub default_leverage: Option<u32>,
    /// Stop-loss distance in percent of the entry price (2.0 = 2%)
    pub default_stop_loss_pct: Option<f64>,
    /// Take-profit distance in percent of the entry price
    pub default_take_profit_pct: Option<f64>,
    pub exchange: Option<Exchange>,
    pub environment: Option<Environment>,

    pub total_deliveries: i64,
    pub successful_deliveries: i64,
    pub failed_deliveries: i64,
    pub consecutive_errors: i64,
    pub error_threshold: i64,
    pub auto_pause_on_errors: bool,

    pub last_delivery_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Build an unsaved, active webhook (id is assigned by the store)
    pub fn new(user_id: i64, name: &str, url_path: &str, secret: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            name: name.to_string(),
            url_path: url_path.to_string(),
            secret: secret.map(|s| s.to_string()),
            status: WebhookStatus::Active,
            default_margin: None,
            default_leverage: None,
            default_stop_loss_pct: None,
            default_take_profit_pct: None,
            exchange: None,
            environment: None,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            consecutive_errors: 0,
            error_threshold: 5,
            auto_pause_on_errors: true,
            last_delivery_at: None,
            last_success_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WebhookStatus::Active
    }

    /// Secret to verify signatures with, ignoring blank values
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn record_received(&mut self, at: DateTime<Utc>) {
        self.total_deliveries += 1;
        self.last_delivery_at = Some(at);
        self.updated_at = at;
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.successful_deliveries += 1;
        self.consecutive_errors = 0;
        self.last_success_at = Some(at);
        self.updated_at = at;
    }

    /// Record a failed delivery. Returns true when this failure paused the webhook.
    pub fn record_failure(&mut self, at: DateTime<Utc>) -> bool {
        self.failed_deliveries += 1;
        self.consecutive_errors += 1;
        self.updated_at = at;

        if self.auto_pause_on_errors
            && self.status == WebhookStatus::Active
            && self.consecutive_errors >= self.error_threshold
        {
            self.status = WebhookStatus::Paused;
            return true;
        }
        false
    }

    /// Explicit status transition requested by the owner
    pub fn set_status(&mut self, status: WebhookStatus, at: DateTime<Utc>) {
        if status == WebhookStatus::Active {
            self.consecutive_errors = 0;
        }
        self.status = status;
        self.updated_at = at;
    }
}
