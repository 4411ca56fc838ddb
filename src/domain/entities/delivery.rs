//! WebhookDelivery entity - one record per inbound alert

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Delivery processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Retrying => "retrying",
        }
    }

    /// Allowed moves. Forward only, except the retry loop
    /// (`processing -> retrying -> processing`, `failed -> retrying`).
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Retrying)
                | (Processing, Success)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Retrying, Processing)
                | (Retrying, Failed)
                | (Failed, Retrying)
        )
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "processing" => Ok(DeliveryStatus::Processing),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "retrying" => Ok(DeliveryStatus::Retrying),
            other => Err(format!("Unknown delivery status: {}", other)),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub alert_id: Option<String>,
    /// Raw request body as received
    pub payload: String,
    pub headers: serde_json::Value,
    pub hmac_valid: bool,
    pub payload_valid: bool,
    pub status: DeliveryStatus,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub orders_created: i32,
    pub orders_executed: i32,
    pub orders_failed: i32,
    pub processing_duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn new(
        webhook_id: i64,
        payload: &str,
        headers: serde_json::Value,
        alert_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            webhook_id,
            alert_id,
            payload: payload.to_string(),
            headers,
            hmac_valid: true,
            payload_valid: true,
            status: DeliveryStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            orders_created: 0,
            orders_executed: 0,
            orders_failed: 0,
            processing_duration_ms: None,
            error_message: None,
            error_details: None,
            task_id: None,
            created_at: now,
            processed_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status == DeliveryStatus::Success
            || (self.status == DeliveryStatus::Failed && self.next_retry_at.is_none())
    }

    fn move_to(&mut self, next: DeliveryStatus) -> Result<(), String> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "Invalid delivery transition: {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next != DeliveryStatus::Retrying {
            self.next_retry_at = None;
        }
        Ok(())
    }

    pub fn mark_processing(&mut self) -> Result<(), String> {
        self.move_to(DeliveryStatus::Processing)
    }

    pub fn mark_success(&mut self, duration_ms: i64) -> Result<(), String> {
        self.move_to(DeliveryStatus::Success)?;
        self.processing_duration_ms = Some(duration_ms);
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_retrying(
        &mut self,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), String> {
        self.move_to(DeliveryStatus::Retrying)?;
        self.retry_count = retry_count;
        self.next_retry_at = Some(next_retry_at);
        self.error_message = Some(error.to_string());
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error: &str,
        details: Option<serde_json::Value>,
    ) -> Result<(), String> {
        self.move_to(DeliveryStatus::Failed)?;
        self.error_message = Some(error.to_string());
        if details.is_some() {
            self.error_details = details;
        }
        self.processed_at = Some(Utc::now());
        Ok(())
    }
}
