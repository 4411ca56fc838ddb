use axum::{
    body::{to_bytes, Body},
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};

use super::AppState;
use crate::application::services::webhook_pipeline::DeliveryResult;

/// Header names accepted for the HMAC signature, in lookup order
pub const SIGNATURE_HEADERS: [&str; 3] = ["x-signature", "x-webhook-signature", "x-hub-signature-256"];

/// Headers never persisted with a delivery
const REDACTED_HEADERS: [&str; 3] = ["authorization", "cookie", "x-api-key"];

/// Largest accepted alert body in bytes
#[derive(Debug, Clone, Copy)]
pub struct WebhookBodyLimit(pub usize);

/// Body of every webhook response; the status code is always 200
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
}

impl WebhookResponse {
    fn new(success: bool, message: &str) -> Self {
        Self {
            success,
            message: message.to_string(),
            delivery_id: None,
            duplicate: None,
        }
    }
}

impl From<DeliveryResult> for WebhookResponse {
    fn from(result: DeliveryResult) -> Self {
        match result {
            DeliveryResult::Accepted { delivery_id, .. } => Self {
                delivery_id: Some(delivery_id),
                ..Self::new(true, "Alert accepted")
            },
            DeliveryResult::Duplicate {
                prior_delivery_id, ..
            } => Self {
                delivery_id: Some(prior_delivery_id),
                duplicate: Some(true),
                ..Self::new(true, "Duplicate alert ignored")
            },
            DeliveryResult::NotFound => Self::new(false, "Webhook not found"),
            DeliveryResult::Inactive { .. } => Self::new(false, "Webhook is not active"),
            DeliveryResult::InvalidSignature { delivery_id } => Self {
                delivery_id: Some(delivery_id),
                ..Self::new(false, "Invalid signature")
            },
            DeliveryResult::InvalidPayload { delivery_id, .. } => Self {
                delivery_id: Some(delivery_id),
                ..Self::new(false, "Invalid alert payload")
            },
        }
    }
}

pub fn extract_signature(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .find_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Request headers as a JSON object, minus credentials
pub fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let name = name.as_str();
        if REDACTED_HEADERS.contains(&name) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

/// POST /webhooks/:url_path
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(url_path): Path<String>,
    Extension(WebhookBodyLimit(limit)): Extension<WebhookBodyLimit>,
    headers: HeaderMap,
    body: Body,
) -> Json<WebhookResponse> {
    let body = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(url_path = %url_path, limit, error = %err, "Webhook body rejected");
            return Json(WebhookResponse::new(false, "Payload too large"));
        }
    };
    let signature = extract_signature(&headers);
    match state
        .pipeline
        .receive(&url_path, &body, headers_to_json(&headers), signature)
        .await
    {
        Ok(result) => Json(result.into()),
        Err(err) => {
            error!(url_path = %url_path, error = %err, code = err.error_code(), "Webhook receipt failed");
            Json(WebhookResponse::new(false, err.public_message()))
        }
    }
}
