//! Webhook receipt: authenticate, deduplicate, persist, enqueue.
//!
//! Never calls an exchange. Accepted alerts become a pending delivery plus a
//! `ProcessWebhook` task; rejected alerts are recorded as failed deliveries.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::application::orchestrator::Orchestrator;
use crate::domain::entities::delivery::{DeliveryStatus, WebhookDelivery};
use crate::domain::entities::task::TaskKind;
use crate::domain::entities::webhook::{Webhook, WebhookStatus};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::store::Store;
use crate::domain::services::keyed_locks::KeyedLocks;
use crate::domain::services::payload_normalizer::{extract_alert_id, normalize};
use crate::domain::services::signature::{derive_alert_id, verify_signature};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Same alert id within this window is a duplicate
    pub dedup_window: Duration,
    /// Reject unsigned alerts for webhooks that have a secret
    pub require_signature: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(10),
            require_signature: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryResult {
    Accepted {
        delivery_id: i64,
        task_id: String,
    },
    Duplicate {
        prior_delivery_id: i64,
        status: DeliveryStatus,
    },
    NotFound,
    Inactive {
        status: WebhookStatus,
    },
    InvalidSignature {
        delivery_id: i64,
    },
    InvalidPayload {
        delivery_id: i64,
        reason: String,
    },
}

pub struct WebhookPipeline {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    config: PipelineConfig,
    webhook_locks: KeyedLocks<i64>,
}

impl WebhookPipeline {
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<Orchestrator>, config: PipelineConfig) -> Self {
        Self {
            store,
            orchestrator,
            config,
            webhook_locks: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn receive(
        &self,
        url_path: &str,
        raw_body: &[u8],
        headers: Value,
        signature: Option<&str>,
    ) -> DispatchResult<DeliveryResult> {
        let Some(webhook) = self.store.get_webhook_by_path(url_path).await? else {
            debug!(url_path, "Alert for unknown webhook");
            return Ok(DeliveryResult::NotFound);
        };
        if !webhook.is_active() {
            info!(webhook_id = webhook.id, status = %webhook.status, "Alert for inactive webhook ignored");
            return Ok(DeliveryResult::Inactive {
                status: webhook.status,
            });
        }

        let now = Utc::now();
        self.store.record_webhook_received(webhook.id, now).await?;
        let raw = String::from_utf8_lossy(raw_body).into_owned();

        let payload: Value = match serde_json::from_slice(raw_body) {
            Ok(v) => v,
            Err(e) => {
                let reason = format!("body is not valid JSON: {}", e);
                let delivery_id = self
                    .record_rejection(&webhook, &raw, headers, None, true, false, &reason)
                    .await?;
                return Ok(DeliveryResult::InvalidPayload {
                    delivery_id,
                    reason,
                });
            }
        };

        let alert_id = extract_alert_id(&payload).unwrap_or_else(|| derive_alert_id(&payload));

        if !self.signature_ok(&webhook, &payload, signature) {
            warn!(webhook_id = webhook.id, alert_id = %alert_id, "Webhook signature mismatch");
            let delivery_id = self
                .record_rejection(
                    &webhook,
                    &raw,
                    headers,
                    Some(alert_id),
                    false,
                    true,
                    "signature verification failed",
                )
                .await?;
            return Ok(DeliveryResult::InvalidSignature { delivery_id });
        }

        // Duplicate check and insert must not interleave for one webhook
        let _guard = self.webhook_locks.lock(webhook.id).await;

        let window = ChronoDuration::from_std(self.config.dedup_window)
            .unwrap_or_else(|_| ChronoDuration::seconds(10));
        if let Some(prior) = self
            .store
            .find_recent_delivery(webhook.id, &alert_id, now - window)
            .await?
        {
            info!(
                webhook_id = webhook.id,
                alert_id = %alert_id,
                prior_delivery_id = prior.id,
                "Duplicate alert ignored"
            );
            return Ok(DeliveryResult::Duplicate {
                prior_delivery_id: prior.id,
                status: prior.status,
            });
        }

        if let Err(err) = normalize(&payload) {
            let reason = err.to_string();
            let delivery_id = self
                .record_rejection(&webhook, &raw, headers, Some(alert_id), true, false, &reason)
                .await?;
            return Ok(DeliveryResult::InvalidPayload {
                delivery_id,
                reason,
            });
        }

        let mut delivery = self
            .store
            .create_delivery(&WebhookDelivery::new(webhook.id, &raw, headers, Some(alert_id.clone())))
            .await?;
        drop(_guard);

        let task_id = match self
            .orchestrator
            .enqueue(TaskKind::ProcessWebhook { delivery_id: delivery.id }, None)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                if let Err(e) = delivery.mark_failed("could not enqueue processing task", None) {
                    warn!(delivery_id = delivery.id, "Could not mark delivery failed: {}", e);
                }
                self.store.update_delivery(&delivery).await?;
                self.store
                    .record_webhook_outcome(webhook.id, false, Utc::now())
                    .await?;
                return Err(err);
            }
        };
        delivery.task_id = Some(task_id.clone());
        delivery.updated_at = Utc::now();
        self.store.update_delivery(&delivery).await?;

        info!(
            webhook_id = webhook.id,
            delivery_id = delivery.id,
            alert_id = %alert_id,
            task_id = %task_id,
            "Alert accepted"
        );
        Ok(DeliveryResult::Accepted {
            delivery_id: delivery.id,
            task_id,
        })
    }

    fn signature_ok(&self, webhook: &Webhook, payload: &Value, signature: Option<&str>) -> bool {
        match (webhook.signing_secret(), signature) {
            (None, _) => true,
            (Some(secret), Some(sig)) => verify_signature(secret, payload, sig),
            (Some(_), None) => !self.config.require_signature,
        }
    }

    /// Persist a failed delivery and count it against the webhook
    #[allow(clippy::too_many_arguments)]
    async fn record_rejection(
        &self,
        webhook: &Webhook,
        raw: &str,
        headers: Value,
        alert_id: Option<String>,
        hmac_valid: bool,
        payload_valid: bool,
        reason: &str,
    ) -> DispatchResult<i64> {
        let mut delivery = WebhookDelivery::new(webhook.id, raw, headers, alert_id);
        delivery.hmac_valid = hmac_valid;
        delivery.payload_valid = payload_valid;
        delivery
            .mark_failed(reason, None)
            .map_err(DispatchError::InternalFailure)?;
        let delivery = self.store.create_delivery(&delivery).await?;

        let updated = self
            .store
            .record_webhook_outcome(webhook.id, false, Utc::now())
            .await?;
        if updated.status == WebhookStatus::Paused && webhook.status != WebhookStatus::Paused {
            warn!(
                webhook_id = webhook.id,
                consecutive_errors = updated.consecutive_errors,
                "Webhook auto-paused after repeated failures"
            );
        }
        debug!(webhook_id = webhook.id, delivery_id = delivery.id, reason, "Alert rejected");
        Ok(delivery.id)
    }
}
