//! Notification Dispatcher: at-least-once webhook delivery of settlements.
//!
//! Delivery never feeds back into settlement state. The outcome is recorded
//! only in `SettlementMetadata.delivery`.
//!
//! ## Retry policy
//!
//! - `max_attempts` attempts in total, each bounded by `attempt_timeout`
//! - between attempts: `base_backoff * 2^(n-1)` (1s, 2s, 4s, ... by default)
//! - 2xx: delivered
//! - 4xx: rejected, terminal, no retry
//! - 5xx, other statuses, transport errors, timeouts: retried

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use splitvault_types::{DeliveryStatus, NotificationPayload, SplitvaultError, WebhookConfig};

/// Seam the engine depends on.
#[async_trait]
pub trait SettlementNotifier: Send + Sync {
    async fn notify(&self, payload: &NotificationPayload) -> DeliveryStatus;
}

/// Success body: `{ "success": true, "status": "..." }`.
#[derive(Debug, Deserialize)]
struct WebhookAck {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    status: Option<String>,
}

/// Error body: `{ "error": "...", "code": ... }`.
#[derive(Debug, Deserialize)]
struct WebhookErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

enum Attempt {
    Delivered,
    Rejected(String),
    Retryable(String),
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    endpoint: String,
    auth_token: Option<String>,
    config: WebhookConfig,
    http: reqwest::Client,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, auth_token: Option<String>, config: WebhookConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: auth_token
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            config,
            http: reqwest::Client::new(),
        }
    }

    /// `None` when no endpoint is configured.
    #[must_use]
    pub fn from_config(config: &WebhookConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        Some(Self::new(endpoint, config.auth_token.clone(), config.clone()))
    }

    /// Delays slept between consecutive attempts.
    #[must_use]
    pub fn backoff_schedule(&self) -> Vec<std::time::Duration> {
        (1..self.config.max_attempts)
            .map(|retry| self.config.backoff_for(retry))
            .collect()
    }

    /// Deliver `payload`, retrying per the policy above.
    ///
    /// Returns the number of attempts on success.
    ///
    /// # Errors
    /// [`SplitvaultError::WebhookDeliveryFailure`] on a 4xx or once
    /// attempts are exhausted.
    pub async fn deliver(&self, payload: &NotificationPayload) -> splitvault_types::Result<u32> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(payload).await {
                Attempt::Delivered => {
                    tracing::info!(
                        wallet = %payload.wallet_id,
                        reference = payload.settlement_reference.as_str(),
                        attempt,
                        "Settlement webhook delivered"
                    );
                    return Ok(attempt);
                }
                Attempt::Rejected(reason) => {
                    tracing::warn!(
                        wallet = %payload.wallet_id,
                        attempt,
                        %reason,
                        "Settlement webhook rejected, not retrying"
                    );
                    return Err(SplitvaultError::WebhookDeliveryFailure {
                        attempts: attempt,
                        reason,
                    });
                }
                Attempt::Retryable(reason) => {
                    tracing::debug!(wallet = %payload.wallet_id, attempt, %reason, "Webhook attempt failed");
                    last_reason = reason;
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.backoff_for(attempt)).await;
            }
        }

        tracing::warn!(
            wallet = %payload.wallet_id,
            attempts = max_attempts,
            reason = %last_reason,
            "Settlement webhook undelivered"
        );
        Err(SplitvaultError::WebhookDeliveryFailure {
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    async fn attempt(&self, payload: &NotificationPayload) -> Attempt {
        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(self.config.attempt_timeout())
            .header("idempotency-key", payload.settlement_reference.as_str())
            .json(payload);
        if let Some(token) = self.auth_token.as_ref() {
            request = request.header("authorization", format!("Bearer {token}"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                return Attempt::Retryable(format!(
                    "timed out after {} ms",
                    self.config.attempt_timeout_ms
                ));
            }
            Err(error) => return Attempt::Retryable(format!("transport error: {error}")),
        };

        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        if status.is_success() {
            if let Ok(ack) = serde_json::from_slice::<WebhookAck>(&body) {
                tracing::debug!(success = ?ack.success, status = ?ack.status, "Webhook acknowledged");
            }
            return Attempt::Delivered;
        }

        let detail = match serde_json::from_slice::<WebhookErrorBody>(&body) {
            Ok(parsed) => format!(
                "{}: {}",
                parsed.code.map_or_else(|| "-".to_string(), |code| code.to_string()),
                parsed.error.unwrap_or_default()
            ),
            Err(_) => String::from_utf8_lossy(&body).chars().take(200).collect(),
        };
        let reason = format!("http {}: {detail}", status.as_u16());
        if status.is_client_error() {
            Attempt::Rejected(reason)
        } else {
            Attempt::Retryable(reason)
        }
    }
}

#[async_trait]
impl SettlementNotifier for WebhookNotifier {
    async fn notify(&self, payload: &NotificationPayload) -> DeliveryStatus {
        match self.deliver(payload).await {
            Ok(attempts) => DeliveryStatus::Delivered { attempts },
            Err(SplitvaultError::WebhookDeliveryFailure { attempts, reason }) => {
                DeliveryStatus::Undelivered { attempts, reason }
            }
            Err(other) => DeliveryStatus::Undelivered {
                attempts: 0,
                reason: other.to_string(),
            },
        }
    }
}
