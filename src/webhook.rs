//! Best-effort webhook fan-out.
//!
//! One delivery attempt per event, fire-and-forget. Failures are logged and
//! never propagate into connection handling or reconciliation. Callers that
//! need durability poll the REST surface instead.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use thiserror::Error;

use crate::{events::GatewayEvent, store::Store};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook post failed: {0}")]
    Post(String),
}

/// HTTP client abstraction so tests can capture deliveries.
#[async_trait]
pub trait HttpPoster: Send + Sync {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<(), WebhookError>;
}

/// reqwest-backed poster with a per-attempt timeout.
pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HttpPoster for ReqwestPoster {
    async fn post_json(&self, url: &str, payload: &Value) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|error| WebhookError::Post(error.to_string()))?;

        response
            .error_for_status()
            .map_err(|error| WebhookError::Post(error.to_string()))?;
        Ok(())
    }
}

/// Looks up the per-instance webhook URL and delivers domain events to it.
#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    poster: Arc<dyn HttpPoster>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn Store>, poster: Arc<dyn HttpPoster>) -> Self {
        Self { store, poster }
    }

    /// Emits one event. No configured URL means no-op. Delivery runs on a
    /// detached task so the caller never waits on the remote endpoint.
    pub async fn emit(&self, instance_id: &str, event: GatewayEvent) {
        let url = match self.store.fetch_instance(instance_id).await {
            Ok(Some(record)) => record.webhook_url,
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(instance = %instance_id, error = %error, "webhook url lookup failed");
                None
            }
        };
        let Some(url) = url else {
            return;
        };

        let payload = json!({
            "event": event.kind.as_str(),
            "instanceId": instance_id,
            "data": event.data,
            "timestamp": Utc::now().to_rfc3339(),
        });

        let poster = self.poster.clone();
        let instance = instance_id.to_owned();
        let kind = event.kind.as_str();
        tokio::spawn(async move {
            if let Err(error) = poster.post_json(&url, &payload).await {
                tracing::warn!(instance = %instance, event = kind, error = %error, "webhook delivery failed");
            }
        });
    }
}
