//! Outbound notification webhooks.
//!
//! Negative feedback and operational alerts fan out through the [`Notifier`]
//! trait. Delivery failures are the caller's problem to log, never to
//! propagate; nothing in the request path depends on a notification landing.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while emitting a notification.
#[derive(Debug, Error)]
pub enum NotifierError {
    /// The webhook rejected or failed to receive the payload.
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Interface implemented by notification sinks.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Emit one notification of the given kind with an arbitrary payload.
    async fn notify(&self, kind: &str, payload: Value) -> Result<(), NotifierError>;
}

/// Webhook-backed notifier posting card-style messages.
pub struct WebhookNotifier {
    pub(crate) client: Client,
    pub(crate) webhook_url: String,
    pub(crate) service_name: String,
}

impl WebhookNotifier {
    /// Construct a notifier for the given webhook.
    pub fn new(
        webhook_url: String,
        service_name: String,
        timeout: Duration,
    ) -> Result<Self, NotifierError> {
        let client = Client::builder()
            .user_agent("agromine/notify")
            .timeout(timeout)
            .build()
            .map_err(|err| NotifierError::Delivery(err.to_string()))?;
        Ok(Self {
            client,
            webhook_url,
            service_name,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, kind: &str, payload: Value) -> Result<(), NotifierError> {
        tracing::info!(kind, "Sending notification");
        let body = json!({
            "app_name": self.service_name,
            "kind": kind,
            "payload": payload,
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .map_err(|err| NotifierError::Delivery(err.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(NotifierError::Delivery(format!("{status}: {body}")))
        }
    }
}

/// Notifier that drops everything; used when no webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, kind: &str, _payload: Value) -> Result<(), NotifierError> {
        tracing::debug!(kind, "Notifier not configured; dropping notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    #[tokio::test]
    async fn webhook_receives_kind_and_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hooks/alerts")
                    .body_contains("negative_feedback")
                    .body_contains("interaction-1");
                then.status(200);
            })
            .await;

        let notifier = WebhookNotifier::new(
            format!("{}/hooks/alerts", server.base_url()),
            "agromine".into(),
            Duration::from_secs(5),
        )
        .expect("notifier");

        notifier
            .notify(
                "negative_feedback",
                json!({ "interaction_id": "interaction-1" }),
            )
            .await
            .expect("delivery");
        mock.assert();
    }

    #[tokio::test]
    async fn failed_delivery_surfaces_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/hooks/alerts");
                then.status(500).body("hook exploded");
            })
            .await;

        let notifier = WebhookNotifier::new(
            format!("{}/hooks/alerts", server.base_url()),
            "agromine".into(),
            Duration::from_secs(5),
        )
        .expect("notifier");

        let err = notifier.notify("alert", json!({})).await.unwrap_err();
        assert!(matches!(err, NotifierError::Delivery(_)));
    }
}
