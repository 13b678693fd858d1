//! Access-token validation against the project management endpoints.
//!
//! Each project exposes an endpoint that confirms whether a frontend token is
//! valid. A missing endpoint, a non-200 response or any network failure all
//! reject the token; a transport problem is never treated as a successful
//! validation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, Project};
use crate::notify::Notifier;

/// Interface for project-scoped token validation.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Whether the token is valid for the given project.
    async fn validate(&self, project: Project, token: &str) -> bool;
}

/// Validator calling the management endpoints over HTTP.
pub struct HttpTokenValidator {
    pub(crate) client: Client,
    pub(crate) star_endpoint: Option<String>,
    pub(crate) prms_endpoint: Option<String>,
    pub(crate) service_name: String,
    pub(crate) notifier: Arc<dyn Notifier>,
}

#[derive(Deserialize)]
struct ValidationResponse {
    #[serde(default)]
    data: ValidationData,
}

#[derive(Deserialize, Default)]
struct ValidationData {
    #[serde(rename = "isValid", default)]
    is_valid: bool,
}

impl HttpTokenValidator {
    /// Construct a validator from the loaded configuration.
    pub fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> Self {
        let client = Client::builder()
            .user_agent("agromine/auth")
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to construct reqwest::Client for token validation");
        Self {
            client,
            star_endpoint: config.star_auth_endpoint.clone(),
            prms_endpoint: config.prms_auth_endpoint.clone(),
            service_name: config.service_name.clone(),
            notifier: notifier.clone(),
        }
    }

    fn endpoint(&self, project: Project) -> Option<&str> {
        match project {
            Project::Star => self.star_endpoint.as_deref(),
            Project::Prms => self.prms_endpoint.as_deref(),
        }
    }

    async fn alert(&self, title: &str, message: String) {
        let payload = json!({
            "title": title,
            "message": message,
            "app_name": self.service_name,
            "priority": "High",
        });
        if let Err(error) = self.notifier.notify("auth_alert", payload).await {
            tracing::warn!(error = %error, "Failed to deliver auth alert");
        }
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, project: Project, token: &str) -> bool {
        let Some(endpoint) = self.endpoint(project) else {
            tracing::error!(%project, "Token validation endpoint is not configured");
            self.alert(
                "Configuration Error",
                format!("Token validation endpoint is not configured for {project}"),
            )
            .await;
            return false;
        };

        tracing::debug!(%project, endpoint, "Sending token validation request");
        let response = self
            .client
            .patch(endpoint)
            .header("access-token", token)
            .header("content-type", "application/json")
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<ValidationResponse>().await {
                    Ok(payload) => {
                        tracing::debug!(%project, is_valid = payload.data.is_valid, "Token validated");
                        payload.data.is_valid
                    }
                    Err(error) => {
                        tracing::error!(%project, error = %error, "Malformed token validation response");
                        false
                    }
                }
            }
            Ok(response) => {
                let status = response.status();
                tracing::error!(%project, %status, "Token validation failed");
                self.alert(
                    "Token Validation Error",
                    format!("Token validation for {project} failed with status {status}"),
                )
                .await;
                false
            }
            Err(error) => {
                tracing::error!(%project, error = %error, "HTTP error validating token");
                self.alert(
                    "Token Validation Error",
                    format!("HTTP error validating token for {project}: {error}"),
                )
                .await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullNotifier;
    use httpmock::{Method::PATCH, MockServer};

    fn validator(star_endpoint: Option<String>) -> HttpTokenValidator {
        HttpTokenValidator {
            client: Client::builder()
                .user_agent("agromine-test")
                .timeout(Duration::from_secs(2))
                .build()
                .expect("client"),
            star_endpoint,
            prms_endpoint: None,
            service_name: "agromine".into(),
            notifier: Arc::new(NullNotifier),
        }
    }

    #[tokio::test]
    async fn valid_token_passes() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/auth/validate")
                    .header("access-token", "tok-1");
                then.status(200)
                    .json_body(serde_json::json!({ "data": { "isValid": true } }));
            })
            .await;

        let validator = validator(Some(format!("{}/auth/validate", server.base_url())));
        assert!(validator.validate(Project::Star, "tok-1").await);
        mock.assert();
    }

    #[tokio::test]
    async fn rejected_token_fails() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PATCH).path("/auth/validate");
                then.status(200)
                    .json_body(serde_json::json!({ "data": { "isValid": false } }));
            })
            .await;

        let validator = validator(Some(format!("{}/auth/validate", server.base_url())));
        assert!(!validator.validate(Project::Star, "tok-1").await);
    }

    #[tokio::test]
    async fn network_failure_is_never_a_pass() {
        // Port 9 is discard; the request cannot succeed.
        let validator = validator(Some("http://127.0.0.1:9/auth/validate".into()));
        assert!(!validator.validate(Project::Star, "tok-1").await);
    }

    #[tokio::test]
    async fn missing_endpoint_rejects() {
        let validator = validator(None);
        assert!(!validator.validate(Project::Star, "tok-1").await);
        assert!(!validator.validate(Project::Prms, "tok-1").await);
    }
}
