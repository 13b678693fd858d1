//! Shared harness for integration tests: a config builder pointing every
//! collaborator at mock servers, plus stub implementations of the external
//! interfaces.
#![allow(dead_code)]

use agromine::config::{Config, Environment, Project, SearchIndexConfig};
use agromine::notify::{Notifier, NotifierError};
use agromine::auth::TokenValidator;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// Configuration wired to the given mock endpoints.
pub fn test_config(qdrant_url: &str, llm_url: &str, mapping_url: &str) -> Config {
    Config {
        qdrant_url: qdrant_url.to_string(),
        qdrant_api_key: None,
        reference_collection: "reference_corpus".into(),
        ephemeral_collection: "ephemeral_documents".into(),
        chat_collection: "chat_corpus".into(),
        embedding_url: "http://127.0.0.1:9/embedding".into(),
        embedding_api_key: None,
        embedding_model: "test-embed".into(),
        embedding_dimension: 8,
        llm_url: llm_url.to_string(),
        llm_api_key: None,
        llm_model: "claude-test".into(),
        llm_max_retries: 0,
        blobstore_url: "http://127.0.0.1:9/blobs".into(),
        blobstore_api_key: None,
        reference_bucket: "reference-bucket".into(),
        star_reference_prefix: "star/text-mining/files".into(),
        prms_reference_prefix: "prms/text-mining/files".into(),
        staff_search: SearchIndexConfig {
            url: mapping_url.to_string(),
            index: "staff".into(),
            username: None,
            password: None,
        },
        institution_search: SearchIndexConfig {
            url: mapping_url.to_string(),
            index: "institutions".into(),
            username: None,
            password: None,
        },
        mapping_max_retries: 3,
        mapping_retry_delay_secs: 0,
        record_source_url: "http://127.0.0.1:9/records".into(),
        record_source_api_key: None,
        star_auth_endpoint: None,
        prms_auth_endpoint: None,
        tracker_db_path: "unused".into(),
        environment: Environment::Test,
        notifier_webhook_url: None,
        chunk_size: 8_000,
        chunk_overlap: 1_500,
        bulk_batch_size: 5,
        bulk_max_workers: 4,
        step_timeout_secs: 10,
        request_deadline_secs: 30,
        server_port: None,
        service_name: "agromine-test".into(),
    }
}

/// Token validator accepting or rejecting everything.
pub struct StaticValidator {
    pub accept: bool,
}

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate(&self, _project: Project, _token: &str) -> bool {
        self.accept
    }
}

/// Notifier recording every call for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, kind: &str, payload: Value) -> Result<(), NotifierError> {
        self.calls.lock().await.push((kind.to_string(), payload));
        Ok(())
    }
}

/// Wrap plain text as the messages-endpoint response body.
pub fn llm_response(text: &str) -> Value {
    serde_json::json!({
        "content": [ { "type": "text", "text": text } ]
    })
}
