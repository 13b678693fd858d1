//! Embedding client abstraction and the HTTP adapter.
//!
//! The pipeline embeds chunk and query text through the [`EmbeddingClient`]
//! trait. The concrete adapter posts one request per text to the configured
//! endpoint (`{"inputText": …}` in, `{"embedding": […]}` out). Guarantees:
//! order-preserving, one vector per input. A per-item failure substitutes an
//! empty vector and logs a warning; the vector store skips empty vectors, so
//! a partially failed batch degrades retrieval coverage instead of aborting
//! the request.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Client-side configuration prevented the request.
    #[error("Embedding client misconfigured: {0}")]
    Configuration(String),
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for each supplied text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;

    /// Declared dimensionality of produced vectors.
    fn dimension(&self) -> usize;
}

/// Embedding client speaking the text-embedding HTTP endpoint.
pub struct HttpEmbeddingClient {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) model: String,
    pub(crate) dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    /// Construct a client using the supplied connection settings.
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, EmbeddingClientError> {
        if dimension == 0 {
            return Err(EmbeddingClientError::Configuration(
                "embedding dimension must be greater than zero".into(),
            ));
        }
        let client = Client::builder()
            .user_agent("agromine/embedding")
            .timeout(timeout)
            .build()
            .map_err(|err| EmbeddingClientError::Configuration(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimension,
        })
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        let mut request = self
            .client
            .post(format!("{}/embed", self.base_url))
            .json(&json!({ "model": self.model, "inputText": text }));
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            request = request.header("x-api-key", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| EmbeddingClientError::GenerationFailed(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingClientError::GenerationFailed(format!(
                "{status}: {body}"
            )));
        }

        let payload: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| EmbeddingClientError::GenerationFailed(err.to_string()))?;
        Ok(payload.embedding)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        tracing::debug!(
            model = %self.model,
            dimension = self.dimension,
            count = texts.len(),
            "Generating embeddings"
        );

        let mut embeddings = Vec::with_capacity(texts.len());
        for text in &texts {
            match self.embed_one(text).await {
                Ok(vector) => embeddings.push(vector),
                Err(error) => {
                    // A per-item failure keeps its slot as an empty vector so
                    // the output stays one-to-one with the input.
                    tracing::warn!(error = %error, "Embedding failed for one text; substituting empty vector");
                    embeddings.push(Vec::new());
                }
            }
        }
        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic embedding client used by tests and offline development.
///
/// Hashes byte content into a normalized fixed-dimension vector; identical
/// inputs always produce identical vectors.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a deterministic client with the given dimensionality.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        if text.is_empty() {
            return embedding;
        }
        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % self.dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }
        embedding
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn test_client(base_url: String) -> HttpEmbeddingClient {
        HttpEmbeddingClient::new(
            base_url,
            None,
            "text-embed-v2".into(),
            4,
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn embeddings_preserve_input_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed").body_contains("alpha");
                then.status(200)
                    .json_body(json!({ "embedding": [1.0, 0.0, 0.0, 0.0] }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed").body_contains("beta");
                then.status(200)
                    .json_body(json!({ "embedding": [0.0, 1.0, 0.0, 0.0] }));
            })
            .await;

        let client = test_client(server.base_url());
        let vectors = client
            .generate_embeddings(vec!["alpha".into(), "beta".into()])
            .await
            .expect("embeddings");

        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn per_item_failure_substitutes_empty_vector() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed").body_contains("good");
                then.status(200)
                    .json_body(json!({ "embedding": [0.5, 0.5, 0.0, 0.0] }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embed").body_contains("bad");
                then.status(500).body("provider exploded");
            })
            .await;

        let client = test_client(server.base_url());
        let vectors = client
            .generate_embeddings(vec!["good".into(), "bad".into()])
            .await
            .expect("embeddings");

        assert_eq!(vectors.len(), 2);
        assert!(!vectors[0].is_empty());
        assert!(vectors[1].is_empty());
    }

    #[tokio::test]
    async fn empty_input_is_rejected() {
        let client = HashEmbeddingClient::new(8);
        let err = client.generate_embeddings(Vec::new()).await.unwrap_err();
        assert!(matches!(err, EmbeddingClientError::GenerationFailed(_)));
    }

    #[tokio::test]
    async fn hash_client_is_deterministic() {
        let client = HashEmbeddingClient::new(16);
        let first = client
            .generate_embeddings(vec!["same input".into()])
            .await
            .expect("vectors");
        let second = client
            .generate_embeddings(vec!["same input".into()])
            .await
            .expect("vectors");
        assert_eq!(first, second);
        assert_eq!(first[0].len(), 16);
    }
}
