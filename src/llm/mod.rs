//! LLM invocation with single-shot and streaming entry points.
//!
//! Generation calls post an Anthropic-style messages body to the configured
//! endpoint. `invoke` blocks until the full completion; `stream` yields text
//! fragments parsed from the server-sent event stream. Dropping the stream
//! cancels the underlying call. Transient failures are retried inside the
//! client with exponential backoff; every other error kind surfaces to the
//! caller unchanged.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

/// Default sampling temperature used by the pipelines.
pub const DEFAULT_TEMPERATURE: f32 = 0.1;

/// Errors surfaced by LLM backends.
#[derive(Debug, Error)]
pub enum LlmError {
    /// The request was malformed or rejected by validation.
    #[error("Invalid LLM request: {0}")]
    InvalidRequest(String),
    /// The prompt exceeded the provider's context budget.
    #[error("Prompt exceeds the model context limit")]
    ContextLimitExceeded,
    /// Credentials were rejected.
    #[error("LLM access denied: {0}")]
    AuthDenied(String),
    /// The provider is temporarily unable to serve requests.
    #[error("LLM service unavailable: {0}")]
    ServiceUnavailable(String),
    /// A failure that may succeed on retry.
    #[error("Transient LLM failure: {0}")]
    Transient(String),
}

impl LlmError {
    /// Whether the client may retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

/// Interface implemented by generation backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Invoke the model and block until the completion is available.
    async fn invoke(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError>;

    /// Invoke the model and yield completion fragments as they arrive.
    ///
    /// The stream is finite and not restartable; dropping it terminates the
    /// upstream call.
    async fn stream(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError>;
}

/// LLM client speaking the messages HTTP endpoint.
pub struct HttpLlmClient {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) model: String,
    pub(crate) max_retries: usize,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl HttpLlmClient {
    /// Construct a client using the supplied connection settings.
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        max_retries: usize,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let client = Client::builder()
            .user_agent("agromine/llm")
            .timeout(timeout)
            .build()
            .map_err(|err| LlmError::Transient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            max_retries,
        })
    }

    fn request_body(&self, prompt: &str, max_tokens: u32, temperature: f32, stream: bool) -> Value {
        json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "top_k": 250,
            "top_p": 0.999,
            "stop_sequences": [],
            "stream": stream,
            "messages": [
                {
                    "role": "user",
                    "content": [ { "type": "text", "text": prompt } ]
                }
            ]
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let mut request = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .json(body);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            request = request.header("x-api-key", api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

/// Map an HTTP failure onto the error taxonomy.
fn classify_status(status: StatusCode, body: String) -> LlmError {
    match status {
        StatusCode::BAD_REQUEST => {
            let lowered = body.to_lowercase();
            if lowered.contains("context") && (lowered.contains("long") || lowered.contains("exceed"))
            {
                LlmError::ContextLimitExceeded
            } else {
                LlmError::InvalidRequest(body)
            }
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthDenied(body),
        StatusCode::TOO_MANY_REQUESTS => LlmError::Transient(format!("{status}: {body}")),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            LlmError::ServiceUnavailable(format!("{status}: {body}"))
        }
        status if status.is_server_error() => LlmError::Transient(format!("{status}: {body}")),
        status => LlmError::InvalidRequest(format!("{status}: {body}")),
    }
}

/// Extract a text fragment from one server-sent event line, if it carries one.
fn parse_sse_line(line: &str) -> Option<String> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let event: Value = serde_json::from_str(data).ok()?;
    let fragment = event.get("delta")?.get("text")?.as_str()?;
    if fragment.is_empty() {
        None
    } else {
        Some(fragment.to_string())
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn invoke(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        tracing::debug!(model = %self.model, max_tokens, "Invoking the model");
        let body = self.request_body(prompt, max_tokens, temperature, false);

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, delay_secs = delay.as_secs(), "Retrying LLM invocation");
                tokio::time::sleep(delay).await;
            }

            match self.send(&body).await {
                Ok(response) => {
                    let payload: MessagesResponse = response
                        .json()
                        .await
                        .map_err(|err| LlmError::Transient(err.to_string()))?;
                    let text: String = payload
                        .content
                        .into_iter()
                        .map(|block| block.text)
                        .collect();
                    return Ok(text);
                }
                Err(error) if error.is_retryable() => last_error = Some(error),
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Transient("retries exhausted".into())))
    }

    async fn stream(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, LlmError> {
        tracing::debug!(model = %self.model, max_tokens, "Invoking the model with a response stream");
        let body = self.request_body(prompt, max_tokens, temperature, true);
        let response = self.send(&body).await?;
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            while let Some(piece) = bytes.next().await {
                match piece {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(newline) = buffer.find('\n') {
                            let line = buffer[..newline].trim_end_matches('\r').to_string();
                            buffer.drain(..=newline);
                            if let Some(fragment) = parse_sse_line(&line) {
                                yield Ok(fragment);
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(LlmError::Transient(err.to_string()));
                        break;
                    }
                }
            }
            if let Some(fragment) = parse_sse_line(buffer.trim_end()) {
                yield Ok(fragment);
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn test_client(base_url: String, max_retries: usize) -> HttpLlmClient {
        HttpLlmClient::new(
            base_url,
            Some("key".into()),
            "claude-test".into(),
            max_retries,
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn invoke_concatenates_content_blocks() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/messages")
                    .header("x-api-key", "key")
                    .body_contains("claude-test");
                then.status(200).json_body(json!({
                    "content": [
                        { "type": "text", "text": "Hello " },
                        { "type": "text", "text": "world" }
                    ]
                }));
            })
            .await;

        let client = test_client(server.base_url(), 0);
        let text = client.invoke("say hello", 256, 0.1).await.expect("text");

        mock.assert();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn invoke_retries_transient_failures() {
        let server = MockServer::start_async().await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(429).body("rate limited");
            })
            .await;

        let client = test_client(server.base_url(), 1);
        let err = client.invoke("prompt", 64, 0.1).await.unwrap_err();
        assert!(matches!(err, LlmError::Transient(_)));
        assert_eq!(failing.hits(), 2);
    }

    #[tokio::test]
    async fn auth_failures_are_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(403).body("bad key");
            })
            .await;

        let client = test_client(server.base_url(), 5);
        let err = client.invoke("prompt", 64, 0.1).await.unwrap_err();
        assert!(matches!(err, LlmError::AuthDenied(_)));
        assert_eq!(mock.hits(), 1);
    }

    #[tokio::test]
    async fn context_overflow_maps_to_dedicated_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages");
                then.status(400).body("prompt context is too long for this model");
            })
            .await;

        let client = test_client(server.base_url(), 0);
        let err = client.invoke("prompt", 64, 0.1).await.unwrap_err();
        assert!(matches!(err, LlmError::ContextLimitExceeded));
    }

    #[tokio::test]
    async fn stream_yields_delta_fragments_in_order() {
        let server = MockServer::start_async().await;
        let sse_body = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\"}\n",
            "\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"The \"}}\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"report\"}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/messages").body_contains("\"stream\":true");
                then.status(200).body(sse_body);
            })
            .await;

        let client = test_client(server.base_url(), 0);
        let mut stream = client.stream("prompt", 64, 0.1).await.expect("stream");

        let mut fragments = Vec::new();
        while let Some(item) = stream.next().await {
            fragments.push(item.expect("fragment"));
        }
        assert_eq!(fragments, vec!["The ".to_string(), "report".to_string()]);
    }

    #[test]
    fn sse_parser_ignores_non_delta_lines() {
        assert_eq!(parse_sse_line("event: ping"), None);
        assert_eq!(parse_sse_line("data: [DONE]"), None);
        assert_eq!(parse_sse_line("data: {\"type\":\"message_stop\"}"), None);
        assert_eq!(
            parse_sse_line("data: {\"delta\":{\"text\":\"hi\"}}"),
            Some("hi".to_string())
        );
    }
}
