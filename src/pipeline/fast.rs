//! Fast-response pipeline: a single generation call without retrieval.
//!
//! Used for lightweight editorial tasks (summarize, rewrite, improve) where
//! pulling corpus context would add latency without adding evidence. The
//! request carries its own instruction and input text; the pipeline composes
//! them, invokes the model once and tracks the interaction.

use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::llm::{DEFAULT_TEMPERATURE, LlmClient};
use crate::tracker::{InteractionTracker, TrackRequest};

use super::PipelineError;

/// Token budget for fast responses.
const FAST_MAX_TOKENS: u32 = 2_000;

/// One fast-response request.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct FastRequest {
    /// Instruction for the model (e.g. "Summarize the text in 3 lines").
    pub prompt: String,
    /// Text the instruction applies to.
    pub input_text: String,
    /// User on whose behalf the request runs.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Result of one fast-response request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FastOutcome {
    /// The instruction that was applied.
    pub prompt: String,
    /// The input text the instruction was applied to.
    pub input_text: String,
    /// Generated output.
    pub output: String,
    /// Wall-clock processing time in seconds.
    pub time_taken: f64,
    /// Interaction id assigned by the tracker, when tracking succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
}

/// Orchestrates single-shot editorial generations.
pub struct FastResponseService {
    llm: Arc<dyn LlmClient>,
    tracker: Arc<InteractionTracker>,
}

impl FastResponseService {
    /// Assemble the service from its collaborators.
    pub fn new(llm: Arc<dyn LlmClient>, tracker: Arc<InteractionTracker>) -> Self {
        Self { llm, tracker }
    }

    /// Apply the instruction to the input text.
    pub async fn respond(&self, request: FastRequest) -> Result<FastOutcome, PipelineError> {
        if request.prompt.trim().is_empty() {
            return Err(PipelineError::InvalidInput("prompt cannot be empty".into()));
        }
        if request.input_text.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "input_text cannot be empty".into(),
            ));
        }

        let started = Instant::now();
        let composed = format!(
            "{}\n\nApply the instruction above to the following text and return only the result:\n\n{}",
            request.prompt.trim(),
            request.input_text
        );
        let output = self
            .llm
            .invoke(&composed, FAST_MAX_TOKENS, DEFAULT_TEMPERATURE)
            .await?;
        let time_taken = started.elapsed().as_secs_f64();

        let interaction_id = match self
            .tracker
            .track(TrackRequest {
                user_id: request
                    .user_id
                    .clone()
                    .unwrap_or_else(|| "anonymous".to_string()),
                service_name: "fast-response".into(),
                user_input: Some(request.prompt.clone()),
                ai_output: output.clone(),
                context: json!({ "input_length": request.input_text.len() }),
                response_time_seconds: Some(time_taken),
                ..Default::default()
            })
            .await
        {
            Ok(interaction_id) => Some(interaction_id),
            Err(error) => {
                tracing::error!(error = %error, "Interaction tracking failed");
                None
            }
        };

        tracing::info!(time_taken, "Fast response generated");
        Ok(FastOutcome {
            prompt: request.prompt,
            input_text: request.input_text,
            output,
            time_taken,
            interaction_id,
        })
    }
}
