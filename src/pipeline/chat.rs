//! Conversational pipeline: session-scoped retrieval over the chat corpus.
//!
//! User-facing filters are normalized into retrieval arguments (phase splits
//! into year and phase type, sections map onto allowed source tables, "All"
//! values drop the filter entirely), retrieval width scales with filter
//! specificity, and successive turns with one `session_id` share history and
//! are serialized through a per-session lock. The user id namespaces session
//! memory across sessions.

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::embedding::EmbeddingClient;
use crate::ingest::{IngestionScheduler, physical_table};
use crate::llm::{DEFAULT_TEMPERATURE, LlmClient, LlmError};
use crate::prompts;
use crate::tracker::{InteractionTracker, TrackRequest};
use crate::vector::{
    Corpus, RetrievalFilterArgs, VectorStore, drop_shared_cluster_rows, filter_phase_type, scale_k,
};

use super::PipelineError;

/// Token budget for conversational answers.
const CHAT_MAX_TOKENS: u32 = 8_000;
/// Turns of history carried into the prompt.
const HISTORY_TURNS: usize = 5;

/// User-facing retrieval filters.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ChatFilters {
    /// Phase label, e.g. `Progress 2025`, or `All phases`.
    pub phase: Option<String>,
    /// Indicator acronym, or `All indicators`.
    pub indicator: Option<String>,
    /// Section label, or `All sections`.
    pub section: Option<String>,
}

/// One conversational turn request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// The user's message.
    pub message: String,
    /// Active sidebar filters.
    pub filters: ChatFilters,
    /// Session grouping successive turns.
    pub session_id: String,
    /// User identifier namespacing memory across sessions.
    pub user_id: String,
    /// Rebuild the chat corpus before answering.
    pub refresh: bool,
}

/// Normalized query plan derived from the user-facing filters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatQueryPlan {
    /// Attribute filters pushed down to the vector store.
    pub args: RetrievalFilterArgs,
    /// Phase type applied in-process to contribution and question rows.
    pub phase_type: Option<String>,
    /// Retrieval width.
    pub k: usize,
}

/// Translate sidebar filters into a retrieval plan.
///
/// `All phases`/`All indicators`/`All sections` (and absent values) drop the
/// corresponding filter; `k` widens once at least two concrete filters are
/// set.
pub fn translate_filters(filters: &ChatFilters) -> ChatQueryPlan {
    let phase = concrete(filters.phase.as_deref(), "All phases");
    let indicator = concrete(filters.indicator.as_deref(), "All indicators");
    let section = concrete(filters.section.as_deref(), "All sections");

    let specificity = usize::from(phase.is_some())
        + usize::from(indicator.is_some())
        + usize::from(section.is_some());

    let (year, phase_type) = match phase {
        Some(phase) => {
            let year = phase
                .split_whitespace()
                .find(|token| token.chars().all(|c| c.is_ascii_digit()))
                .map(str::to_string);
            let phase_type = ["Progress", "AWPB", "AR"]
                .iter()
                .find(|candidate| phase.split_whitespace().any(|token| token == **candidate))
                .map(|candidate| candidate.to_string());
            (year, phase_type)
        }
        None => (None, None),
    };

    let logical_tables: Vec<&str> = match section {
        Some("Deliverables") => vec!["deliverables"],
        Some("OICRs") => vec!["oicrs"],
        Some("Innovations") => vec!["innovations"],
        Some("Contributions") => vec!["contributions", "questions"],
        _ => vec![
            "deliverables",
            "contributions",
            "oicrs",
            "innovations",
            "questions",
        ],
    };
    let source_tables = logical_tables
        .into_iter()
        .filter_map(physical_table)
        .map(str::to_string)
        .collect();

    ChatQueryPlan {
        args: RetrievalFilterArgs {
            indicator: indicator.map(str::to_string),
            year,
            source_tables: Some(source_tables),
            document_name: None,
        },
        phase_type,
        k: scale_k(specificity),
    }
}

fn concrete<'a>(value: Option<&'a str>, all_marker: &str) -> Option<&'a str> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty() && *value != all_marker && !value.contains("None"))
}

#[derive(Default)]
struct SessionState {
    history: Vec<Turn>,
}

struct Turn {
    user: String,
    assistant: String,
}

/// Session memory: one lock-protected state per `(user, session)` pair.
#[derive(Default)]
pub struct SessionMemory {
    sessions: Mutex<HashMap<(String, String), Arc<Mutex<SessionState>>>>,
}

impl SessionMemory {
    async fn session(&self, user_namespace: &str, session_id: &str) -> Arc<Mutex<SessionState>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry((user_namespace.to_string(), session_id.to_string()))
            .or_default()
            .clone()
    }
}

/// Orchestrates conversational turns over the chat corpus.
pub struct ChatService {
    store: Arc<VectorStore>,
    embedding: Arc<dyn EmbeddingClient>,
    llm: Arc<dyn LlmClient>,
    scheduler: Arc<IngestionScheduler>,
    tracker: Arc<InteractionTracker>,
    sessions: SessionMemory,
}

impl ChatService {
    /// Assemble the service from its collaborators.
    pub fn new(
        store: Arc<VectorStore>,
        embedding: Arc<dyn EmbeddingClient>,
        llm: Arc<dyn LlmClient>,
        scheduler: Arc<IngestionScheduler>,
        tracker: Arc<InteractionTracker>,
    ) -> Self {
        Self {
            store,
            embedding,
            llm,
            scheduler,
            tracker,
            sessions: SessionMemory::default(),
        }
    }

    /// Answer one conversational turn as a fragment stream.
    ///
    /// The per-session lock is held until the stream completes, so concurrent
    /// turns on one session are processed in receipt order.
    pub async fn respond(
        &self,
        request: ChatRequest,
    ) -> Result<BoxStream<'static, Result<String, LlmError>>, PipelineError> {
        if request.message.trim().is_empty() {
            return Err(PipelineError::InvalidInput("message is required".into()));
        }
        if request.session_id.trim().is_empty() || request.user_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "session_id and user_id are required".into(),
            ));
        }

        if request.refresh {
            self.scheduler.rebuild(Corpus::Chat, true).await?;
        }

        let started = Instant::now();
        let user_namespace = hash_user(&request.user_id);
        let session = self.sessions.session(&user_namespace, &request.session_id).await;
        let mut guard = session.lock_owned().await;

        let plan = translate_filters(&request.filters);
        let phase_label = request.filters.phase.clone().unwrap_or_else(|| "All phases".into());
        let indicator_label = request
            .filters
            .indicator
            .clone()
            .unwrap_or_else(|| "All indicators".into());
        let section_label = request
            .filters
            .section
            .clone()
            .unwrap_or_else(|| "All sections".into());

        let input_text = prompts::chat_input_with_filters(
            &request.message,
            &phase_label,
            &indicator_label,
            &section_label,
        );
        let context = self.retrieve(&input_text, &plan).await?;
        tracing::info!(
            session = %request.session_id,
            k = plan.k,
            context = context.len(),
            "Chat context retrieved"
        );

        let history = render_history(&guard.history);
        let prompt = compose_chat_prompt(
            &prompts::chatbot_prompt(&phase_label, &indicator_label, &section_label),
            &history,
            &request.message,
            &context.join("\n"),
        );

        let mut inner = self
            .llm
            .stream(&prompt, CHAT_MAX_TOKENS, DEFAULT_TEMPERATURE)
            .await?;

        let tracker = self.tracker.clone();
        let stream = async_stream::stream! {
            let mut answer = String::new();
            while let Some(fragment) = inner.next().await {
                match fragment {
                    Ok(text) => {
                        answer.push_str(&text);
                        yield Ok(text);
                    }
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }

            guard.history.push(Turn {
                user: request.message.clone(),
                assistant: answer.clone(),
            });

            if !answer.trim().is_empty() {
                let track_request = TrackRequest {
                    user_id: user_namespace.clone(),
                    session_id: Some(request.session_id.clone()),
                    service_name: "chatbot".into(),
                    user_input: Some(request.message.clone()),
                    ai_output: answer,
                    context: json!({
                        "filters_applied": {
                            "phase": phase_label,
                            "indicator": indicator_label,
                            "section": section_label,
                        },
                        "session_length": guard.history.len(),
                    }),
                    response_time_seconds: Some(started.elapsed().as_secs_f64()),
                    ..Default::default()
                };
                if let Err(error) = tracker.track(track_request).await {
                    tracing::error!(error = %error, "Interaction tracking failed");
                }
            }
            drop(guard);
        };

        Ok(Box::pin(stream))
    }

    async fn retrieve(
        &self,
        query: &str,
        plan: &ChatQueryPlan,
    ) -> Result<Vec<String>, PipelineError> {
        let mut vectors = self
            .embedding
            .generate_embeddings(vec![query.to_string()])
            .await?;
        let query_vector = vectors.pop().unwrap_or_default();
        if query_vector.is_empty() {
            tracing::warn!("Query embedding unavailable; answering without retrieved context");
            return Ok(Vec::new());
        }

        let hits = self
            .store
            .knn(Corpus::Chat, query_vector, plan.k, &plan.args)
            .await?;
        let chunks = drop_shared_cluster_rows(filter_phase_type(
            hits.into_iter().map(|hit| hit.chunk).collect(),
            plan.phase_type.as_deref(),
        ));
        Ok(chunks.into_iter().map(|chunk| chunk.text).collect())
    }
}

fn compose_chat_prompt(system: &str, history: &str, message: &str, context: &str) -> String {
    format!(
        r#"{system}

---

Conversation so far:
{history}

The user asked the following question:
"""{message}"""

Use ONLY the following retrieved context to answer the question.
If the context does not have enough information, clearly say so and suggest a broader search.

Retrieved context:
{context}

Now, provide the best possible answer."#
    )
}

fn render_history(history: &[Turn]) -> String {
    if history.is_empty() {
        return "(new session)".to_string();
    }
    history
        .iter()
        .rev()
        .take(HISTORY_TURNS)
        .rev()
        .map(|turn| format!("User: {}\nAssistant: {}", turn.user, turn.assistant))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Stable, anonymized namespace for a user's session memory.
pub fn hash_user(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hex::encode(hasher.finalize())
}
