//! HTTP surface for the AgroMine services.
//!
//! Each endpoint maps 1:1 onto a pipeline operation and answers with the
//! standard envelope: `{"status": "success", ...payload}` on success and
//! `{"status": "error", "error": ..., "details": ...}` on failure, with the
//! status code derived from the error taxonomy:
//!
//! - `POST /api/mine` and `POST /api/mine/bulk` run the extraction pipeline.
//! - `POST /api/report` and `POST /api/report/stream` run the report pipeline.
//! - `GET /api/report/challenges` renders the challenges report.
//! - `GET /api/report/tables` builds the per-family indicator overview tables.
//! - `POST /api/chat` streams a conversational answer.
//! - `POST /api/map/fields` resolves names to canonical identifiers.
//! - `POST /api/interactions` tracks interactions and records feedback.
//! - `GET /api/interactions/summary` and `GET /api/interactions/search`
//!   expose tracker analytics.
//! - `POST /api/ingest` rebuilds a vector corpus from the record source.
//! - `GET /api/health` reports liveness.

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::config::Project;
use crate::ingest::IngestionScheduler;
use crate::mapping::{MappingClient, MappingRequestEntry};
use crate::pipeline::PipelineError;
use crate::pipeline::chat::{ChatFilters, ChatRequest, ChatService};
use crate::pipeline::extract::{ExtractionService, MiningRequest, MiningTask};
use crate::pipeline::fast::{FastRequest, FastResponseService};
use crate::pipeline::report::{ReportRequest, ReportService};
use crate::tracker::{FeedbackKind, InteractionTracker, SearchFilters, SortOrder, TrackRequest};
use crate::vector::Corpus;

/// Shared service handles behind the router.
pub struct AppState {
    /// Extraction pipeline.
    pub extraction: Arc<ExtractionService>,
    /// Report pipeline.
    pub report: Arc<ReportService>,
    /// Conversational pipeline.
    pub chat: Arc<ChatService>,
    /// Fast-response pipeline.
    pub fast: Arc<FastResponseService>,
    /// Mapping client.
    pub mapping: Arc<MappingClient>,
    /// Interaction tracker.
    pub tracker: Arc<InteractionTracker>,
    /// Ingestion scheduler.
    pub scheduler: Arc<IngestionScheduler>,
}

/// Build the HTTP router exposing the pipeline API surface.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/mine", post(mine_document))
        .route("/api/mine/bulk", post(mine_bulk))
        .route("/api/report", post(generate_report))
        .route("/api/report/stream", post(stream_report))
        .route("/api/report/challenges", get(challenges_report))
        .route("/api/report/tables", get(indicator_tables))
        .route("/api/chat", post(chat_turn))
        .route("/api/fast-response", post(fast_response))
        .route("/api/map/fields", post(map_fields))
        .route(
            "/api/interactions",
            post(track_interaction),
        )
        .route("/api/interactions/summary", get(interactions_summary))
        .route("/api/interactions/search", get(interactions_search))
        .route("/api/ingest", post(run_ingestion))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Error wrapper mapping the pipeline taxonomy onto status codes and the
/// response envelope.
pub struct AppError(PipelineError);

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelineError::InvalidInput(_) | PipelineError::ContextLimit => {
                StatusCode::BAD_REQUEST
            }
            PipelineError::AuthDenied => StatusCode::FORBIDDEN,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match &self.0 {
            PipelineError::InvalidInput(_) => "Invalid parameters",
            PipelineError::ContextLimit => "Context limit exceeded",
            PipelineError::AuthDenied => "Access denied",
            PipelineError::NotFound(_) => "Not found",
            PipelineError::Unavailable(_) => "Upstream unavailable",
            PipelineError::Timeout => "Request timed out",
            PipelineError::Internal(_) => "Internal error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "status": "error",
            "error": self.label(),
            "details": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(inner: PipelineError) -> Self {
        Self(inner)
    }
}

impl From<crate::tracker::TrackerError> for AppError {
    fn from(inner: crate::tracker::TrackerError) -> Self {
        Self(inner.into())
    }
}

fn success(mut payload: Value) -> Json<Value> {
    if let Some(object) = payload.as_object_mut() {
        object.insert("status".into(), Value::String("success".into()));
    }
    Json(payload)
}

fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get("access-token")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Request body for the mining endpoints.
#[derive(Deserialize)]
struct MineBody {
    /// Project key (`star` or `prms`); defaults to STAR.
    #[serde(default)]
    project: Option<String>,
    /// Bucket holding the document.
    bucket: String,
    /// Object key of the document.
    key: String,
    /// User on whose behalf the request runs.
    #[serde(default)]
    user_id: Option<String>,
}

impl MineBody {
    fn into_request(self, headers: &HeaderMap, task: MiningTask) -> Result<MiningRequest, AppError> {
        let project = match self.project.as_deref() {
            None => Project::Star,
            Some(raw) => raw.parse().map_err(|()| {
                AppError(PipelineError::InvalidInput(format!(
                    "unknown project: {raw}"
                )))
            })?,
        };
        if self.bucket.trim().is_empty() || self.key.trim().is_empty() {
            return Err(AppError(PipelineError::InvalidInput(
                "bucket and key are required".into(),
            )));
        }
        Ok(MiningRequest {
            project,
            bucket: self.bucket,
            key: self.key,
            token: bearer_token(headers),
            user_id: self.user_id,
            task,
        })
    }
}

async fn mine_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MineBody>,
) -> Result<Json<Value>, AppError> {
    let request = body.into_request(&headers, MiningTask::Standard)?;
    let outcome = state.extraction.process_document(request).await?;
    Ok(success(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn mine_bulk(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MineBody>,
) -> Result<Json<Value>, AppError> {
    let request = body.into_request(&headers, MiningTask::BulkUpload)?;
    let outcome = state.extraction.process_document(request).await?;
    Ok(success(serde_json::to_value(outcome).unwrap_or_default()))
}

/// Request body for the report endpoints.
#[derive(Deserialize)]
struct ReportBody {
    indicator: String,
    year: String,
    #[serde(default)]
    insert_data: bool,
    #[serde(default)]
    user_id: Option<String>,
}

impl From<ReportBody> for ReportRequest {
    fn from(body: ReportBody) -> Self {
        ReportRequest {
            indicator: body.indicator,
            year: body.year,
            insert_data: body.insert_data,
            user_id: body.user_id,
        }
    }
}

async fn generate_report(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReportBody>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.report.generate(body.into()).await?;
    Ok(success(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn stream_report(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReportBody>,
) -> Result<Response, AppError> {
    let stream = state.report.stream(body.into()).await?;
    let bytes = stream.map(|fragment| fragment.map(Bytes::from));
    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        Body::from_stream(bytes),
    )
        .into_response())
}

#[derive(Deserialize)]
struct ChallengesQuery {
    year: String,
}

async fn challenges_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChallengesQuery>,
) -> Result<Json<Value>, AppError> {
    let report = state.report.challenges(&query.year).await?;
    Ok(success(json!({ "report": report })))
}

async fn indicator_tables(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChallengesQuery>,
) -> Result<Json<Value>, AppError> {
    let tables = state.report.indicator_tables(&query.year).await?;
    Ok(success(json!({ "year": query.year, "tables": tables })))
}

/// Request body for the chat endpoint.
#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    indicator: Option<String>,
    #[serde(default)]
    section: Option<String>,
    session_id: String,
    user_id: String,
    #[serde(default)]
    refresh: bool,
}

async fn chat_turn(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    let request = ChatRequest {
        message: body.message,
        filters: ChatFilters {
            phase: body.phase,
            indicator: body.indicator,
            section: body.section,
        },
        session_id: body.session_id,
        user_id: body.user_id,
        refresh: body.refresh,
    };
    let stream = state.chat.respond(request).await?;
    let bytes = stream.map(|fragment| fragment.map(Bytes::from));
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(bytes),
    )
        .into_response())
}

async fn fast_response(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FastRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = state.fast.respond(body).await?;
    Ok(success(serde_json::to_value(outcome).unwrap_or_default()))
}

/// Request body for the mapping endpoint.
#[derive(Deserialize)]
struct MapFieldsBody {
    entries: Vec<MappingRequestEntry>,
}

async fn map_fields(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MapFieldsBody>,
) -> Result<Json<Value>, AppError> {
    if body.entries.is_empty() {
        return Err(AppError(PipelineError::InvalidInput(
            "entries must not be empty".into(),
        )));
    }
    let results = state.mapping.resolve_with_retry(&body.entries).await;
    Ok(success(json!({ "results": results })))
}

/// Request body for the dual-mode interactions endpoint.
#[derive(Deserialize)]
struct InteractionBody {
    #[serde(default)]
    update_mode: bool,
    #[serde(default)]
    interaction_id: Option<String>,
    #[serde(default)]
    feedback_type: Option<FeedbackKind>,
    #[serde(default)]
    feedback_comment: Option<String>,
    #[serde(flatten)]
    track: TrackRequest,
}

async fn track_interaction(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InteractionBody>,
) -> Result<Json<Value>, AppError> {
    if body.update_mode {
        let interaction_id = body.interaction_id.ok_or_else(|| {
            AppError(PipelineError::InvalidInput(
                "interaction_id is required in update mode".into(),
            ))
        })?;
        let kind = body.feedback_type.ok_or_else(|| {
            AppError(PipelineError::InvalidInput(
                "feedback_type is required in update mode".into(),
            ))
        })?;
        state
            .tracker
            .update(&interaction_id, kind, body.feedback_comment)
            .await?;
        return Ok(success(json!({
            "interaction_id": interaction_id,
            "message": "Feedback recorded",
        })));
    }

    let interaction_id = state.tracker.track(body.track).await?;
    Ok(success(json!({ "interaction_id": interaction_id })))
}

#[derive(Deserialize)]
struct SummaryQuery {
    #[serde(default)]
    service_name: Option<String>,
}

async fn interactions_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Value>, AppError> {
    let summary = state.tracker.summary(query.service_name.as_deref()).await?;
    Ok(success(serde_json::to_value(summary).unwrap_or_default()))
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    feedback: Option<FeedbackKind>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
    #[serde(default)]
    sort: SortOrder,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

async fn interactions_search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, AppError> {
    let filters = SearchFilters {
        service_name: query.service_name,
        user_id: query.user_id,
        session_id: query.session_id,
        feedback: query.feedback,
    };
    let interactions = state
        .tracker
        .search(&filters, query.page, query.page_size, query.sort)
        .await?;
    Ok(success(json!({
        "total": interactions.len(),
        "interactions": interactions,
    })))
}

/// Request body for the ingestion endpoint.
#[derive(Deserialize)]
struct IngestBody {
    /// Target corpus: `reference` or `chat`.
    corpus: String,
    #[serde(default)]
    refresh: bool,
}

async fn run_ingestion(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> Result<Json<Value>, AppError> {
    let corpus = match body.corpus.to_lowercase().as_str() {
        "reference" => Corpus::Reference,
        "chat" => Corpus::Chat,
        other => {
            return Err(AppError(PipelineError::InvalidInput(format!(
                "unknown corpus: {other}"
            ))));
        }
    };
    let outcome = run_scheduler(&state.scheduler, corpus, body.refresh).await?;
    Ok(success(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn run_scheduler(
    scheduler: &IngestionScheduler,
    corpus: Corpus,
    refresh: bool,
) -> Result<crate::ingest::IngestOutcome, AppError> {
    scheduler
        .rebuild(corpus, refresh)
        .await
        .map_err(|error| AppError(error.into()))
}

async fn health() -> Json<Value> {
    success(json!({ "service": "agromine" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_taxonomy_maps_to_status_classes() {
        let cases = [
            (PipelineError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::ContextLimit, StatusCode::BAD_REQUEST),
            (PipelineError::AuthDenied, StatusCode::FORBIDDEN),
            (PipelineError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                PipelineError::Unavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (PipelineError::Timeout, StatusCode::GATEWAY_TIMEOUT),
            (
                PipelineError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError(error).status(), expected);
        }
    }

    #[test]
    fn success_envelope_sets_status_field() {
        let Json(body) = success(json!({ "value": 7 }));
        assert_eq!(body["status"], "success");
        assert_eq!(body["value"], 7);
    }

    #[test]
    fn context_limit_message_carries_a_hint() {
        let AppError(error) = AppError(PipelineError::ContextLimit);
        assert!(error.to_string().contains("shorten the query"));
    }
}
