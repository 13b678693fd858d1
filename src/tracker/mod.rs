//! Interaction tracking and feedback routing.
//!
//! Every request/response pair handled by the pipelines is recorded as an
//! interaction. Feedback is appended later through an update keyed by the
//! server-assigned interaction id; negative feedback fans out to the notifier
//! with the full interaction payload. Records are persisted in SQLite and
//! sharded per deployment environment through the table name, so test and
//! production traffic never mix.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::config::Environment;
use crate::notify::Notifier;

/// Errors raised by the interaction tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// No interaction exists with the given id.
    #[error("Interaction not found: {0}")]
    NotFound(String),
    /// The request payload failed validation.
    #[error("Invalid interaction payload: {0}")]
    InvalidInput(String),
    /// The underlying store failed.
    #[error("Interaction store failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// Feedback polarity attached to an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    /// The user endorsed the response.
    Positive,
    /// The user flagged the response.
    Negative,
}

impl FeedbackKind {
    fn as_str(self) -> &'static str {
        match self {
            FeedbackKind::Positive => "positive",
            FeedbackKind::Negative => "negative",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "positive" => Some(FeedbackKind::Positive),
            "negative" => Some(FeedbackKind::Negative),
            _ => None,
        }
    }
}

/// Payload for creating a new interaction record.
///
/// Deserialization is lenient (missing fields default to empty) so the
/// dual-mode HTTP endpoint can flatten it next to feedback-update fields;
/// [`InteractionTracker::track`] rejects blank required fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackRequest {
    /// User identifier supplied by the frontend.
    pub user_id: String,
    /// Session grouping conversational turns, when applicable.
    pub session_id: Option<String>,
    /// Name of the AI service that produced the output.
    pub service_name: String,
    /// Human-readable service name for first-time registration.
    pub display_name: Option<String>,
    /// Service description for first-time registration.
    pub service_description: Option<String>,
    /// Original user request or document reference.
    pub user_input: Option<String>,
    /// Complete AI-generated output.
    pub ai_output: String,
    /// Service-specific context data.
    #[serde(default)]
    pub context: Value,
    /// Processing time in seconds.
    pub response_time_seconds: Option<f64>,
}

/// Feedback attached to an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Polarity of the feedback.
    pub kind: FeedbackKind,
    /// Optional free-text comment.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comment: Option<String>,
    /// When the feedback was recorded (RFC3339).
    pub recorded_at: String,
}

/// One recorded interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Server-assigned unique identifier.
    pub interaction_id: String,
    /// User identifier supplied by the frontend.
    pub user_id: String,
    /// Session the interaction belongs to, when applicable.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    /// Name of the AI service that produced the output.
    pub service_name: String,
    /// Original user request, when captured.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_input: Option<String>,
    /// Complete AI-generated output.
    pub ai_output: String,
    /// Service-specific context data.
    pub context: Value,
    /// Processing time in seconds, when captured.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response_time_seconds: Option<f64>,
    /// Feedback appended after creation, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub feedback: Option<Feedback>,
    /// Creation timestamp (RFC3339).
    pub timestamp: String,
}

/// Aggregated analytics over interactions.
#[derive(Debug, Clone, Serialize)]
pub struct InteractionSummary {
    /// Total recorded interactions in scope.
    pub total_interactions: u64,
    /// Interactions carrying positive feedback.
    pub positive_feedback: u64,
    /// Interactions carrying negative feedback.
    pub negative_feedback: u64,
    /// Positive share of all feedback, as a percentage.
    pub satisfaction_rate: f64,
    /// Mean response time across interactions that recorded one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_response_time: Option<f64>,
    /// Per-service interaction and feedback counts.
    pub services_breakdown: BTreeMap<String, ServiceCounts>,
}

/// Interaction counts for one service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceCounts {
    /// Total interactions recorded for the service.
    pub total: u64,
    /// Positive feedback count.
    pub positive: u64,
    /// Negative feedback count.
    pub negative: u64,
}

/// Filters for interaction search queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    /// Restrict to one service.
    pub service_name: Option<String>,
    /// Restrict to one user.
    pub user_id: Option<String>,
    /// Restrict to one session.
    pub session_id: Option<String>,
    /// Restrict to interactions carrying this feedback kind.
    pub feedback: Option<FeedbackKind>,
}

/// Sort order for interaction search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Most recent interactions first.
    #[default]
    NewestFirst,
    /// Oldest interactions first.
    OldestFirst,
}

/// Interaction store over SQLite, with registry and feedback fan-out.
pub struct InteractionTracker {
    pool: SqlitePool,
    table: String,
    notifier: Arc<dyn Notifier>,
}

impl InteractionTracker {
    /// Open (or create) the backing database and ensure the schema.
    pub async fn connect(
        db_path: &str,
        environment: Environment,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, TrackerError> {
        if let Some(parent) = std::path::Path::new(db_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| TrackerError::InvalidInput(err.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let table = format!("interactions_{}", environment.table_suffix());
        let tracker = Self {
            pool,
            table,
            notifier,
        };
        tracker.ensure_schema().await?;
        Ok(tracker)
    }

    async fn ensure_schema(&self) -> Result<(), TrackerError> {
        let create_interactions = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                interaction_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT,
                service_name TEXT NOT NULL,
                user_input TEXT,
                ai_output TEXT NOT NULL,
                context TEXT NOT NULL,
                response_time_seconds REAL,
                feedback_kind TEXT,
                feedback_comment TEXT,
                feedback_recorded_at TEXT,
                created_at TEXT NOT NULL
            )",
            self.table
        );
        sqlx::query(&create_interactions).execute(&self.pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS services (
                service_name TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                description TEXT NOT NULL,
                expected_context TEXT NOT NULL,
                registered_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a new interaction and return its server-assigned id.
    ///
    /// Unknown services are auto-registered on first sight; registration
    /// races resolve first-writer-wins.
    pub async fn track(&self, request: TrackRequest) -> Result<String, TrackerError> {
        if request.user_id.trim().is_empty() {
            return Err(TrackerError::InvalidInput("user_id is required".into()));
        }
        if request.service_name.trim().is_empty() {
            return Err(TrackerError::InvalidInput("service_name is required".into()));
        }
        if request.ai_output.trim().is_empty() {
            return Err(TrackerError::InvalidInput("ai_output is required".into()));
        }

        self.register_service(
            &request.service_name,
            request.display_name.as_deref(),
            request.service_description.as_deref(),
        )
        .await?;

        let interaction_id = format!("int_{}", Uuid::new_v4());
        let created_at = now_rfc3339();
        let context = if request.context.is_null() {
            json!({})
        } else {
            request.context
        };

        let insert = format!(
            "INSERT INTO {} (interaction_id, user_id, session_id, service_name, user_input,
                             ai_output, context, response_time_seconds, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        );
        sqlx::query(&insert)
            .bind(&interaction_id)
            .bind(&request.user_id)
            .bind(&request.session_id)
            .bind(&request.service_name)
            .bind(&request.user_input)
            .bind(&request.ai_output)
            .bind(context.to_string())
            .bind(request.response_time_seconds)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            %interaction_id,
            service = %request.service_name,
            user = %request.user_id,
            "Interaction tracked"
        );
        Ok(interaction_id)
    }

    /// Attach feedback to an existing interaction.
    ///
    /// Negative feedback fans out the full interaction payload to the
    /// notifier; a delivery failure is logged and never propagated.
    pub async fn update(
        &self,
        interaction_id: &str,
        kind: FeedbackKind,
        comment: Option<String>,
    ) -> Result<(), TrackerError> {
        let recorded_at = now_rfc3339();
        let update = format!(
            "UPDATE {} SET feedback_kind = ?, feedback_comment = ?, feedback_recorded_at = ?
             WHERE interaction_id = ?",
            self.table
        );
        let outcome = sqlx::query(&update)
            .bind(kind.as_str())
            .bind(&comment)
            .bind(&recorded_at)
            .bind(interaction_id)
            .execute(&self.pool)
            .await?;

        if outcome.rows_affected() == 0 {
            return Err(TrackerError::NotFound(interaction_id.to_string()));
        }
        tracing::info!(interaction_id, kind = kind.as_str(), "Feedback recorded");

        if kind == FeedbackKind::Negative {
            match self.get(interaction_id).await {
                Ok(interaction) => {
                    let payload = json!({
                        "interaction_id": interaction.interaction_id,
                        "service_name": interaction.service_name,
                        "user_id": interaction.user_id,
                        "user_input": interaction.user_input,
                        "ai_output": interaction.ai_output,
                        "feedback_comment": comment,
                        "recorded_at": recorded_at,
                    });
                    if let Err(error) = self.notifier.notify("negative_feedback", payload).await {
                        tracing::error!(interaction_id, error = %error, "Negative feedback fan-out failed");
                    }
                }
                Err(error) => {
                    tracing::error!(interaction_id, error = %error, "Failed to load interaction for fan-out");
                }
            }
        }
        Ok(())
    }

    /// Load one interaction by id.
    pub async fn get(&self, interaction_id: &str) -> Result<Interaction, TrackerError> {
        let select = format!("SELECT * FROM {} WHERE interaction_id = ?", self.table);
        let row = sqlx::query(&select)
            .bind(interaction_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TrackerError::NotFound(interaction_id.to_string()))?;
        Ok(row_to_interaction(&row))
    }

    /// Aggregate counts and satisfaction statistics, optionally scoped to one
    /// service.
    pub async fn summary(
        &self,
        service_name: Option<&str>,
    ) -> Result<InteractionSummary, TrackerError> {
        let mut sql = format!(
            "SELECT service_name,
                    COUNT(*) AS total,
                    SUM(CASE WHEN feedback_kind = 'positive' THEN 1 ELSE 0 END) AS positive,
                    SUM(CASE WHEN feedback_kind = 'negative' THEN 1 ELSE 0 END) AS negative,
                    AVG(response_time_seconds) AS avg_response
             FROM {}",
            self.table
        );
        if service_name.is_some() {
            sql.push_str(" WHERE service_name = ?");
        }
        sql.push_str(" GROUP BY service_name");

        let mut query = sqlx::query(&sql);
        if let Some(service_name) = service_name {
            query = query.bind(service_name);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut summary = InteractionSummary {
            total_interactions: 0,
            positive_feedback: 0,
            negative_feedback: 0,
            satisfaction_rate: 0.0,
            average_response_time: None,
            services_breakdown: BTreeMap::new(),
        };

        let mut weighted_response = 0.0;
        let mut response_count = 0u64;
        for row in rows {
            let service: String = row.get("service_name");
            let total: i64 = row.get("total");
            let positive: i64 = row.get::<Option<i64>, _>("positive").unwrap_or(0);
            let negative: i64 = row.get::<Option<i64>, _>("negative").unwrap_or(0);
            summary.total_interactions += total as u64;
            summary.positive_feedback += positive as u64;
            summary.negative_feedback += negative as u64;
            if let Some(avg) = row.get::<Option<f64>, _>("avg_response") {
                weighted_response += avg * total as f64;
                response_count += total as u64;
            }
            summary.services_breakdown.insert(
                service,
                ServiceCounts {
                    total: total as u64,
                    positive: positive as u64,
                    negative: negative as u64,
                },
            );
        }

        let feedback_total = summary.positive_feedback + summary.negative_feedback;
        if feedback_total > 0 {
            summary.satisfaction_rate =
                summary.positive_feedback as f64 / feedback_total as f64 * 100.0;
        }
        if response_count > 0 {
            summary.average_response_time = Some(weighted_response / response_count as f64);
        }
        Ok(summary)
    }

    /// Search interactions with filters, pagination and sort order.
    pub async fn search(
        &self,
        filters: &SearchFilters,
        page: u32,
        page_size: u32,
        sort: SortOrder,
    ) -> Result<Vec<Interaction>, TrackerError> {
        let mut sql = format!("SELECT * FROM {} WHERE 1 = 1", self.table);
        if filters.service_name.is_some() {
            sql.push_str(" AND service_name = ?");
        }
        if filters.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filters.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if filters.feedback.is_some() {
            sql.push_str(" AND feedback_kind = ?");
        }
        sql.push_str(match sort {
            SortOrder::NewestFirst => " ORDER BY created_at DESC",
            SortOrder::OldestFirst => " ORDER BY created_at ASC",
        });
        sql.push_str(" LIMIT ? OFFSET ?");

        let page_size = page_size.clamp(1, 500);
        let offset = page.saturating_sub(1) * page_size;

        let mut query = sqlx::query(&sql);
        if let Some(service_name) = &filters.service_name {
            query = query.bind(service_name);
        }
        if let Some(user_id) = &filters.user_id {
            query = query.bind(user_id);
        }
        if let Some(session_id) = &filters.session_id {
            query = query.bind(session_id);
        }
        if let Some(feedback) = filters.feedback {
            query = query.bind(feedback.as_str());
        }
        let rows = query
            .bind(page_size as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_interaction).collect())
    }

    /// Register a service in the registry; existing entries win races.
    async fn register_service(
        &self,
        service_name: &str,
        display_name: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), TrackerError> {
        let display_val = display_name
            .map(str::to_string)
            .unwrap_or_else(|| derive_display_name(service_name));
        let description = description
            .map(str::to_string)
            .unwrap_or_else(|| format!("AI service: {service_name}"));
        let outcome = sqlx::query(
            "INSERT OR IGNORE INTO services
                 (service_name, display_name, description, expected_context, registered_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(service_name)
        .bind(&display_val)
        .bind(&description)
        .bind("[]")
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() > 0 {
            tracing::info!(service = service_name, display = %display_val, "Registered new AI service");
        }
        Ok(())
    }
}

fn row_to_interaction(row: &sqlx::sqlite::SqliteRow) -> Interaction {
    let feedback = row
        .get::<Option<String>, _>("feedback_kind")
        .as_deref()
        .and_then(FeedbackKind::parse)
        .map(|kind| Feedback {
            kind,
            comment: row.get("feedback_comment"),
            recorded_at: row
                .get::<Option<String>, _>("feedback_recorded_at")
                .unwrap_or_default(),
        });

    let context: Value =
        serde_json::from_str(&row.get::<String, _>("context")).unwrap_or_else(|_| json!({}));

    Interaction {
        interaction_id: row.get("interaction_id"),
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        service_name: row.get("service_name"),
        user_input: row.get("user_input"),
        ai_output: row.get("ai_output"),
        context,
        response_time_seconds: row.get("response_time_seconds"),
        feedback,
        timestamp: row.get("created_at"),
    }
}

/// Title-case a service name for first-time registration.
fn derive_display_name(service_name: &str) -> String {
    service_name
        .split(['-', '_'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
