//! Entity resolution against the staff and institution search indexes.
//!
//! Free-text names extracted by the generator are reconciled to canonical
//! identifiers with a lexical search: one `best_fields` and one
//! `cross_fields` multi-match combined in a boolean `should`, top three
//! candidates requested, the best one used. An unavailable backend is retried
//! with exponential backoff; exhaustion degrades the calling artifact to null
//! ids and zero scores instead of failing the request.

mod patch;

pub use patch::{apply_mapping, collect_entries};

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, SearchIndexConfig};

/// Errors raised while resolving entries.
#[derive(Debug, Error)]
pub enum MappingError {
    /// The search backend is temporarily unavailable; retried with backoff.
    #[error("Mapping backend unavailable: {0}")]
    Unavailable(String),
    /// The request failed in a way retrying will not fix.
    #[error("Mapping request failed: {0}")]
    Request(String),
}

/// The kind of entity a value should resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// A person; resolved against the staff index.
    Staff,
    /// An organization; resolved against the institution index.
    Institution,
}

/// One value to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRequestEntry {
    /// Free-text value extracted from the artifact.
    pub value: String,
    /// Entity kind of the value.
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// Resolution outcome for one entry. Derived; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// The value that was searched.
    pub original_value: String,
    /// Entity kind of the value.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Canonical identifier of the best candidate, if any.
    pub mapped_id: Option<String>,
    /// Display name of the best candidate, if any.
    pub mapped_name: Option<String>,
    /// Acronym of the best candidate (institutions only).
    pub mapped_acronym: Option<String>,
    /// Lexical score of the best candidate, rounded to 4 decimals.
    pub score: Option<f64>,
}

impl MappingEntry {
    /// Entry carrying no resolution, used when search found nothing or the
    /// backend stayed unavailable.
    pub fn unresolved(value: &str, kind: EntryKind) -> Self {
        Self {
            original_value: value.to_string(),
            kind,
            mapped_id: None,
            mapped_name: None,
            mapped_acronym: None,
            score: None,
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: SearchHits,
}

#[derive(Deserialize, Default)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(rename = "_score")]
    score: f64,
    #[serde(rename = "_source")]
    source: Value,
}

/// Client for the lexical mapping indexes.
pub struct MappingClient {
    pub(crate) client: Client,
    pub(crate) staff: SearchIndexConfig,
    pub(crate) institution: SearchIndexConfig,
    pub(crate) max_retries: usize,
    pub(crate) retry_delay: Duration,
}

impl MappingClient {
    /// Construct a client from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, MappingError> {
        let client = Client::builder()
            .user_agent("agromine/mapping")
            .timeout(Duration::from_secs(config.step_timeout_secs))
            .build()
            .map_err(|err| MappingError::Request(err.to_string()))?;
        Ok(Self {
            client,
            staff: config.staff_search.clone(),
            institution: config.institution_search.clone(),
            max_retries: config.mapping_max_retries,
            retry_delay: Duration::from_secs(config.mapping_retry_delay_secs),
        })
    }

    fn index_for(&self, kind: EntryKind) -> &SearchIndexConfig {
        match kind {
            EntryKind::Staff => &self.staff,
            EntryKind::Institution => &self.institution,
        }
    }

    fn search_fields(kind: EntryKind) -> Value {
        match kind {
            EntryKind::Staff => json!(["first_name^2", "last_name^2"]),
            EntryKind::Institution => json!(["acronym^2", "name"]),
        }
    }

    fn query_body(kind: EntryKind, value: &str) -> Value {
        let fields = Self::search_fields(kind);
        json!({
            "size": 3,
            "query": {
                "bool": {
                    "should": [
                        {
                            "multi_match": {
                                "query": value,
                                "fields": fields.clone(),
                                "type": "best_fields",
                                "boost": 2.0
                            }
                        },
                        {
                            "multi_match": {
                                "query": value,
                                "fields": fields,
                                "type": "cross_fields",
                                "boost": 1.0
                            }
                        }
                    ]
                }
            }
        })
    }

    async fn search_entry(&self, entry: &MappingRequestEntry) -> Result<MappingEntry, MappingError> {
        let index_config = self.index_for(entry.kind);
        let url = format!(
            "{}/{}/_search",
            index_config.url.trim_end_matches('/'),
            index_config.index
        );

        let mut request = self
            .client
            .post(&url)
            .json(&Self::query_body(entry.kind, &entry.value));
        if let Some(username) = &index_config.username {
            request = request.basic_auth(username, index_config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|err| MappingError::Unavailable(err.to_string()))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::SERVICE_UNAVAILABLE => {
                let body = response.text().await.unwrap_or_default();
                return Err(MappingError::Unavailable(body));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(MappingError::Request(format!("{status}: {body}")));
            }
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| MappingError::Request(err.to_string()))?;

        let Some(best) = payload.hits.hits.first() else {
            tracing::debug!(value = %entry.value, kind = ?entry.kind, "No mapping candidates found");
            return Ok(MappingEntry::unresolved(&entry.value, entry.kind));
        };

        Ok(candidate_to_entry(entry, best))
    }

    /// Resolve a batch of entries in order, one search per entry.
    ///
    /// A per-entry failure that is not an availability problem yields an
    /// unresolved entry; an unavailable backend aborts the batch so the retry
    /// loop can re-run it.
    pub async fn map_entries(
        &self,
        entries: &[MappingRequestEntry],
    ) -> Result<Vec<MappingEntry>, MappingError> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.search_entry(entry).await {
                Ok(result) => results.push(result),
                Err(MappingError::Unavailable(reason)) => {
                    return Err(MappingError::Unavailable(reason));
                }
                Err(error) => {
                    tracing::error!(value = %entry.value, error = %error, "Mapping search failed");
                    results.push(MappingEntry::unresolved(&entry.value, entry.kind));
                }
            }
        }
        Ok(results)
    }

    /// Resolve entries with exponential backoff on an unavailable backend.
    ///
    /// After `max_retries` failed attempts the batch degrades to unresolved
    /// entries; the calling pipeline is never failed by mapping.
    pub async fn resolve_with_retry(&self, entries: &[MappingRequestEntry]) -> Vec<MappingEntry> {
        if entries.is_empty() {
            return Vec::new();
        }

        for attempt in 0..self.max_retries {
            tracing::info!(
                attempt = attempt + 1,
                max_retries = self.max_retries,
                entries = entries.len(),
                "Attempting mapping"
            );
            match self.map_entries(entries).await {
                Ok(results) => {
                    tracing::info!(attempt = attempt + 1, "Mapping successful");
                    return results;
                }
                Err(MappingError::Unavailable(reason)) => {
                    if attempt + 1 < self.max_retries {
                        let wait = self.retry_delay * 2u32.saturating_pow(attempt.min(16) as u32);
                        tracing::warn!(
                            attempt = attempt + 1,
                            wait_secs = wait.as_secs(),
                            %reason,
                            "Mapping backend unavailable; retrying"
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        tracing::error!(
                            attempts = self.max_retries,
                            "Mapping backend unavailable after final attempt"
                        );
                    }
                }
                Err(error) => {
                    tracing::error!(error = %error, "Mapping failed with a non-retryable error");
                    break;
                }
            }
        }

        tracing::warn!("Mapping exhausted; applying default values");
        entries
            .iter()
            .map(|entry| MappingEntry::unresolved(&entry.value, entry.kind))
            .collect()
    }
}

fn candidate_to_entry(entry: &MappingRequestEntry, hit: &SearchHit) -> MappingEntry {
    let source = &hit.source;
    let (mapped_id, mapped_name, mapped_acronym) = match entry.kind {
        EntryKind::Staff => {
            let id = source.get("carnet").map(stringify_id);
            let name = format!(
                "{} {}",
                source.get("first_name").and_then(Value::as_str).unwrap_or(""),
                source.get("last_name").and_then(Value::as_str).unwrap_or("")
            )
            .trim()
            .to_string();
            (id, (!name.is_empty()).then_some(name), None)
        }
        EntryKind::Institution => {
            let id = source.get("code").map(stringify_id);
            let name = source
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let acronym = source
                .get("acronym")
                .and_then(Value::as_str)
                .map(str::to_string);
            (id, name, acronym)
        }
    };

    MappingEntry {
        original_value: entry.value.clone(),
        kind: entry.kind,
        mapped_id,
        mapped_name,
        mapped_acronym,
        score: Some((hit.score * 10_000.0).round() / 10_000.0),
    }
}

fn stringify_id(value: &Value) -> String {
    match value {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        other => other.to_string(),
    }
}
