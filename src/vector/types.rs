//! Shared types used by the vector store client and retrieval policy.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned while interacting with the vector store.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid vector store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The store responded with an unexpected status code.
    #[error("Unexpected vector store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// The corpus targeted by a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corpus {
    /// Persistent, shared reference corpus. Rebuilt only by the scheduler.
    Reference,
    /// Per-request document vectors, scoped by `document_name`.
    Ephemeral,
    /// Retrieval corpus backing the conversational pipeline.
    Chat,
}

/// Smallest retrievable unit: chunk text plus its attribute map.
///
/// Attributes carry the domain routing keys (`source_table`,
/// `indicator_acronym`, `year`, `phase_name`, `cluster_role`, `table_type`,
/// `document_name`, `doi`, `cluster_acronym`). Chunks are immutable once
/// stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Text content of the chunk.
    pub text: String,
    /// Attribute map persisted alongside the vector.
    pub attributes: Map<String, Value>,
}

impl Chunk {
    /// Construct a chunk with no attributes.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: Map::new(),
        }
    }

    /// Attribute value as a string slice, when present and textual.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Builder-style attribute insertion.
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// A chunk paired with its embedding, ready for insertion.
#[derive(Debug, Clone)]
pub struct ChunkInsert {
    /// The chunk content and attributes.
    pub chunk: Chunk,
    /// Embedding vector produced for the chunk text.
    pub vector: Vec<f32>,
}

/// Scored chunk returned by a k-NN query.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// Identifier assigned to the vector.
    pub id: String,
    /// Cosine similarity score computed by the store.
    pub score: f32,
    /// The stored chunk.
    pub chunk: Chunk,
}

/// Attribute equality filters applied to retrieval queries.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RetrievalFilterArgs {
    /// Exact match on `indicator_acronym`.
    pub indicator: Option<String>,
    /// Exact match on `year`.
    pub year: Option<String>,
    /// Any-of constraint on `source_table`.
    pub source_tables: Option<Vec<String>>,
    /// Exact match on `document_name` (ephemeral corpus only).
    pub document_name: Option<String>,
}

impl RetrievalFilterArgs {
    /// Number of concrete filters set, used to scale `k`.
    pub fn specificity(&self) -> usize {
        usize::from(self.indicator.is_some())
            + usize::from(self.year.is_some())
            + usize::from(self.source_tables.is_some())
    }
}

#[derive(Deserialize)]
pub(crate) struct ListCollectionsResponse {
    pub(crate) result: ListCollectionsResult,
}

#[derive(Deserialize)]
pub(crate) struct ListCollectionsResult {
    pub(crate) collections: Vec<CollectionDescription>,
}

#[derive(Deserialize)]
pub(crate) struct CollectionDescription {
    pub(crate) name: String,
}

#[derive(Deserialize)]
pub(crate) struct ListAliasesResponse {
    pub(crate) result: ListAliasesResult,
}

#[derive(Deserialize)]
pub(crate) struct ListAliasesResult {
    pub(crate) aliases: Vec<AliasDescription>,
}

#[derive(Deserialize)]
pub(crate) struct AliasDescription {
    pub(crate) alias_name: String,
    pub(crate) collection_name: String,
}

#[derive(Deserialize)]
pub(crate) struct CountResponse {
    pub(crate) result: CountResult,
}

#[derive(Deserialize)]
pub(crate) struct CountResult {
    pub(crate) count: u64,
}

#[derive(Deserialize)]
pub(crate) struct QueryResponse {
    pub(crate) result: QueryResponseResult,
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryResponseResult {
    Points(Vec<QueryPoint>),
    Object {
        #[serde(default)]
        points: Vec<QueryPoint>,
    },
}

#[derive(Deserialize)]
pub(crate) struct QueryPoint {
    pub(crate) id: Value,
    pub(crate) score: f32,
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

#[derive(Deserialize)]
pub(crate) struct ScrollResponse {
    pub(crate) result: ScrollResult,
}

#[derive(Deserialize)]
pub(crate) struct ScrollResult {
    #[serde(default)]
    pub(crate) points: Vec<ScrollPoint>,
    #[serde(default)]
    pub(crate) next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
pub(crate) struct ScrollPoint {
    #[serde(default)]
    pub(crate) payload: Option<Map<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specificity_counts_concrete_filters() {
        let empty = RetrievalFilterArgs::default();
        assert_eq!(empty.specificity(), 0);

        let two = RetrievalFilterArgs {
            indicator: Some("IPI 1.1".into()),
            year: Some("2024".into()),
            ..Default::default()
        };
        assert_eq!(two.specificity(), 2);
    }

    #[test]
    fn chunk_attribute_reads_strings_only() {
        let chunk = Chunk::new("text")
            .with_attribute("table_type", "deliverables")
            .with_attribute("year", 2024);
        assert_eq!(chunk.attribute("table_type"), Some("deliverables"));
        assert_eq!(chunk.attribute("year"), None);
        assert_eq!(chunk.attribute("missing"), None);
    }
}
