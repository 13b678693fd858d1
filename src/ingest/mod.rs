//! Reference corpus ingestion from the relational record source.
//!
//! The scheduler turns reporting rows into chunks: each row is projected
//! (empty cells dropped, routing attributes lifted out, `table_type` tagged),
//! serialized to JSON, embedded and stored. A refresh builds into a fresh
//! collection and swaps the corpus alias atomically, so readers always see a
//! complete index. The same component seeds the extraction reference corpus
//! from the region/country workbooks in blob storage.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::blobstore::{BlobStore, BlobStoreError};
use crate::config::{Config, Project};
use crate::decode::{self, DecodeError, NormalizedDocument};
use crate::embedding::{EmbeddingClient, EmbeddingClientError};
use crate::vector::{Chunk, ChunkInsert, Corpus, VectorStore, VectorStoreError};

/// Source views ingested into the corpora, paired with their logical
/// `table_type` tag.
pub const SOURCE_TABLES: [(&str, &str); 6] = [
    ("vw_ai_deliverables", "deliverables"),
    ("vw_ai_project_contribution", "contributions"),
    ("vw_ai_questions", "questions"),
    ("vw_ai_oicrs", "oicrs"),
    ("vw_ai_innovations", "innovations"),
    ("vw_ai_challenges", "challenges"),
];

/// Reference workbooks seeded for the extraction pipeline.
const REFERENCE_WORKBOOKS: [&str; 2] = ["clarisa_regions.xlsx", "clarisa_countries.xlsx"];

/// Row attributes lifted into the chunk attribute map for filtering.
const ROUTING_KEYS: [&str; 7] = [
    "indicator_acronym",
    "year",
    "phase_name",
    "cluster_role",
    "cluster_acronym",
    "doi",
    "question",
];

/// Physical view name for a logical table type.
pub fn physical_table(table_type: &str) -> Option<&'static str> {
    SOURCE_TABLES
        .iter()
        .find(|(_, logical)| *logical == table_type)
        .map(|(physical, _)| *physical)
}

/// Logical table type of a physical view name.
pub fn table_type_of(physical: &str) -> Option<&'static str> {
    SOURCE_TABLES
        .iter()
        .find(|(name, _)| *name == physical)
        .map(|(_, logical)| *logical)
}

/// Errors raised by record sources.
#[derive(Debug, Error)]
pub enum RecordSourceError {
    /// The source failed in a way that may succeed on retry.
    #[error("Record source request failed: {0}")]
    Transient(String),
    /// The source answered with an unusable payload.
    #[error("Malformed record source response: {0}")]
    InvalidResponse(String),
}

/// Interface over the relational source tables.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Load all rows of a table.
    async fn load(&self, table: &str) -> Result<Vec<Map<String, Value>>, RecordSourceError>;

    /// Row count of a table.
    async fn count(&self, table: &str) -> Result<u64, RecordSourceError>;
}

/// Record source speaking the lakehouse HTTP gateway.
pub struct HttpRecordSource {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
}

impl HttpRecordSource {
    /// Construct a source client from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, RecordSourceError> {
        let client = Client::builder()
            .user_agent("agromine/records")
            .timeout(Duration::from_secs(config.step_timeout_secs))
            .build()
            .map_err(|err| RecordSourceError::Transient(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.record_source_url.trim_end_matches('/').to_string(),
            api_key: config.record_source_api_key.clone(),
        })
    }

    async fn fetch(&self, path: &str) -> Result<Value, RecordSourceError> {
        let mut request = self.client.get(format!("{}/{path}", self.base_url));
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            request = request.header("x-api-key", api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| RecordSourceError::Transient(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RecordSourceError::Transient(format!("{status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|err| RecordSourceError::InvalidResponse(err.to_string()))
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn load(&self, table: &str) -> Result<Vec<Map<String, Value>>, RecordSourceError> {
        let payload = self.fetch(&format!("tables/{table}")).await?;
        let rows = payload
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                RecordSourceError::InvalidResponse("missing rows array".to_string())
            })?;
        Ok(rows
            .iter()
            .filter_map(|row| row.as_object().cloned())
            .collect())
    }

    async fn count(&self, table: &str) -> Result<u64, RecordSourceError> {
        let payload = self.fetch(&format!("tables/{table}/count")).await?;
        payload
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| RecordSourceError::InvalidResponse("missing count".to_string()))
    }
}

/// In-memory record source used by tests and local development.
#[derive(Default)]
pub struct MemoryRecordSource {
    tables: RwLock<HashMap<String, Vec<Map<String, Value>>>>,
}

impl MemoryRecordSource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of one table.
    pub fn seed(&self, table: &str, rows: Vec<Map<String, Value>>) {
        self.tables
            .try_write()
            .expect("memory record source is not contended during seeding")
            .insert(table.to_string(), rows);
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn load(&self, table: &str) -> Result<Vec<Map<String, Value>>, RecordSourceError> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn count(&self, table: &str) -> Result<u64, RecordSourceError> {
        Ok(self.load(table).await?.len() as u64)
    }
}

/// Errors raised by the ingestion scheduler.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Loading rows from the record source failed.
    #[error("Failed to load source rows: {0}")]
    Source(#[from] RecordSourceError),
    /// Embedding generation failed for a whole batch.
    #[error("Failed to embed chunks: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// The vector store rejected an operation.
    #[error("Vector store request failed: {0}")]
    Store(#[from] VectorStoreError),
    /// A reference workbook could not be fetched.
    #[error("Failed to fetch reference workbook: {0}")]
    Blob(#[from] BlobStoreError),
    /// A reference workbook could not be decoded.
    #[error("Failed to decode reference workbook: {0}")]
    Decode(#[from] DecodeError),
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IngestOutcome {
    /// Source tables processed.
    pub tables: usize,
    /// Chunks written to the corpus.
    pub chunks: usize,
}

/// Rebuilds the vector corpora from the record source and seeds the
/// extraction reference workbooks.
pub struct IngestionScheduler {
    source: Arc<dyn RecordSource>,
    embedding: Arc<dyn EmbeddingClient>,
    store: Arc<VectorStore>,
    blobstore: Arc<dyn BlobStore>,
    reference_bucket: String,
    star_prefix: String,
    prms_prefix: String,
}

impl IngestionScheduler {
    /// Assemble a scheduler from its collaborators.
    pub fn new(
        source: Arc<dyn RecordSource>,
        embedding: Arc<dyn EmbeddingClient>,
        store: Arc<VectorStore>,
        blobstore: Arc<dyn BlobStore>,
        config: &Config,
    ) -> Self {
        Self {
            source,
            embedding,
            store,
            blobstore,
            reference_bucket: config.reference_bucket.clone(),
            star_prefix: config.star_reference_prefix.clone(),
            prms_prefix: config.prms_reference_prefix.clone(),
        }
    }

    fn tables_for(corpus: Corpus) -> Vec<&'static str> {
        SOURCE_TABLES
            .iter()
            .filter(|(_, logical)| corpus == Corpus::Reference || *logical != "challenges")
            .map(|(physical, _)| *physical)
            .collect()
    }

    /// Rebuild a corpus from the record source.
    ///
    /// With `refresh` the existing index is replaced atomically; without it
    /// rows are appended to the current index.
    pub async fn rebuild(&self, corpus: Corpus, refresh: bool) -> Result<IngestOutcome, IngestError> {
        let target = if refresh {
            self.store.begin_rebuild(corpus).await?
        } else {
            self.store.ensure_corpus(corpus).await?;
            self.store.corpus_name(corpus).to_string()
        };

        let mut outcome = IngestOutcome::default();
        for table in Self::tables_for(corpus) {
            let written = self.ingest_table(table, &target).await?;
            outcome.tables += 1;
            outcome.chunks += written;
        }

        if refresh {
            self.store.commit_rebuild(corpus, &target).await?;
        }
        tracing::info!(
            corpus = ?corpus,
            refresh,
            tables = outcome.tables,
            chunks = outcome.chunks,
            "Ingestion completed"
        );
        Ok(outcome)
    }

    async fn ingest_table(&self, table: &str, target: &str) -> Result<usize, IngestError> {
        tracing::info!(table, "Processing source table");
        let rows = self.source.load(table).await?;
        let chunks = project_rows(table, rows);
        if chunks.is_empty() {
            tracing::warn!(table, "Source table produced no chunks");
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        tracing::info!(table, rows = texts.len(), "Generating embeddings");
        let vectors = self.embedding.generate_embeddings(texts).await?;

        let inserts: Vec<ChunkInsert> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkInsert { chunk, vector })
            .collect();
        let written = self.store.put_into(target, inserts).await?;
        tracing::info!(table, written, "Source table vectorized");
        Ok(written)
    }

    /// Seed the extraction reference corpus from a project's region and
    /// country workbooks, if it is empty.
    pub async fn ensure_reference_seeded(&self, project: Project) -> Result<(), IngestError> {
        self.store.ensure_corpus(Corpus::Reference).await?;
        self.store.ensure_corpus(Corpus::Ephemeral).await?;
        if self.store.exists_reference().await? {
            tracing::debug!("Reference corpus already populated");
            return Ok(());
        }

        tracing::info!(%project, "Seeding reference corpus from workbooks");
        let prefix = match project {
            Project::Star => &self.star_prefix,
            Project::Prms => &self.prms_prefix,
        };

        let mut inserts = Vec::new();
        for workbook in REFERENCE_WORKBOOKS {
            let key = format!("{}/{workbook}", prefix.trim_end_matches('/'));
            let bytes = self.blobstore.get(&self.reference_bucket, &key).await?;
            let document = decode::decode(&bytes, &decode::extension_of(&key))?;
            let rows = match document {
                NormalizedDocument::Tabular(rows) => rows,
                NormalizedDocument::Text(text) => vec![text],
            };
            let vectors = self.embedding.generate_embeddings(rows.clone()).await?;
            inserts.extend(rows.into_iter().zip(vectors).map(|(text, vector)| {
                ChunkInsert {
                    chunk: Chunk::new(text)
                        .with_attribute("is_reference", true)
                        .with_attribute("source_key", key.as_str()),
                    vector,
                }
            }));
        }

        let written = self.store.put_reference(inserts).await?;
        tracing::info!(written, "Reference corpus seeded");
        Ok(())
    }
}

/// Project one table's rows into chunks: empty cells dropped, the cleaned row
/// serialized as JSON, routing attributes lifted into the attribute map.
pub fn project_rows(table: &str, rows: Vec<Map<String, Value>>) -> Vec<Chunk> {
    let table_type = table_type_of(table).unwrap_or(table);
    rows.into_iter()
        .filter_map(|row| {
            let cleaned: Map<String, Value> = row
                .into_iter()
                .filter(|(_, value)| !is_empty_cell(value))
                .collect();
            if cleaned.is_empty() {
                return None;
            }

            let mut attributes = Map::new();
            attributes.insert("source_table".into(), Value::String(table.to_string()));
            attributes.insert("table_type".into(), Value::String(table_type.to_string()));
            for key in ROUTING_KEYS {
                if let Some(value) = cleaned.get(key) {
                    attributes.insert(key.to_string(), stringify_attribute(value));
                }
            }

            Some(Chunk {
                text: Value::Object(cleaned).to_string(),
                attributes,
            })
        })
        .collect()
}

fn is_empty_cell(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

fn stringify_attribute(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.clone()),
        Value::Number(number) => Value::String(number.to_string()),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn table_lookup_is_bidirectional() {
        assert_eq!(physical_table("deliverables"), Some("vw_ai_deliverables"));
        assert_eq!(table_type_of("vw_ai_deliverables"), Some("deliverables"));
        assert_eq!(physical_table("unknown"), None);
    }

    #[test]
    fn projection_drops_empty_cells_and_tags_attributes() {
        let rows = vec![row(&[
            ("title", json!("Climate advisory bulletin")),
            ("doi", json!("https://doi.org/10.1/abc")),
            ("indicator_acronym", json!("IPI 1.1")),
            ("year", json!(2024)),
            ("cluster_role", json!("Leading")),
            ("empty", json!("")),
            ("missing", Value::Null),
        ])];
        let chunks = project_rows("vw_ai_deliverables", rows);
        assert_eq!(chunks.len(), 1);

        let chunk = &chunks[0];
        assert_eq!(chunk.attribute("source_table"), Some("vw_ai_deliverables"));
        assert_eq!(chunk.attribute("table_type"), Some("deliverables"));
        assert_eq!(chunk.attribute("indicator_acronym"), Some("IPI 1.1"));
        assert_eq!(chunk.attribute("year"), Some("2024"));
        assert_eq!(chunk.attribute("doi"), Some("https://doi.org/10.1/abc"));
        assert!(chunk.text.contains("Climate advisory bulletin"));
        assert!(!chunk.text.contains("empty"));
        assert!(!chunk.text.contains("missing"));
    }

    #[test]
    fn all_blank_rows_produce_no_chunks() {
        let rows = vec![row(&[("a", json!("")), ("b", Value::Null)])];
        assert!(project_rows("vw_ai_questions", rows).is_empty());
    }

    #[test]
    fn projection_is_deterministic() {
        let rows = vec![row(&[
            ("title", json!("Seed fair")),
            ("year", json!(2023)),
        ])];
        let first = project_rows("vw_ai_oicrs", rows.clone());
        let second = project_rows("vw_ai_oicrs", rows);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn memory_record_source_round_trips() {
        let source = MemoryRecordSource::new();
        source.seed(
            "vw_ai_deliverables",
            vec![row(&[("title", json!("Bulletin"))])],
        );
        assert_eq!(source.count("vw_ai_deliverables").await.expect("count"), 1);
        assert!(source.load("vw_ai_unknown").await.expect("rows").is_empty());
    }

    #[test]
    fn chat_tables_exclude_challenges() {
        let chat = IngestionScheduler::tables_for(Corpus::Chat);
        assert!(!chat.contains(&"vw_ai_challenges"));
        assert_eq!(chat.len(), 5);
        let reference = IngestionScheduler::tables_for(Corpus::Reference);
        assert!(reference.contains(&"vw_ai_challenges"));
    }
}
