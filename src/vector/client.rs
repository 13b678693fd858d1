//! HTTP client for the Qdrant-backed vector corpora.
//!
//! Three corpora live behind one store: the persistent reference corpus, the
//! per-request ephemeral corpus and the chatbot corpus. Reference and chat
//! corpora are addressed through aliases so the ingestion scheduler can
//! rebuild them atomically: a fresh timestamped collection is filled and the
//! alias is moved in a single request, leaving readers on wholly-old or
//! wholly-new data at every instant.

use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Config;

use super::filters::{
    build_retrieval_filter, chunk_to_payload, document_name_filter, payload_to_chunk,
    with_required_field,
};
use super::types::{
    Chunk, ChunkInsert, Corpus, CountResponse, ListAliasesResponse, ListCollectionsResponse,
    QueryResponse, QueryResponseResult, RetrievalFilterArgs, ScoredChunk, ScrollResponse,
    VectorStoreError,
};

/// Payload fields indexed for filterable retrieval.
const INDEXED_FIELDS: [&str; 8] = [
    "source_table",
    "indicator_acronym",
    "year",
    "table_type",
    "cluster_role",
    "phase_name",
    "document_name",
    "doi",
];

const SCROLL_PAGE_SIZE: usize = 512;

/// Lightweight HTTP client for vector corpus operations.
pub struct VectorStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) reference_collection: String,
    pub(crate) ephemeral_collection: String,
    pub(crate) chat_collection: String,
    pub(crate) dimension: usize,
}

impl VectorStore {
    /// Construct a store client from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, VectorStoreError> {
        let client = Client::builder()
            .user_agent("agromine/vector")
            .timeout(Duration::from_secs(config.step_timeout_secs))
            .build()?;
        let base_url = normalize_base_url(&config.qdrant_url).map_err(VectorStoreError::InvalidUrl)?;
        tracing::debug!(url = %base_url, "Initialized vector store HTTP client");

        Ok(Self {
            client,
            base_url,
            api_key: config.qdrant_api_key.clone(),
            reference_collection: config.reference_collection.clone(),
            ephemeral_collection: config.ephemeral_collection.clone(),
            chat_collection: config.chat_collection.clone(),
            dimension: config.embedding_dimension,
        })
    }

    /// Logical name (alias or collection) addressing a corpus.
    pub fn corpus_name(&self, corpus: Corpus) -> &str {
        match corpus {
            Corpus::Reference => &self.reference_collection,
            Corpus::Ephemeral => &self.ephemeral_collection,
            Corpus::Chat => &self.chat_collection,
        }
    }

    /// Create a corpus if it is missing, including its payload indexes.
    ///
    /// Reference and chat corpora are created as a versioned collection plus
    /// an alias; the ephemeral corpus is a plain collection.
    pub async fn ensure_corpus(&self, corpus: Corpus) -> Result<(), VectorStoreError> {
        let name = self.corpus_name(corpus).to_string();
        match corpus {
            Corpus::Ephemeral => {
                if !self.collection_exists(&name).await? {
                    self.create_collection(&name).await?;
                    self.ensure_payload_indexes(&name).await?;
                }
            }
            Corpus::Reference | Corpus::Chat => {
                if self.resolve_alias(&name).await?.is_some()
                    || self.collection_exists(&name).await?
                {
                    return Ok(());
                }
                let physical = format!("{name}-v1");
                if !self.collection_exists(&physical).await? {
                    self.create_collection(&physical).await?;
                    self.ensure_payload_indexes(&physical).await?;
                }
                self.swap_alias(&name, &physical, false).await?;
            }
        }
        Ok(())
    }

    /// Whether the reference corpus exists and holds at least one vector.
    pub async fn exists_reference(&self) -> Result<bool, VectorStoreError> {
        let name = self.reference_collection.clone();
        let resolvable =
            self.resolve_alias(&name).await?.is_some() || self.collection_exists(&name).await?;
        if !resolvable {
            return Ok(false);
        }
        Ok(self.count(Corpus::Reference).await? > 0)
    }

    /// Number of vectors currently stored in a corpus.
    pub async fn count(&self, corpus: Corpus) -> Result<u64, VectorStoreError> {
        let name = self.corpus_name(corpus);
        let response = self
            .request(Method::POST, &format!("collections/{name}/points/count"))?
            .json(&json!({ "exact": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::UnexpectedStatus { status, body });
        }
        let payload: CountResponse = response.json().await?;
        Ok(payload.result.count)
    }

    /// Additively store reference chunks.
    pub async fn put_reference(&self, inserts: Vec<ChunkInsert>) -> Result<usize, VectorStoreError> {
        let name = self.reference_collection.clone();
        self.put_into(&name, inserts).await
    }

    /// Store ephemeral chunks tagged with their owning `document_name`.
    pub async fn put_ephemeral(
        &self,
        document_name: &str,
        inserts: Vec<ChunkInsert>,
    ) -> Result<usize, VectorStoreError> {
        let tagged: Vec<ChunkInsert> = inserts
            .into_iter()
            .map(|mut insert| {
                insert.chunk.attributes.insert(
                    "document_name".into(),
                    Value::String(document_name.to_string()),
                );
                insert
            })
            .collect();
        let name = self.ephemeral_collection.clone();
        self.put_into(&name, tagged).await
    }

    /// Upsert chunk vectors into an arbitrary collection.
    ///
    /// Zero-length vectors (embedding failures) are skipped; the returned
    /// count reflects points actually written.
    pub async fn put_into(
        &self,
        collection: &str,
        inserts: Vec<ChunkInsert>,
    ) -> Result<usize, VectorStoreError> {
        let points: Vec<Value> = inserts
            .iter()
            .filter(|insert| !insert.vector.is_empty())
            .map(|insert| {
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "vector": insert.vector,
                    "payload": chunk_to_payload(&insert.chunk),
                })
            })
            .collect();

        let skipped = inserts.len() - points.len();
        if skipped > 0 {
            tracing::warn!(collection, skipped, "Skipping chunks with empty vectors");
        }
        if points.is_empty() {
            return Ok(0);
        }

        let count = points.len();
        let response = self
            .request(Method::PUT, &format!("collections/{collection}/points"))?
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection, points = count, "Points indexed");
        })
        .await?;
        Ok(count)
    }

    /// Top-k cosine similarity query over a corpus, restricted by attribute
    /// equality filters (and `document_name` for the ephemeral corpus).
    pub async fn knn(
        &self,
        corpus: Corpus,
        query_vector: Vec<f32>,
        k: usize,
        filters: &RetrievalFilterArgs,
    ) -> Result<Vec<ScoredChunk>, VectorStoreError> {
        let name = self.corpus_name(corpus);
        let mut body = json!({
            "query": query_vector,
            "limit": k,
            "with_payload": true,
        });
        if let Some(filter) = build_retrieval_filter(filters) {
            body.as_object_mut()
                .expect("query body is an object")
                .insert("filter".into(), filter);
        }

        let response = self
            .request(Method::POST, &format!("collections/{name}/points/query"))?
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus { status, body };
            tracing::error!(collection = name, error = %error, "Vector search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        let points = match payload.result {
            QueryResponseResult::Points(points) => points,
            QueryResponseResult::Object { points } => points,
        };

        Ok(points
            .into_iter()
            .map(|point| ScoredChunk {
                id: stringify_point_id(point.id),
                score: point.score,
                chunk: payload_to_chunk(point.payload.unwrap_or_default()),
            })
            .collect())
    }

    /// Filter-only query returning every matching chunk, optionally requiring
    /// a payload field to be present (e.g. `doi`).
    pub async fn filter_only(
        &self,
        corpus: Corpus,
        filters: &RetrievalFilterArgs,
        require_field: Option<&str>,
    ) -> Result<Vec<Chunk>, VectorStoreError> {
        let filter = match require_field {
            Some(field) => Some(with_required_field(build_retrieval_filter(filters), field)),
            None => build_retrieval_filter(filters),
        };
        let name = self.corpus_name(corpus).to_string();
        let payloads = self.scroll_payloads(&name, filter).await?;
        Ok(payloads.into_iter().map(payload_to_chunk).collect())
    }

    /// Delete every vector belonging to one ephemeral namespace.
    ///
    /// Implemented as a filtered delete so concurrent readers of other
    /// namespaces (and of the shared index) are unaffected.
    pub async fn delete_ephemeral(&self, document_name: &str) -> Result<(), VectorStoreError> {
        let name = self.ephemeral_collection.clone();
        let response = self
            .request(Method::POST, &format!("collections/{name}/points/delete"))?
            .query(&[("wait", true)])
            .json(&json!({ "filter": document_name_filter(document_name) }))
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(document_name, "Ephemeral namespace deleted");
        })
        .await
    }

    /// All chunk texts stored in the reference corpus.
    pub async fn reference_texts(&self) -> Result<Vec<String>, VectorStoreError> {
        let name = self.reference_collection.clone();
        let payloads = self.scroll_payloads(&name, None).await?;
        Ok(payloads
            .into_iter()
            .map(payload_to_chunk)
            .map(|chunk| chunk.text)
            .filter(|text| !text.trim().is_empty())
            .collect())
    }

    /// Create the target collection for an atomic corpus rebuild.
    ///
    /// Returns the physical collection name; pair with [`Self::commit_rebuild`].
    pub async fn begin_rebuild(&self, corpus: Corpus) -> Result<String, VectorStoreError> {
        let alias = self.corpus_name(corpus).to_string();
        let physical = format!("{alias}-v{}", OffsetDateTime::now_utc().unix_timestamp());
        self.create_collection(&physical).await?;
        self.ensure_payload_indexes(&physical).await?;
        tracing::info!(%alias, %physical, "Prepared rebuild collection");
        Ok(physical)
    }

    /// Atomically point the corpus alias at a freshly built collection and
    /// drop superseded versions.
    pub async fn commit_rebuild(
        &self,
        corpus: Corpus,
        physical: &str,
    ) -> Result<(), VectorStoreError> {
        let alias = self.corpus_name(corpus).to_string();
        let had_alias = self.resolve_alias(&alias).await?.is_some();
        self.swap_alias(&alias, physical, had_alias).await?;

        let stale: Vec<String> = self
            .list_collections()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(&format!("{alias}-v")) && name != physical)
            .collect();
        for name in stale {
            if let Err(error) = self.delete_collection(&name).await {
                tracing::warn!(collection = name, error = %error, "Failed to drop stale corpus version");
            }
        }
        tracing::info!(%alias, physical, "Corpus alias swapped");
        Ok(())
    }

    /// Retrieve the names of all collections present in the store.
    pub async fn list_collections(&self) -> Result<Vec<String>, VectorStoreError> {
        let response = self.request(Method::GET, "collections")?.send().await?;

        if response.status().is_success() {
            let payload: ListCollectionsResponse = response.json().await?;
            Ok(payload
                .result
                .collections
                .into_iter()
                .map(|collection| collection.name)
                .collect())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Failed to list collections");
            Err(error)
        }
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, VectorStoreError> {
        let response = self.request(Method::GET, "aliases")?.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::UnexpectedStatus { status, body });
        }
        let payload: ListAliasesResponse = response.json().await?;
        Ok(payload
            .result
            .aliases
            .into_iter()
            .find(|entry| entry.alias_name == alias)
            .map(|entry| entry.collection_name))
    }

    async fn swap_alias(
        &self,
        alias: &str,
        physical: &str,
        delete_existing: bool,
    ) -> Result<(), VectorStoreError> {
        let mut actions = Vec::new();
        if delete_existing {
            actions.push(json!({ "delete_alias": { "alias_name": alias } }));
        }
        actions.push(json!({
            "create_alias": { "alias_name": alias, "collection_name": physical }
        }));

        let response = self
            .request(Method::POST, "collections/aliases")?
            .json(&json!({ "actions": actions }))
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::debug!(alias, physical, "Alias updated");
        })
        .await
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, VectorStoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{name}"))?
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = VectorStoreError::UnexpectedStatus { status, body };
                tracing::error!(collection = name, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn create_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        let body = json!({
            "vectors": {
                "size": self.dimension,
                "distance": "Cosine"
            }
        });
        let response = self
            .request(Method::PUT, &format!("collections/{name}"))?
            .json(&body)
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::debug!(collection = name, dimension = self.dimension, "Collection created");
        })
        .await
    }

    async fn delete_collection(&self, name: &str) -> Result<(), VectorStoreError> {
        let response = self
            .request(Method::DELETE, &format!("collections/{name}"))?
            .send()
            .await?;
        self.ensure_success(response, || {
            tracing::debug!(collection = name, "Collection deleted");
        })
        .await
    }

    async fn ensure_payload_indexes(&self, name: &str) -> Result<(), VectorStoreError> {
        for field in INDEXED_FIELDS {
            let body = json!({
                "field_name": field,
                "field_schema": "keyword",
            });
            let response = self
                .request(Method::PUT, &format!("collections/{name}/index"))?
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() || response.status() == StatusCode::CONFLICT {
                continue;
            }
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus { status, body };
            tracing::warn!(collection = name, field, error = %error, "Failed to ensure payload index");
        }
        Ok(())
    }

    async fn scroll_payloads(
        &self,
        collection: &str,
        filter: Option<Value>,
    ) -> Result<Vec<Map<String, Value>>, VectorStoreError> {
        let mut offset: Option<Value> = None;
        let mut payloads = Vec::new();
        let filter_body = filter.unwrap_or_else(|| json!({ "must": [] }));

        loop {
            let mut body = json!({
                "with_payload": true,
                "with_vector": false,
                "limit": SCROLL_PAGE_SIZE,
                "filter": filter_body.clone(),
            });
            body.as_object_mut()
                .expect("scroll body is an object")
                .insert("offset".into(), offset.clone().unwrap_or(Value::Null));

            let response = self
                .request(
                    Method::POST,
                    &format!("collections/{collection}/points/scroll"),
                )?
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = VectorStoreError::UnexpectedStatus { status, body };
                tracing::error!(collection, error = %error, "Failed to scroll payloads");
                return Err(error);
            }

            let ScrollResponse { result } = response.json().await?;
            for point in result.points {
                if let Some(payload) = point.payload {
                    payloads.push(payload);
                }
            }

            match result.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(payloads)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder, VectorStoreError> {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        Ok(req)
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), VectorStoreError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = VectorStoreError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Vector store request failed");
            Err(error)
        }
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    pub(crate) fn test_store(base_url: String) -> VectorStore {
        VectorStore {
            client: Client::builder()
                .user_agent("agromine-test")
                .build()
                .expect("client"),
            base_url,
            api_key: None,
            reference_collection: "reference_corpus".into(),
            ephemeral_collection: "ephemeral_documents".into(),
            chat_collection: "chat_corpus".into(),
            dimension: 4,
        }
    }

    #[tokio::test]
    async fn knn_emits_filtered_query() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/reference_corpus/points/query")
                    .body_contains("indicator_acronym");
                then.status(200).json_body(json!({
                    "status": "ok",
                    "result": [
                        {
                            "id": "point-1",
                            "score": 0.91,
                            "payload": {
                                "text": "deliverable row",
                                "source_table": "deliverables",
                                "year": "2024"
                            }
                        }
                    ]
                }));
            })
            .await;

        let store = test_store(server.base_url());
        let filters = RetrievalFilterArgs {
            indicator: Some("IPI 1.1".into()),
            year: Some("2024".into()),
            ..Default::default()
        };
        let hits = store
            .knn(Corpus::Reference, vec![0.1, 0.2, 0.3, 0.4], 10, &filters)
            .await
            .expect("hits");

        mock.assert();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "point-1");
        assert_eq!(hits[0].chunk.text, "deliverable row");
        assert_eq!(hits[0].chunk.attribute("source_table"), Some("deliverables"));
    }

    #[tokio::test]
    async fn put_ephemeral_tags_document_name_and_skips_empty_vectors() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::PUT)
                    .path("/collections/ephemeral_documents/points")
                    .body_contains("doc_2025-01-01")
                    .body_contains("first chunk");
                then.status(200).json_body(json!({ "status": "ok", "result": {} }));
            })
            .await;

        let store = test_store(server.base_url());
        let inserts = vec![
            ChunkInsert {
                chunk: Chunk::new("first chunk"),
                vector: vec![0.1, 0.2, 0.3, 0.4],
            },
            ChunkInsert {
                chunk: Chunk::new("embedding failed for this one"),
                vector: Vec::new(),
            },
        ];
        let written = store
            .put_ephemeral("doc_2025-01-01", inserts)
            .await
            .expect("upsert");

        mock.assert();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn delete_ephemeral_is_scoped_to_one_namespace() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/ephemeral_documents/points/delete")
                    .body_contains("document_name")
                    .body_contains("report_2025");
                then.status(200).json_body(json!({ "status": "ok", "result": {} }));
            })
            .await;

        let store = test_store(server.base_url());
        store.delete_ephemeral("report_2025").await.expect("delete");
        mock.assert();
    }

    #[tokio::test]
    async fn scroll_collects_multiple_pages() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/reference_corpus/points/scroll")
                    .body_contains("\"offset\":null");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [ { "payload": { "text": "one" } } ],
                        "next_page_offset": 7
                    }
                }));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/reference_corpus/points/scroll")
                    .body_contains("\"offset\":7");
                then.status(200).json_body(json!({
                    "result": {
                        "points": [ { "payload": { "text": "two" } } ],
                        "next_page_offset": null
                    }
                }));
            })
            .await;

        let store = test_store(server.base_url());
        let texts = store.reference_texts().await.expect("texts");

        first.assert();
        second.assert();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn commit_rebuild_swaps_alias_and_drops_stale_versions() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/aliases");
                then.status(200).json_body(json!({
                    "result": { "aliases": [
                        { "alias_name": "chat_corpus", "collection_name": "chat_corpus-v1" }
                    ] }
                }));
            })
            .await;
        let swap = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/collections/aliases")
                    .body_contains("delete_alias")
                    .body_contains("chat_corpus-v99");
                then.status(200).json_body(json!({ "status": "ok", "result": true }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET).path("/collections");
                then.status(200).json_body(json!({
                    "result": { "collections": [
                        { "name": "chat_corpus-v1" },
                        { "name": "chat_corpus-v99" },
                        { "name": "reference_corpus-v1" }
                    ] }
                }));
            })
            .await;
        let drop_old = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::DELETE).path("/collections/chat_corpus-v1");
                then.status(200).json_body(json!({ "status": "ok", "result": true }));
            })
            .await;

        let store = test_store(server.base_url());
        store
            .commit_rebuild(Corpus::Chat, "chat_corpus-v99")
            .await
            .expect("commit");

        swap.assert();
        drop_old.assert();
    }
}
