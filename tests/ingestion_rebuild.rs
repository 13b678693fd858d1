//! Atomic corpus rebuild: a refresh fills a fresh collection, swaps the alias
//! in one request and drops the superseded version.

mod common;

use agromine::blobstore::{BlobStore, MemoryBlobStore};
use agromine::embedding::{EmbeddingClient, HashEmbeddingClient};
use agromine::ingest::{IngestionScheduler, MemoryRecordSource, RecordSource};
use agromine::vector::{Corpus, VectorStore};
use httpmock::{Method::DELETE, Method::GET, Method::POST, Method::PUT, MockServer};
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::Arc;

use common::test_config;

fn deliverable_row(title: &str) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("title".into(), json!(title));
    row.insert("indicator_acronym".into(), json!("IPI 1.1"));
    row.insert("year".into(), json!(2024));
    row
}

#[tokio::test]
async fn refresh_builds_fresh_collection_and_swaps_alias() {
    let qdrant = MockServer::start_async().await;

    let create = qdrant
        .mock_async(|when, then| {
            when.method(PUT)
                .path_matches(Regex::new(r"^/collections/chat_corpus-v\d+$").expect("regex"));
            then.status(200).json_body(json!({ "status": "ok", "result": true }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(PUT)
                .path_matches(Regex::new(r"^/collections/chat_corpus-v\d+/index$").expect("regex"));
            then.status(200).json_body(json!({ "status": "ok", "result": true }));
        })
        .await;
    let upsert = qdrant
        .mock_async(|when, then| {
            when.method(PUT)
                .path_matches(
                    Regex::new(r"^/collections/chat_corpus-v\d+/points$").expect("regex"),
                )
                .body_contains("advisory bulletin");
            then.status(200).json_body(json!({ "status": "ok", "result": {} }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(GET).path("/aliases");
            then.status(200).json_body(json!({
                "result": { "aliases": [
                    { "alias_name": "chat_corpus", "collection_name": "chat_corpus-v1" }
                ] }
            }));
        })
        .await;
    let swap = qdrant
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/aliases")
                .body_contains("delete_alias")
                .body_contains("create_alias");
            then.status(200).json_body(json!({ "status": "ok", "result": true }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(GET).path("/collections");
            then.status(200).json_body(json!({
                "result": { "collections": [ { "name": "chat_corpus-v1" } ] }
            }));
        })
        .await;
    let drop_stale = qdrant
        .mock_async(|when, then| {
            when.method(DELETE).path("/collections/chat_corpus-v1");
            then.status(200).json_body(json!({ "status": "ok", "result": true }));
        })
        .await;

    let config = test_config(&qdrant.base_url(), &qdrant.base_url(), &qdrant.base_url());
    let store = Arc::new(VectorStore::from_config(&config).expect("store"));
    let embedding: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient::new(8));
    let blobstore: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());

    let source = Arc::new(MemoryRecordSource::new());
    source.seed(
        "vw_ai_deliverables",
        vec![
            deliverable_row("advisory bulletin"),
            deliverable_row("training manual"),
        ],
    );
    let source_dyn: Arc<dyn RecordSource> = source;

    let scheduler =
        IngestionScheduler::new(source_dyn, embedding, store, blobstore, &config);
    let outcome = scheduler
        .rebuild(Corpus::Chat, true)
        .await
        .expect("rebuild");

    // Five chat tables are processed; only deliverables carried rows.
    assert_eq!(outcome.tables, 5);
    assert_eq!(outcome.chunks, 2);

    create.assert();
    upsert.assert();
    swap.assert();
    drop_stale.assert();
}
