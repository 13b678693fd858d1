//! End-to-end extraction scenarios over mocked collaborators.

mod common;

use agromine::artifact::{ExtractionResult, ResultRecord};
use agromine::blobstore::{BlobStore, MemoryBlobStore};
use agromine::config::Project;
use agromine::embedding::{EmbeddingClient, HashEmbeddingClient};
use agromine::ingest::{IngestionScheduler, MemoryRecordSource, RecordSource};
use agromine::llm::{HttpLlmClient, LlmClient};
use agromine::mapping::MappingClient;
use agromine::pipeline::PipelineError;
use agromine::pipeline::extract::{
    ExtractionService, ExtractionSettings, MiningRequest, MiningTask,
};
use agromine::tracker::InteractionTracker;
use agromine::vector::VectorStore;
use bytes::Bytes;
use httpmock::{Method::GET, Method::POST, Method::PUT, Mock, MockServer};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{RecordingNotifier, StaticValidator, llm_response, test_config};

struct Harness {
    service: ExtractionService,
    blobstore: Arc<MemoryBlobStore>,
    _tempdir: tempfile::TempDir,
}

/// Register the vector store endpoints every extraction request touches.
async fn mount_qdrant<'a>(server: &'a MockServer, reference_text: &str) -> (Mock<'a>, Mock<'a>) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/aliases");
            then.status(200).json_body(json!({
                "result": { "aliases": [
                    { "alias_name": "reference_corpus", "collection_name": "reference_corpus-v1" }
                ] }
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/collections/ephemeral_documents");
            then.status(200).json_body(json!({ "result": {} }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/reference_corpus/points/count");
            then.status(200)
                .json_body(json!({ "result": { "count": 2 } }));
        })
        .await;
    server
        .mock_async(move |when, then| {
            when.method(POST)
                .path("/collections/reference_corpus/points/scroll");
            then.status(200).json_body(json!({
                "result": {
                    "points": [ { "payload": { "text": reference_text } } ],
                    "next_page_offset": null
                }
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path("/collections/ephemeral_documents/points");
            then.status(200).json_body(json!({ "status": "ok", "result": {} }));
        })
        .await;
    let query = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/ephemeral_documents/points/query");
            then.status(200).json_body(json!({
                "result": [
                    {
                        "id": "doc-1",
                        "score": 0.88,
                        "payload": { "text": "document chunk retrieved from the upload" }
                    }
                ]
            }));
        })
        .await;
    let delete = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/ephemeral_documents/points/delete");
            then.status(200).json_body(json!({ "status": "ok", "result": {} }));
        })
        .await;
    (query, delete)
}

async fn build_harness(
    qdrant: &MockServer,
    llm: &MockServer,
    mapping: &MockServer,
    accept_token: bool,
) -> Harness {
    let config = test_config(&qdrant.base_url(), &llm.base_url(), &mapping.base_url());

    let store = Arc::new(VectorStore::from_config(&config).expect("store"));
    let embedding: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient::new(8));
    let blobstore = Arc::new(MemoryBlobStore::new());
    let blobstore_dyn: Arc<dyn BlobStore> = blobstore.clone();
    let llm_client: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(
            llm.base_url(),
            None,
            "claude-test".into(),
            0,
            Duration::from_secs(10),
        )
        .expect("llm client"),
    );
    let mapping_client = Arc::new(MappingClient::from_config(&config).expect("mapping client"));
    let source: Arc<dyn RecordSource> = Arc::new(MemoryRecordSource::new());
    let scheduler = Arc::new(IngestionScheduler::new(
        source,
        embedding.clone(),
        store.clone(),
        blobstore_dyn.clone(),
        &config,
    ));

    let tempdir = tempfile::tempdir().expect("tempdir");
    let tracker = Arc::new(
        InteractionTracker::connect(
            tempdir.path().join("interactions.db").to_str().expect("path"),
            config.environment,
            Arc::new(RecordingNotifier::new()),
        )
        .await
        .expect("tracker"),
    );

    let service = ExtractionService::new(
        blobstore_dyn,
        embedding,
        store,
        llm_client,
        mapping_client,
        tracker,
        Arc::new(StaticValidator {
            accept: accept_token,
        }),
        scheduler,
        ExtractionSettings::from_config(&config),
    );

    Harness {
        service,
        blobstore,
        _tempdir: tempdir,
    }
}

fn request(bucket: &str, key: &str, task: MiningTask) -> MiningRequest {
    MiningRequest {
        project: Project::Star,
        bucket: bucket.into(),
        key: key.into(),
        token: "token-1".into(),
        user_id: Some("user-1".into()),
        task,
    }
}

#[tokio::test]
async fn txt_document_yields_one_validated_result() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;
    let (_query, delete) = mount_qdrant(&qdrant, "REFERENCE REGION ROW").await;

    // The generator states a total of 50 against gender counts summing to 42;
    // the validator must settle on 42 without inventing participants.
    let generated = json!({
        "results": [
            {
                "indicator": "Capacity Sharing for Development",
                "title": "Training of trainers",
                "description": "Farmer-level training of trainers session",
                "keywords": ["training", "trainers"],
                "geoscope": { "level": "Global" },
                "training_type": "Group training",
                "total_participants": 50,
                "male_participants": 16,
                "female_participants": 24,
                "non_binary_participants": 2,
                "main_contact_person": { "name": "Ana Rojas" }
            }
        ]
    });
    llm.mock_async(move |when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200)
            .json_body(llm_response(&generated.to_string()));
    })
    .await;
    mapping
        .mock_async(|when, then| {
            when.method(POST).path("/staff/_search");
            then.status(200).json_body(json!({
                "hits": { "hits": [
                    { "_score": 10.5, "_source": { "carnet": 981, "first_name": "Ana", "last_name": "Rojas" } }
                ] }
            }));
        })
        .await;

    let harness = build_harness(&qdrant, &llm, &mapping, true).await;
    harness.blobstore.seed(
        "docs",
        "report.txt",
        Bytes::from_static(
            b"A training-of-trainers was held with 24 women, 16 men, 2 non-binary, 42 total.",
        ),
    );

    let outcome = harness
        .service
        .process_document(request("docs", "report.txt", MiningTask::Standard))
        .await
        .expect("outcome");

    assert_eq!(outcome.content.results.len(), 1);
    let ResultRecord::Parsed(ExtractionResult::CapacitySharing(capdev)) =
        &outcome.content.results[0]
    else {
        panic!("expected a parsed capacity sharing result");
    };
    assert_eq!(capdev.training_type.as_deref(), Some("Group training"));
    assert_eq!(capdev.total_participants, Some(42));
    assert_eq!(capdev.male_participants, Some(16));
    assert_eq!(capdev.female_participants, Some(24));
    assert_eq!(capdev.non_binary_participants, Some(2));

    let contact = capdev.base.main_contact_person.as_ref().expect("contact");
    assert_eq!(contact.code.as_deref(), Some("981"));
    assert_eq!(contact.similarity_score, Some(10.5));

    assert!(outcome.interaction_id.is_some());
    assert!(outcome.time_taken >= 0.0);
    // The ephemeral namespace is released before the response is returned.
    delete.assert();
}

fn build_bulk_xlsx(rows: usize) -> Vec<u8> {
    let mut shared = vec!["Name".to_string(), "Trainees".to_string()];
    let mut sheet = String::from(
        "<row r=\"1\"><c r=\"A1\" t=\"s\"><v>0</v></c><c r=\"B1\" t=\"s\"><v>1</v></c></row>",
    );
    for i in 1..=rows {
        shared.push(format!("row{i}"));
        sheet.push_str(&format!(
            "<row r=\"{row}\"><c r=\"A{row}\" t=\"s\"><v>{idx}</v></c><c r=\"B{row}\"><v>{count}</v></c></row>",
            row = i + 1,
            idx = i + 1,
            count = i * 2,
        ));
    }

    let strings: String = shared
        .iter()
        .map(|s| format!("<si><t>{s}</t></si>"))
        .collect();
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        writer
            .start_file("xl/sharedStrings.xml", options)
            .expect("start shared strings");
        writer
            .write_all(format!("<sst>{strings}</sst>").as_bytes())
            .expect("write shared strings");
        writer
            .start_file("xl/worksheets/sheet1.xml", options)
            .expect("start sheet");
        writer
            .write_all(
                format!("<worksheet><sheetData>{sheet}</sheetData></worksheet>").as_bytes(),
            )
            .expect("write sheet");
        writer.finish().expect("finish zip");
    }
    cursor.into_inner()
}

fn batch_results(count: usize) -> serde_json::Value {
    let results: Vec<serde_json::Value> = (0..count)
        .map(|i| {
            json!({
                "indicator": "Capacity Sharing for Development",
                "title": format!("Row result {i}"),
                "description": "Extracted from one spreadsheet row",
                "keywords": ["training"],
                "geoscope": { "level": "Global" }
            })
        })
        .collect();
    json!({ "results": results })
}

#[tokio::test]
async fn bulk_upload_of_47_rows_runs_ten_ordered_batches() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;
    mount_qdrant(&qdrant, "REFERENCE REGION ROW").await;

    // Nine full batches of five rows; the tenth carries rows 46 and 47. One
    // mock per batch, keyed by the unique first row of that batch.
    let mut batch_mocks = Vec::new();
    for batch in 0..10 {
        let first_row = batch * 5 + 1;
        let rows_in_batch = if batch == 9 { 2 } else { 5 };
        let marker = format!("Name: row{first_row},");
        let response = llm_response(&batch_results(rows_in_batch).to_string());
        let mock = llm
            .mock_async(move |when, then| {
                when.method(POST).path("/v1/messages").body_contains(marker);
                then.status(200).json_body(response);
            })
            .await;
        batch_mocks.push(mock);
    }

    let harness = build_harness(&qdrant, &llm, &mapping, true).await;
    harness.blobstore.seed(
        "docs",
        "capdev_upload.xlsx",
        Bytes::from(build_bulk_xlsx(47)),
    );

    let outcome = harness
        .service
        .process_document(request("docs", "capdev_upload.xlsx", MiningTask::BulkUpload))
        .await
        .expect("outcome");

    for mock in &batch_mocks {
        assert_eq!(mock.hits(), 1);
    }
    assert_eq!(outcome.content.results.len(), 47);

    let batch_numbers: Vec<u32> = outcome
        .content
        .results
        .iter()
        .map(|result| result.batch_number().expect("batch number"))
        .collect();
    assert!(
        batch_numbers.windows(2).all(|pair| pair[0] <= pair[1]),
        "batch numbers must be non-decreasing: {batch_numbers:?}"
    );
    assert_eq!(batch_numbers.first(), Some(&1));
    assert_eq!(batch_numbers.last(), Some(&10));
}

#[tokio::test]
async fn rejected_token_fails_before_any_processing() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;

    let harness = build_harness(&qdrant, &llm, &mapping, false).await;
    harness
        .blobstore
        .seed("docs", "report.txt", Bytes::from_static(b"content"));

    let err = harness
        .service
        .process_document(request("docs", "report.txt", MiningTask::Standard))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::AuthDenied));
}

#[tokio::test]
async fn unsupported_extension_is_invalid_input() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;
    mount_qdrant(&qdrant, "REFERENCE").await;

    let harness = build_harness(&qdrant, &llm, &mapping, true).await;
    harness
        .blobstore
        .seed("docs", "data.csv", Bytes::from_static(b"a,b\n1,2"));

    let err = harness
        .service
        .process_document(request("docs", "data.csv", MiningTask::Standard))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
}

#[tokio::test]
async fn empty_document_returns_empty_results() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;
    mount_qdrant(&qdrant, "REFERENCE").await;

    let harness = build_harness(&qdrant, &llm, &mapping, true).await;
    harness
        .blobstore
        .seed("docs", "empty.txt", Bytes::from_static(b"   \n  "));

    let outcome = harness
        .service
        .process_document(request("docs", "empty.txt", MiningTask::Standard))
        .await
        .expect("outcome");
    assert!(outcome.content.results.is_empty());
}

#[tokio::test]
async fn missing_blob_maps_to_not_found() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;
    mount_qdrant(&qdrant, "REFERENCE").await;

    let harness = build_harness(&qdrant, &llm, &mapping, true).await;
    let err = harness
        .service
        .process_document(request("docs", "missing.txt", MiningTask::Standard))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotFound(_)));
}

#[tokio::test]
async fn zero_retrieval_hits_still_invoke_the_model_with_reference_context() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let mapping = MockServer::start_async().await;

    // Same harness mocks, but the ephemeral query returns nothing.
    qdrant
        .mock_async(|when, then| {
            when.method(GET).path("/aliases");
            then.status(200).json_body(json!({
                "result": { "aliases": [
                    { "alias_name": "reference_corpus", "collection_name": "reference_corpus-v1" }
                ] }
            }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(GET).path("/collections/ephemeral_documents");
            then.status(200).json_body(json!({ "result": {} }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(POST).path("/collections/reference_corpus/points/count");
            then.status(200).json_body(json!({ "result": { "count": 1 } }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(POST).path("/collections/reference_corpus/points/scroll");
            then.status(200).json_body(json!({
                "result": {
                    "points": [ { "payload": { "text": "REFERENCE ONLY ROW" } } ],
                    "next_page_offset": null
                }
            }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(PUT).path("/collections/ephemeral_documents/points");
            then.status(200).json_body(json!({ "status": "ok", "result": {} }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(POST).path("/collections/ephemeral_documents/points/query");
            then.status(200).json_body(json!({ "result": [] }));
        })
        .await;
    qdrant
        .mock_async(|when, then| {
            when.method(POST).path("/collections/ephemeral_documents/points/delete");
            then.status(200).json_body(json!({ "status": "ok", "result": {} }));
        })
        .await;

    let generation = llm
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .body_contains("REFERENCE ONLY ROW");
            then.status(200)
                .json_body(llm_response("{\"results\": []}"));
        })
        .await;

    let harness = build_harness(&qdrant, &llm, &mapping, true).await;
    harness
        .blobstore
        .seed("docs", "report.txt", Bytes::from_static(b"some document text"));

    let outcome = harness
        .service
        .process_document(request("docs", "report.txt", MiningTask::Standard))
        .await
        .expect("outcome");

    generation.assert();
    assert!(outcome.content.results.is_empty());
}
