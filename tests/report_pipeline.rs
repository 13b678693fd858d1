//! Report generation over mocked retrieval and generation backends.

mod common;

use agromine::blobstore::{BlobStore, MemoryBlobStore};
use agromine::embedding::{EmbeddingClient, HashEmbeddingClient};
use agromine::ingest::{IngestionScheduler, MemoryRecordSource, RecordSource};
use agromine::llm::{HttpLlmClient, LlmClient};
use agromine::pipeline::report::{ReportRequest, ReportService};
use agromine::tracker::InteractionTracker;
use agromine::vector::VectorStore;
use httpmock::{Method::POST, MockServer};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;

use common::{RecordingNotifier, llm_response, test_config};

fn contribution_row(expected: f64, reported: f64) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("indicator_acronym".into(), json!("IPI 1.1"));
    row.insert("year".into(), json!("2024"));
    row.insert("Milestone expected value".into(), json!(expected));
    row.insert("Milestone reported value".into(), json!(reported));
    row.insert("cluster_acronym".into(), json!("KE"));
    row
}

async fn build_report(
    qdrant: &MockServer,
    llm: &MockServer,
    source: Arc<MemoryRecordSource>,
) -> (ReportService, tempfile::TempDir) {
    let config = test_config(&qdrant.base_url(), &llm.base_url(), &qdrant.base_url());
    let store = Arc::new(VectorStore::from_config(&config).expect("store"));
    let embedding: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient::new(8));
    let blobstore: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
    let llm_client: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(
            llm.base_url(),
            None,
            "claude-test".into(),
            0,
            Duration::from_secs(5),
        )
        .expect("llm client"),
    );
    let source_dyn: Arc<dyn RecordSource> = source;
    let scheduler = Arc::new(IngestionScheduler::new(
        source_dyn.clone(),
        embedding.clone(),
        store.clone(),
        blobstore,
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

    let service = ReportService::new(store, embedding, llm_client, source_dyn, scheduler, tracker);
    (service, tempdir)
}

#[tokio::test]
async fn report_embeds_aggregates_and_appends_missed_links() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;

    // Semantic retrieval returns one cited and one uncited deliverable.
    qdrant
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/reference_corpus/points/query");
            then.status(200).json_body(json!({
                "result": [
                    {
                        "id": "d-1",
                        "score": 0.9,
                        "payload": {
                            "text": "deliverable: advisory bulletin",
                            "table_type": "deliverables",
                            "cluster_role": "Leading",
                            "cluster_acronym": "KE",
                            "indicator_acronym": "IPI 1.1",
                            "doi": "https://doi.org/10.1/cited"
                        }
                    }
                ]
            }));
        })
        .await;
    // Structural pass guarantees bibliographic evidence.
    qdrant
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/reference_corpus/points/scroll")
                .body_contains("is_empty");
            then.status(200).json_body(json!({
                "result": {
                    "points": [
                        {
                            "payload": {
                                "text": "deliverable: training manual",
                                "table_type": "deliverables",
                                "cluster_role": "Leading",
                                "cluster_acronym": "GH",
                                "indicator_acronym": "IPI 1.1",
                                "doi": "https://doi.org/10.1/uncited"
                            }
                        }
                    ],
                    "next_page_offset": null
                }
            }));
        })
        .await;
    // Question context for the targets section (empty for this indicator).
    qdrant
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/reference_corpus/points/scroll")
                .body_contains("vw_ai_questions");
            then.status(200)
                .json_body(json!({ "result": { "points": [], "next_page_offset": null } }));
        })
        .await;

    // Aggregates (10+20 expected, 4+11 reported) must reach the prompt.
    let generation = llm
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .body_contains("15 out of 30")
                .body_contains("50%");
            then.status(200).json_body(llm_response(
                "## IPI 1.1 narrative: the KE cluster published [a bulletin](https://doi.org/10.1/cited).",
            ));
        })
        .await;

    let source = Arc::new(MemoryRecordSource::new());
    source.seed(
        "vw_ai_project_contribution",
        vec![contribution_row(10.0, 4.0), contribution_row(20.0, 11.0)],
    );

    let (service, _dir) = build_report(&qdrant, &llm, source).await;
    let outcome = service
        .generate(ReportRequest {
            indicator: "IPI 1.1".into(),
            year: "2024".into(),
            insert_data: false,
            user_id: Some("user-1".into()),
        })
        .await
        .expect("outcome");

    generation.assert();
    assert!(outcome.report.contains("IPI 1.1 narrative"));
    assert!(outcome.report.contains("## Missed links"));
    assert!(outcome.report.contains("https://doi.org/10.1/uncited"));
    assert!(outcome.report.contains("(Cluster: GH)"));
    // The cited link is not listed as missed.
    assert_eq!(outcome.report.matches("10.1/cited").count(), 1);
    assert!(outcome.interaction_id.is_some());
}

#[tokio::test]
async fn blank_indicator_is_rejected() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    let (service, _dir) = build_report(&qdrant, &llm, Arc::new(MemoryRecordSource::new())).await;

    let err = service
        .generate(ReportRequest {
            indicator: "  ".into(),
            year: "2024".into(),
            insert_data: false,
            user_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        agromine::pipeline::PipelineError::InvalidInput(_)
    ));
}

#[tokio::test]
async fn indicator_tables_group_by_family_and_summarize_narratives() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;

    let summary_mock = llm
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .body_contains("KE: Completed the advisory rollout");
            then.status(200).json_body(llm_response(
                "KE completed the advisory rollout across two regions.",
            ));
        })
        .await;

    let mut with_narrative = contribution_row(10.0, 4.0);
    with_narrative.insert("indicator_title".into(), json!("Beneficiaries reached"));
    with_narrative.insert(
        "Milestone achieved narrative".into(),
        json!("Completed the advisory rollout"),
    );
    let source = Arc::new(MemoryRecordSource::new());
    source.seed("vw_ai_project_contribution", vec![with_narrative]);

    let (service, _dir) = build_report(&qdrant, &llm, source).await;
    let tables = service.indicator_tables("2024").await.expect("tables");

    summary_mock.assert();
    assert_eq!(tables.len(), 1);
    let rows = tables.get("IPI 1.x").expect("IPI 1.x group");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].indicator_statement, "Beneficiaries reached");
    assert_eq!(rows[0].end_year_target, 10.0);
    assert_eq!(rows[0].achieved, 4.0);
    assert!(rows[0].brief_overview.contains("advisory rollout"));
}

#[tokio::test]
async fn challenges_report_degrades_gracefully_without_data() {
    let qdrant = MockServer::start_async().await;
    let llm = MockServer::start_async().await;
    qdrant
        .mock_async(|when, then| {
            when.method(POST)
                .path("/collections/reference_corpus/points/scroll");
            then.status(200)
                .json_body(json!({ "result": { "points": [], "next_page_offset": null } }));
        })
        .await;

    let (service, _dir) = build_report(&qdrant, &llm, Arc::new(MemoryRecordSource::new())).await;
    let report = service.challenges("2024").await.expect("report");
    assert!(report.contains("Challenges and Lessons Learned - 2024"));
    assert!(report.contains("No challenges and lessons learned data available"));
}
