use agromine::api::{self, AppState};
use anyhow::Context;
use agromine::auth::HttpTokenValidator;
use agromine::blobstore::{BlobStore, HttpBlobStore};
use agromine::config;
use agromine::embedding::{EmbeddingClient, HttpEmbeddingClient};
use agromine::ingest::{HttpRecordSource, IngestionScheduler, RecordSource};
use agromine::llm::{HttpLlmClient, LlmClient};
use agromine::logging;
use agromine::mapping::MappingClient;
use agromine::notify::{Notifier, NullNotifier, WebhookNotifier};
use agromine::pipeline::chat::ChatService;
use agromine::pipeline::extract::{ExtractionService, ExtractionSettings};
use agromine::pipeline::fast::FastResponseService;
use agromine::pipeline::report::ReportService;
use agromine::tracker::InteractionTracker;
use agromine::vector::{Corpus, VectorStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_config();
    let config = config::get_config();
    logging::init_tracing(config.environment);
    let step_timeout = Duration::from_secs(config.step_timeout_secs);

    let notifier: Arc<dyn Notifier> = match &config.notifier_webhook_url {
        Some(url) => Arc::new(
            WebhookNotifier::new(url.clone(), config.service_name.clone(), step_timeout)
                .expect("Failed to construct notifier"),
        ),
        None => Arc::new(NullNotifier),
    };

    let blobstore: Arc<dyn BlobStore> = Arc::new(
        HttpBlobStore::new(
            config.blobstore_url.clone(),
            config.blobstore_api_key.clone(),
            step_timeout,
        )
        .expect("Failed to construct blob store client"),
    );
    let embedding: Arc<dyn EmbeddingClient> = Arc::new(
        HttpEmbeddingClient::new(
            config.embedding_url.clone(),
            config.embedding_api_key.clone(),
            config.embedding_model.clone(),
            config.embedding_dimension,
            step_timeout,
        )
        .expect("Failed to construct embedding client"),
    );
    let store =
        Arc::new(VectorStore::from_config(config).expect("Failed to construct vector store client"));
    let llm: Arc<dyn LlmClient> = Arc::new(
        HttpLlmClient::new(
            config.llm_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
            config.llm_max_retries,
            Duration::from_secs(config.request_deadline_secs),
        )
        .expect("Failed to construct LLM client"),
    );
    let mapping =
        Arc::new(MappingClient::from_config(config).expect("Failed to construct mapping client"));
    let tracker = Arc::new(
        InteractionTracker::connect(&config.tracker_db_path, config.environment, notifier.clone())
            .await
            .expect("Failed to open the interaction store"),
    );
    let validator = Arc::new(HttpTokenValidator::from_config(config, notifier.clone()));
    let source: Arc<dyn RecordSource> =
        Arc::new(HttpRecordSource::from_config(config).expect("Failed to construct record source"));
    let scheduler = Arc::new(IngestionScheduler::new(
        source.clone(),
        embedding.clone(),
        store.clone(),
        blobstore.clone(),
        config,
    ));

    // Fail fast when the vector store is unreachable, then make sure every
    // corpus exists before serving traffic.
    store
        .list_collections()
        .await
        .context("Vector store is unreachable")?;
    for corpus in [Corpus::Reference, Corpus::Ephemeral, Corpus::Chat] {
        store
            .ensure_corpus(corpus)
            .await
            .context("Failed to ensure vector corpus")?;
    }

    let extraction = Arc::new(ExtractionService::new(
        blobstore.clone(),
        embedding.clone(),
        store.clone(),
        llm.clone(),
        mapping.clone(),
        tracker.clone(),
        validator,
        scheduler.clone(),
        ExtractionSettings::from_config(config),
    ));
    let report = Arc::new(ReportService::new(
        store.clone(),
        embedding.clone(),
        llm.clone(),
        source.clone(),
        scheduler.clone(),
        tracker.clone(),
    ));
    let chat = Arc::new(ChatService::new(
        store.clone(),
        embedding.clone(),
        llm.clone(),
        scheduler.clone(),
        tracker.clone(),
    ));
    let fast = Arc::new(FastResponseService::new(llm.clone(), tracker.clone()));

    let app = api::create_router(Arc::new(AppState {
        extraction,
        report,
        chat,
        fast,
        mapping,
        tracker,
        scheduler,
    }));

    let (listener, port) = bind_listener().await.context("Failed to bind listener")?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 8100..=8199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 8100-8199",
    ))
}
