//! Extraction pipeline: the central orchestrator for one document request.
//!
//! A request authenticates, ensures reference data, fetches and decodes the
//! source document, chunks it, and branches: tabular bulk uploads fan out to
//! a bounded worker pool (one generation call per batch of rows, merged in
//! batch order); everything else is embedded into the ephemeral corpus,
//! retrieved against, and mined in a single generation call. Output is
//! validated per result, enriched with canonical identifiers, tracked, and
//! the ephemeral namespace is deleted on every exit path.

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::artifact::{MiningResponse, ResultRecord, UnparsedResult, parse_llm_results};
use crate::blobstore::BlobStore;
use crate::chunking::split_text;
use crate::config::{Config, Project};
use crate::decode::{self, NormalizedDocument};
use crate::embedding::EmbeddingClient;
use crate::ingest::IngestionScheduler;
use crate::llm::{DEFAULT_TEMPERATURE, LlmClient};
use crate::mapping::{MappingClient, apply_mapping, collect_entries};
use crate::prompts;
use crate::tracker::{InteractionTracker, TrackRequest};
use crate::vector::{Corpus, RetrievalFilterArgs, VectorStore};
use crate::auth::TokenValidator;

use super::{PhaseTracker, PipelineError, RequestPhase};

/// Ephemeral chunks retrieved as document context for one mining call.
const RELEVANT_CHUNK_K: usize = 10;
/// Token budget for single-document mining.
const MINING_MAX_TOKENS: u32 = 5_000;
/// Token budget for one bulk batch.
const BULK_MAX_TOKENS: u32 = 8_000;

/// The task requested for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningTask {
    /// Single-document extraction with retrieval.
    Standard,
    /// Batched extraction of a spreadsheet export.
    BulkUpload,
}

/// One extraction request.
#[derive(Debug, Clone)]
pub struct MiningRequest {
    /// Project whose token validator and references apply.
    pub project: Project,
    /// Bucket holding the source document.
    pub bucket: String,
    /// Object key of the source document.
    pub key: String,
    /// Frontend access token.
    pub token: String,
    /// User on whose behalf the request runs.
    pub user_id: Option<String>,
    /// Requested task.
    pub task: MiningTask,
}

/// Result of one extraction request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MiningOutcome {
    /// Validated extraction artifact.
    pub content: MiningResponse,
    /// Wall-clock processing time in seconds.
    pub time_taken: f64,
    /// Interaction id assigned by the tracker, when tracking succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
}

/// Tunables lifted from configuration at construction.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Character budget per text chunk.
    pub chunk_size: usize,
    /// Character overlap between adjacent chunks.
    pub chunk_overlap: usize,
    /// Rows per bulk batch.
    pub batch_size: usize,
    /// Upper bound on concurrent bulk workers.
    pub max_workers: usize,
    /// Overall request deadline.
    pub request_deadline: Duration,
}

impl ExtractionSettings {
    /// Lift the extraction tunables from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            batch_size: config.bulk_batch_size,
            max_workers: config.bulk_max_workers,
            request_deadline: Duration::from_secs(config.request_deadline_secs),
        }
    }
}

/// Orchestrates one document extraction end to end.
pub struct ExtractionService {
    blobstore: Arc<dyn BlobStore>,
    embedding: Arc<dyn EmbeddingClient>,
    store: Arc<VectorStore>,
    llm: Arc<dyn LlmClient>,
    mapping: Arc<MappingClient>,
    tracker: Arc<InteractionTracker>,
    validator: Arc<dyn TokenValidator>,
    scheduler: Arc<IngestionScheduler>,
    settings: ExtractionSettings,
}

impl ExtractionService {
    /// Assemble the service from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blobstore: Arc<dyn BlobStore>,
        embedding: Arc<dyn EmbeddingClient>,
        store: Arc<VectorStore>,
        llm: Arc<dyn LlmClient>,
        mapping: Arc<MappingClient>,
        tracker: Arc<InteractionTracker>,
        validator: Arc<dyn TokenValidator>,
        scheduler: Arc<IngestionScheduler>,
        settings: ExtractionSettings,
    ) -> Self {
        Self {
            blobstore,
            embedding,
            store,
            llm,
            mapping,
            tracker,
            validator,
            scheduler,
            settings,
        }
    }

    /// Run one extraction request through the full state machine.
    pub async fn process_document(
        &self,
        request: MiningRequest,
    ) -> Result<MiningOutcome, PipelineError> {
        let started = Instant::now();
        let mut phases = PhaseTracker::new(format!("{}/{}", request.bucket, request.key));

        if !self
            .validator
            .validate(request.project, &request.token)
            .await
        {
            let error = PipelineError::AuthDenied;
            phases.fail(&error);
            return Err(error);
        }
        phases.advance(RequestPhase::Authenticated);

        let document_name = ephemeral_namespace(&request.key);
        let run = tokio::time::timeout(
            self.settings.request_deadline,
            self.run_pipeline(&request, &document_name, &mut phases),
        )
        .await;

        // Cleanup is deferred: whatever happened above, the ephemeral
        // namespace must not outlive the request.
        if let Err(error) = self.store.delete_ephemeral(&document_name).await {
            tracing::warn!(%document_name, error = %error, "Ephemeral cleanup failed");
        }

        let content = match run {
            Err(_) => {
                let error = PipelineError::Timeout;
                phases.fail(&error);
                return Err(error);
            }
            Ok(Err(error)) => {
                phases.fail(&error);
                return Err(error);
            }
            Ok(Ok(content)) => content,
        };

        let time_taken = started.elapsed().as_secs_f64();
        let interaction_id = self.track(&request, &content, time_taken).await;
        phases.advance(RequestPhase::Returned);
        tracing::info!(
            bucket = %request.bucket,
            key = %request.key,
            results = content.results.len(),
            time_taken,
            "Mining request completed"
        );

        Ok(MiningOutcome {
            content,
            time_taken,
            interaction_id,
        })
    }

    async fn run_pipeline(
        &self,
        request: &MiningRequest,
        document_name: &str,
        phases: &mut PhaseTracker,
    ) -> Result<MiningResponse, PipelineError> {
        self.scheduler
            .ensure_reference_seeded(request.project)
            .await?;

        let bytes = self.blobstore.get(&request.bucket, &request.key).await?;
        let document = decode::decode(&bytes, &decode::extension_of(&request.key))?;
        phases.advance(RequestPhase::Decoded);

        let chunks = match &document {
            NormalizedDocument::Tabular(rows) => rows.clone(),
            NormalizedDocument::Text(text) => split_text(
                text,
                self.settings.chunk_size,
                self.settings.chunk_overlap,
            ),
        };
        tracing::info!(chunks = chunks.len(), tabular = document.is_tabular(), "Document chunked");

        if chunks.is_empty() {
            phases.advance(RequestPhase::Validated);
            return Ok(MiningResponse::default());
        }

        let mut results =
            if document.is_tabular() && request.task == MiningTask::BulkUpload {
                self.run_batches(chunks, phases).await?
            } else {
                self.run_single(request.project, chunks, document_name, phases)
                    .await?
            };
        phases.advance(RequestPhase::Validated);

        let entries = collect_entries(&results);
        if !entries.is_empty() {
            let mapped = self.mapping.resolve_with_retry(&entries).await;
            apply_mapping(&mut results, &mapped);
        }
        phases.advance(RequestPhase::Enriched);

        Ok(MiningResponse { results })
    }

    /// Non-tabular path: embed, index ephemeral, retrieve, generate once.
    async fn run_single(
        &self,
        project: Project,
        chunks: Vec<String>,
        document_name: &str,
        phases: &mut PhaseTracker,
    ) -> Result<Vec<ResultRecord>, PipelineError> {
        let vectors = self.embedding.generate_embeddings(chunks.clone()).await?;
        let inserts = chunks
            .into_iter()
            .zip(vectors)
            .map(|(text, vector)| crate::vector::ChunkInsert {
                chunk: crate::vector::Chunk::new(text),
                vector,
            })
            .collect();
        self.store.put_ephemeral(document_name, inserts).await?;
        phases.advance(RequestPhase::Indexed);

        let task_prompt = prompts::mining_prompt(project);
        let reference = self.store.reference_texts().await?;
        let relevant = self
            .retrieve_relevant(&task_prompt, document_name)
            .await?;
        phases.advance(RequestPhase::Retrieved);

        let mut context = reference;
        context.extend(relevant);
        let prompt = prompts::answer_with_context(&context.join("\n"), &task_prompt);
        let raw = self
            .llm
            .invoke(&prompt, MINING_MAX_TOKENS, DEFAULT_TEMPERATURE)
            .await?;
        phases.advance(RequestPhase::Generated);

        Ok(parse_llm_results(&raw, None))
    }

    /// Chunks of the indexed document most relevant to the task prompt.
    async fn retrieve_relevant(
        &self,
        task_prompt: &str,
        document_name: &str,
    ) -> Result<Vec<String>, PipelineError> {
        let mut vectors = self
            .embedding
            .generate_embeddings(vec![task_prompt.to_string()])
            .await?;
        let query_vector = vectors.pop().unwrap_or_default();
        if query_vector.is_empty() {
            tracing::warn!("Query embedding unavailable; continuing with reference context only");
            return Ok(Vec::new());
        }

        let filters = RetrievalFilterArgs {
            document_name: Some(document_name.to_string()),
            ..Default::default()
        };
        let hits = self
            .store
            .knn(Corpus::Ephemeral, query_vector, RELEVANT_CHUNK_K, &filters)
            .await?;
        Ok(hits.into_iter().map(|hit| hit.chunk.text).collect())
    }

    /// Tabular bulk path: batches dispatched to a bounded worker pool, with
    /// results merged in batch-number order regardless of completion order.
    async fn run_batches(
        &self,
        rows: Vec<String>,
        phases: &mut PhaseTracker,
    ) -> Result<Vec<ResultRecord>, PipelineError> {
        let batches: Vec<Vec<String>> = rows
            .chunks(self.settings.batch_size)
            .map(|batch| batch.to_vec())
            .collect();
        tracing::info!(
            batches = batches.len(),
            batch_size = self.settings.batch_size,
            workers = self.settings.max_workers,
            "Dispatching bulk batches"
        );

        let reference: Arc<str> = self.store.reference_texts().await?.join("\n").into();
        phases.advance(RequestPhase::Retrieved);

        let semaphore = Arc::new(Semaphore::new(self.settings.max_workers));
        let mut workers: JoinSet<(u32, Vec<ResultRecord>)> = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let batch_number = (index + 1) as u32;
            let semaphore = semaphore.clone();
            let llm = self.llm.clone();
            let reference = reference.clone();

            workers.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                tracing::debug!(batch_number, rows = batch.len(), "Processing batch");

                let context = format!(
                    "{reference}\n\nBatch Data to Process:\n{}",
                    batch.join("\n")
                );
                let prompt =
                    prompts::instruct_with_context(&context, prompts::bulk_capdev_prompt());
                match llm.invoke(&prompt, BULK_MAX_TOKENS, DEFAULT_TEMPERATURE).await {
                    Ok(raw) => (batch_number, parse_llm_results(&raw, Some(batch_number))),
                    Err(error) => {
                        tracing::error!(batch_number, error = %error, "Batch generation failed");
                        let unparsed = UnparsedResult::new(
                            format!("batch generation failed: {error}"),
                            Some(batch_number),
                        );
                        (batch_number, vec![ResultRecord::Unparsed(unparsed)])
                    }
                }
            });
        }

        let mut collected: Vec<(u32, Vec<ResultRecord>)> = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(batch_results) => collected.push(batch_results),
                Err(error) => {
                    tracing::error!(error = %error, "Bulk worker panicked");
                }
            }
        }
        phases.advance(RequestPhase::Generated);

        collected.sort_by_key(|(batch_number, _)| *batch_number);
        Ok(collected
            .into_iter()
            .flat_map(|(_, results)| results)
            .collect())
    }

    /// Fire-and-log interaction tracking; never fatal for the request.
    async fn track(
        &self,
        request: &MiningRequest,
        content: &MiningResponse,
        time_taken: f64,
    ) -> Option<String> {
        let ai_output = serde_json::to_string(content).unwrap_or_default();
        if ai_output.trim().is_empty() {
            return None;
        }
        let track_request = TrackRequest {
            user_id: request
                .user_id
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            session_id: None,
            service_name: "text-mining".into(),
            user_input: Some(format!("{}/{}", request.bucket, request.key)),
            ai_output,
            context: json!({
                "project": request.project.to_string(),
                "bucket": request.bucket,
                "key": request.key,
                "task": match request.task {
                    MiningTask::Standard => "standard",
                    MiningTask::BulkUpload => "bulk-upload",
                },
            }),
            response_time_seconds: Some(time_taken),
            ..Default::default()
        };

        match self.tracker.track(track_request).await {
            Ok(interaction_id) => Some(interaction_id),
            Err(error) => {
                tracing::error!(error = %error, "Interaction tracking failed");
                None
            }
        }
    }
}

/// Namespace for one request's ephemeral vectors: the normalized object key
/// plus the request timestamp.
pub fn ephemeral_namespace(key: &str) -> String {
    let normalized: String = key
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();

    let format = time::format_description::parse(
        "[year]-[month]-[day]_[hour]-[minute]-[second]",
    )
    .expect("static timestamp format");
    let timestamp = time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "1970-01-01_00-00-00".to_string());

    // A random suffix keeps two uploads of the same file within one second
    // from sharing a namespace.
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{normalized}_{timestamp}_{}", &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_normalizes_the_object_key() {
        let namespace = ephemeral_namespace("star/Annual Report (final).PDF");
        assert!(namespace.starts_with("starannual_report_final.pdf_"));
        assert!(!namespace.contains(' '));
        assert!(!namespace.contains('('));
    }

    #[test]
    fn namespaces_are_unique_per_request() {
        let first = ephemeral_namespace("doc.pdf");
        let second = ephemeral_namespace("doc.pdf");
        assert_ne!(first, second);
    }

    #[test]
    fn batch_partitioning_covers_all_rows() {
        let rows: Vec<String> = (0..47).map(|i| format!("row {i}")).collect();
        let batches: Vec<Vec<String>> = rows.chunks(5).map(|batch| batch.to_vec()).collect();
        assert_eq!(batches.len(), 10);
        assert_eq!(batches.last().map(Vec::len), Some(2));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 47);
    }
}
