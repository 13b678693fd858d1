//! Retrieval policy shared by the extraction and report pipelines.
//!
//! Two complementary queries feed generation: a semantic k-NN pass whose `k`
//! scales with filter specificity, and a structural filter-only pass that
//! guarantees inclusion of bibliographic evidence (rows carrying a `doi`).
//! The merged context keeps insertion order, deduplicates rows by
//! `(doi, cluster_acronym, indicator_acronym)` and drops rows a cluster only
//! shares rather than owns.

use std::collections::HashSet;
use thiserror::Error;

use crate::embedding::{EmbeddingClient, EmbeddingClientError};

use super::client::VectorStore;
use super::types::{Chunk, Corpus, RetrievalFilterArgs, VectorStoreError};

/// Errors raised while assembling retrieval context.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// Query embedding failed entirely.
    #[error("Failed to embed retrieval query: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Vector store interaction failed.
    #[error("Vector store request failed: {0}")]
    Store(#[from] VectorStoreError),
}

/// `k` for the semantic pass: wide when the caller pinned at least two
/// attribute filters, narrow otherwise.
pub fn scale_k(specificity: usize) -> usize {
    if specificity >= 2 { 10_000 } else { 100 }
}

/// Semantic + structural retrieval over a corpus.
///
/// The structural pass is restricted to deliverable rows with a `doi`
/// present, issued under the same indicator/year filters. Zero semantic hits
/// still yield whatever the structural pass found.
pub async fn semantic_with_structural(
    store: &VectorStore,
    embedding: &dyn EmbeddingClient,
    query: &str,
    filters: &RetrievalFilterArgs,
    corpus: Corpus,
) -> Result<Vec<Chunk>, RetrievalError> {
    let k = scale_k(filters.specificity());
    let mut vectors = embedding
        .generate_embeddings(vec![query.to_string()])
        .await?;
    let query_vector = vectors.pop().unwrap_or_default();

    let semantic = if query_vector.is_empty() {
        tracing::warn!("Query embedding came back empty; falling back to structural retrieval only");
        Vec::new()
    } else {
        store
            .knn(corpus, query_vector, k, filters)
            .await?
            .into_iter()
            .map(|hit| hit.chunk)
            .collect()
    };

    let structural_filters = RetrievalFilterArgs {
        indicator: filters.indicator.clone(),
        year: filters.year.clone(),
        source_tables: Some(vec![crate::ingest::physical_table("deliverables")
            .unwrap_or("deliverables")
            .to_string()]),
        document_name: None,
    };
    let structural = store
        .filter_only(corpus, &structural_filters, Some("doi"))
        .await?;

    let merged = merge_with_structural(semantic, structural);
    Ok(drop_shared_cluster_rows(merged))
}

/// Merge semantic and structural results, keeping insertion order and
/// deduplicating by `(doi, cluster_acronym, indicator_acronym)` when all
/// three are present.
pub fn merge_with_structural(semantic: Vec<Chunk>, structural: Vec<Chunk>) -> Vec<Chunk> {
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut merged = Vec::new();

    for chunk in semantic.into_iter().chain(structural) {
        match dedupe_key(&chunk) {
            Some(key) => {
                if seen.insert(key) {
                    merged.push(chunk);
                }
            }
            None => merged.push(chunk),
        }
    }
    merged
}

fn dedupe_key(chunk: &Chunk) -> Option<(String, String, String)> {
    let doi = chunk.attribute("doi")?;
    let cluster = chunk.attribute("cluster_acronym")?;
    let indicator = chunk.attribute("indicator_acronym")?;
    Some((doi.to_string(), cluster.to_string(), indicator.to_string()))
}

/// Drop deliverable and innovation rows a cluster only shares.
pub fn drop_shared_cluster_rows(chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks
        .into_iter()
        .filter(|chunk| {
            !(matches!(
                chunk.attribute("table_type"),
                Some("deliverables") | Some("innovations")
            ) && chunk.attribute("cluster_role") == Some("Shared"))
        })
        .collect()
}

/// Report-specific row exclusions on top of the shared-cluster rule:
/// shared OICRs and planning-phase contribution rows carry no reportable
/// achievement and are removed.
pub fn filter_report_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    drop_shared_cluster_rows(chunks)
        .into_iter()
        .filter(|chunk| {
            let table_type = chunk.attribute("table_type");
            let phase = chunk.attribute("phase_name");
            !(table_type == Some("oicrs") && chunk.attribute("cluster_role") == Some("Shared"))
                && !(table_type == Some("contributions")
                    && matches!(phase, Some("AWPB") | Some("Progress")))
        })
        .collect()
}

/// Question-prefix exclusions for the disaggregated-targets context.
///
/// Some indicators reuse question numbering across sections; the pairs below
/// pin each indicator to its own section of the questionnaire.
const EXCLUDED_QUESTION_PREFIXES: [(&str, &str); 6] = [
    ("PDO Indicator 1", "2.0"),
    ("PDO Indicator 2", "3.0"),
    ("PDO Indicator 3", "3.0"),
    ("IPI 2.3", "0"),
    ("IPI 2.3", "1"),
    ("IPI 2.3", "2"),
];

/// Filter question/contribution rows for the targets section of a report.
pub fn filter_question_chunks(chunks: Vec<Chunk>) -> Vec<Chunk> {
    chunks
        .into_iter()
        .filter(|chunk| {
            let table_type = chunk.attribute("table_type");
            let phase = chunk.attribute("phase_name");
            if matches!(table_type, Some("questions") | Some("contributions"))
                && matches!(phase, Some("AWPB") | Some("Progress"))
            {
                return false;
            }
            if let (Some(indicator), Some(question)) =
                (chunk.attribute("indicator_acronym"), chunk.attribute("question"))
            {
                for (excluded_indicator, prefix) in EXCLUDED_QUESTION_PREFIXES {
                    if indicator == excluded_indicator && question.starts_with(prefix) {
                        return false;
                    }
                }
            }
            true
        })
        .collect()
}

/// In-process phase filter for conversational retrieval: contribution and
/// question rows must match the selected phase type; other tables pass.
pub fn filter_phase_type(chunks: Vec<Chunk>, phase_type: Option<&str>) -> Vec<Chunk> {
    let Some(phase_type) = phase_type else {
        return chunks;
    };
    chunks
        .into_iter()
        .filter(|chunk| {
            if matches!(
                chunk.attribute("table_type"),
                Some("questions") | Some("contributions")
            ) {
                chunk
                    .attribute("phase_name")
                    .map(|phase| phase.contains(phase_type))
                    .unwrap_or(true)
            } else {
                true
            }
        })
        .collect()
}
