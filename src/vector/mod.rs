//! Vector store integration: corpus management, k-NN search and the shared
//! retrieval policy.

mod client;
mod filters;
mod retrieval;
mod types;

pub use client::VectorStore;
pub use filters::{build_retrieval_filter, chunk_to_payload, payload_to_chunk};
pub use retrieval::{
    RetrievalError, drop_shared_cluster_rows, filter_phase_type, filter_question_chunks,
    filter_report_chunks, merge_with_structural, scale_k, semantic_with_structural,
};
pub use types::{
    Chunk, ChunkInsert, Corpus, RetrievalFilterArgs, ScoredChunk, VectorStoreError,
};
