//! Extraction, report and conversational orchestrators.
//!
//! The pipelines share one error taxonomy (mapped to HTTP status classes by
//! the API layer) and a per-request state machine that logs every phase
//! transition. Any phase may fail; failures after indexing still release the
//! ephemeral namespace through a deferred cleanup in the extraction path.

pub mod chat;
pub mod extract;
pub mod fast;
pub mod report;

use thiserror::Error;

use crate::blobstore::BlobStoreError;
use crate::decode::DecodeError;
use crate::embedding::EmbeddingClientError;
use crate::ingest::{IngestError, RecordSourceError};
use crate::llm::LlmError;
use crate::tracker::TrackerError;
use crate::vector::{RetrievalError, VectorStoreError};

/// Errors surfaced by the pipelines, by kind.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The caller's input was invalid; never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// The caller's token was rejected.
    #[error("Access denied")]
    AuthDenied,
    /// A referenced object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    /// The composed prompt exceeded the model context budget.
    #[error("The query context exceeds the model limit; shorten the query or start a new session")]
    ContextLimit,
    /// The overall request deadline expired.
    #[error("Request deadline exceeded")]
    Timeout,
    /// An upstream dependency stayed unavailable after retries.
    #[error("Upstream service unavailable: {0}")]
    Unavailable(String),
    /// An unexpected internal failure.
    #[error("Internal failure: {0}")]
    Internal(String),
}

impl From<BlobStoreError> for PipelineError {
    fn from(error: BlobStoreError) -> Self {
        match error {
            BlobStoreError::NotFound { bucket, key } => {
                PipelineError::NotFound(format!("{bucket}/{key}"))
            }
            BlobStoreError::AccessDenied { .. } => PipelineError::Internal(error.to_string()),
            BlobStoreError::Transient(reason) => PipelineError::Unavailable(reason),
        }
    }
}

impl From<DecodeError> for PipelineError {
    fn from(error: DecodeError) -> Self {
        PipelineError::InvalidInput(error.to_string())
    }
}

impl From<LlmError> for PipelineError {
    fn from(error: LlmError) -> Self {
        match error {
            LlmError::ContextLimitExceeded => PipelineError::ContextLimit,
            LlmError::ServiceUnavailable(reason) | LlmError::Transient(reason) => {
                PipelineError::Unavailable(reason)
            }
            // Prompts are composed server-side, so a rejected request or bad
            // credential is an internal defect, not caller error.
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

impl From<VectorStoreError> for PipelineError {
    fn from(error: VectorStoreError) -> Self {
        PipelineError::Unavailable(error.to_string())
    }
}

impl From<EmbeddingClientError> for PipelineError {
    fn from(error: EmbeddingClientError) -> Self {
        PipelineError::Unavailable(error.to_string())
    }
}

impl From<RetrievalError> for PipelineError {
    fn from(error: RetrievalError) -> Self {
        match error {
            RetrievalError::Embedding(inner) => inner.into(),
            RetrievalError::Store(inner) => inner.into(),
        }
    }
}

impl From<RecordSourceError> for PipelineError {
    fn from(error: RecordSourceError) -> Self {
        PipelineError::Unavailable(error.to_string())
    }
}

impl From<IngestError> for PipelineError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Source(inner) => inner.into(),
            IngestError::Embedding(inner) => inner.into(),
            IngestError::Store(inner) => inner.into(),
            IngestError::Blob(inner) => inner.into(),
            IngestError::Decode(inner) => PipelineError::Internal(inner.to_string()),
        }
    }
}

impl From<TrackerError> for PipelineError {
    fn from(error: TrackerError) -> Self {
        match error {
            TrackerError::NotFound(id) => PipelineError::NotFound(id),
            TrackerError::InvalidInput(reason) => PipelineError::InvalidInput(reason),
            TrackerError::Database(inner) => PipelineError::Internal(inner.to_string()),
        }
    }
}

/// Phases of one extraction request, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestPhase {
    /// Request accepted, nothing validated yet.
    Received,
    /// Token validation passed.
    Authenticated,
    /// Source bytes decoded into a normalized document.
    Decoded,
    /// Ephemeral vectors written for the document.
    Indexed,
    /// Retrieval context assembled.
    Retrieved,
    /// Generation completed.
    Generated,
    /// Output validated against the indicator schemas.
    Validated,
    /// Identifiers resolved by the mapping service.
    Enriched,
    /// Response handed back to the caller.
    Returned,
}

/// Logs phase transitions for one request and records the failure phase.
pub struct PhaseTracker {
    label: String,
    current: RequestPhase,
}

impl PhaseTracker {
    /// Start tracking a request in the `Received` phase.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        tracing::debug!(request = %label, phase = ?RequestPhase::Received, "Request received");
        Self {
            label,
            current: RequestPhase::Received,
        }
    }

    /// Advance to a later phase. Transitions never move backwards.
    pub fn advance(&mut self, phase: RequestPhase) {
        debug_assert!(phase > self.current, "phase transitions must move forward");
        tracing::debug!(request = %self.label, from = ?self.current, to = ?phase, "Phase transition");
        self.current = phase;
    }

    /// Current phase of the request.
    pub fn current(&self) -> RequestPhase {
        self.current
    }

    /// Record a terminal failure in the current phase.
    pub fn fail(&self, error: &PipelineError) {
        tracing::error!(
            request = %self.label,
            phase = ?self.current,
            error = %error,
            "Request failed"
        );
    }
}
