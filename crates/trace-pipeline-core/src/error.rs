//! Error types shared by the pipeline stages.
//!
//! Each collaborator boundary has its own error enum so callers can tell a
//! local validation failure from a store failure from an embedding failure.
//! Per-item errors are collected into outcomes; only [`PipelineError`]
//! aborts a stage component.

/// A record failed a local check and was never sent to the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("paper_id is empty")]
    EmptyKey,
    #[error("vector_type is empty")]
    EmptyVectorKind,
    #[error("trace_id is empty")]
    EmptyTraceId,
    #[error("both title and abstract are empty")]
    EmptyText,
    #[error("embedding vector is empty")]
    EmptyEmbedding,
    #[error("dimension mismatch: metadata says {declared}, embedding has {actual}")]
    DimensionMismatch { declared: usize, actual: usize },
    #[error("embedding contains NaN at index {0}")]
    NotANumber(usize),
    #[error("model_version is empty")]
    EmptyModelVersion,
}

/// Failure reported by a keyed table store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Connection, timeout, or other network-level failure.
    #[error("store transport error: {0}")]
    Transport(String),
    /// The store answered with a non-success response.
    #[error("store service error (HTTP {status}) {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    /// An item could not be converted to or from the store's wire format.
    #[error("store serialization error: {0}")]
    Serialization(String),
    #[error("store call cancelled")]
    Cancelled,
}

/// Failure of a single embedding request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request failed: {0}")]
    Transport(String),
    #[error("embedding API error (HTTP {status}) {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("text cannot be empty")]
    EmptyText,
    #[error("embedding call cancelled")]
    Cancelled,
}

/// Errors that stop a stage component before it can produce an outcome.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to query records for trace_id {trace_id} on page {page}: {source}")]
    Query {
        trace_id: String,
        page: usize,
        #[source]
        source: StoreError,
    },
    #[error("no embeddings were generated successfully for trace_id {trace_id} ({attempted} attempted)")]
    NoEmbeddings { trace_id: String, attempted: usize },
    #[error("operation cancelled for trace_id {trace_id}")]
    Cancelled { trace_id: String },
}
