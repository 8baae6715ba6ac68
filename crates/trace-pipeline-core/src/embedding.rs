//! Embedding service trait and response checks.
//!
//! Defines the [`EmbeddingService`] trait that every embedding backend
//! implements, plus the pure helpers the fan-out coordinator applies around
//! each call (input truncation, response validation).
//!
//! Concrete services (HTTP client, deterministic hash embedder) live in the
//! `trace-pipeline` app crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;

/// Longest input, in characters, sent to an embedding service.
pub const MAX_EMBEDDING_TEXT_CHARS: usize = 10_000;

/// A successful embedding call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f32>,
    pub model_version: String,
    pub dimension: usize,
    /// Time the service reports spending, if it says.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

/// Synchronous text-to-vector service.
///
/// One call embeds one text. Implementations report transport and
/// non-success responses as [`EmbeddingError`]; the caller validates the
/// response shape with [`validate_response`].
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Model identifier, used in logs.
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, EmbeddingError>;
}

/// Cut `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_text(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Reject responses that cannot become a valid vector record.
pub fn validate_response(response: &EmbeddingResponse) -> Result<(), EmbeddingError> {
    if response.embedding.is_empty() {
        return Err(EmbeddingError::InvalidResponse(
            "embedding vector is empty".into(),
        ));
    }
    if response.dimension != response.embedding.len() {
        return Err(EmbeddingError::InvalidResponse(format!(
            "dimension mismatch: reported {}, actual {}",
            response.dimension,
            response.embedding.len()
        )));
    }
    if response.model_version.is_empty() {
        return Err(EmbeddingError::InvalidResponse(
            "model_version is empty".into(),
        ));
    }
    if let Some(index) = response.embedding.iter().position(|v| v.is_nan()) {
        return Err(EmbeddingError::InvalidResponse(format!(
            "embedding contains NaN at index {index}"
        )));
    }
    Ok(())
}
