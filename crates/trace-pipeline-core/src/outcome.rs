//! Stage outcome classification.
//!
//! Every stage invocation ends in exactly one of three states, computed
//! from its counts alone:
//!
//! | Status | Condition |
//! |--------|-----------|
//! | `completed` | no failure on any axis |
//! | `partial` | at least one record stored and at least one failure |
//! | `failed` | nothing stored while there was work or a failure |
//!
//! [`StageOutcome`] carries the structured [`StageOutput`] and, for
//! `partial` and `failed`, a [`StageError`] next to it. Callers that only
//! look at the error still get the trace id and a retryable message;
//! callers that want telemetry read the output.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::models::rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Partial,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Partial => "partial",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts a stage feeds to [`classify`]. The failure axes stay separate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub succeeded: usize,
    pub failed_embeddings: usize,
    pub failed_storage: usize,
    /// Payloads or records rejected before reaching the store.
    pub failed_inputs: usize,
}

impl Tally {
    pub fn failures(&self) -> usize {
        self.failed_embeddings + self.failed_storage + self.failed_inputs
    }
}

pub fn classify(tally: &Tally) -> StageStatus {
    let failures = tally.failures();
    if tally.succeeded == 0 && (tally.total > 0 || failures > 0) {
        StageStatus::Failed
    } else if failures == 0 {
        StageStatus::Completed
    } else {
        StageStatus::Partial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Ingestion,
    Vectorization,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Ingestion => "ingestion",
            StageKind::Vectorization => "vectorization",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a stage failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Validation,
    PayloadParsing,
    DataRetrieval,
    EmbeddingGeneration,
    RecordStorage,
    VectorStorage,
    OverallProcessing,
    PartialProcessing,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Validation => "validation",
            FailureStage::PayloadParsing => "payload_parsing",
            FailureStage::DataRetrieval => "data_retrieval",
            FailureStage::EmbeddingGeneration => "embedding_generation",
            FailureStage::RecordStorage => "record_storage",
            FailureStage::VectorStorage => "vector_storage",
            FailureStage::OverallProcessing => "overall_processing",
            FailureStage::PartialProcessing => "partial_processing",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator-facing error returned next to a partial or failed output.
///
/// `message` names the trace id whenever one exists.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{stage}: {message}")]
pub struct StageError {
    pub stage: FailureStage,
    pub trace_id: String,
    pub message: String,
}

impl StageError {
    pub fn new(stage: FailureStage, trace_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            trace_id: trace_id.into(),
            message: message.into(),
        }
    }
}

/// Structured stage result, serialized for the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    pub trace_id: String,
    pub status: StageStatus,
    pub total: usize,
    pub succeeded: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_embeddings: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_storage: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_inputs: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings_generated: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_count: Option<usize>,
    pub processing_time_ms: u64,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl StageOutput {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            status: StageStatus::Completed,
            total: 0,
            succeeded: 0,
            failed_embeddings: None,
            failed_storage: None,
            failed_inputs: None,
            duplicate_count: None,
            invalid_count: None,
            rejected_count: None,
            embeddings_generated: None,
            batch_count: None,
            processing_time_ms: 0,
            timestamp: rfc3339(Utc::now()),
            error_message: None,
        }
    }

    /// Fraction of `total` that was stored, as a percentage.
    pub fn success_rate(&self) -> f64 {
        percent(self.succeeded, self.total)
    }
}

pub fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed(StageOutput),
    Partial {
        output: StageOutput,
        error: StageError,
    },
    /// `output` is `None` only when the input was rejected before any work.
    Failed {
        output: Option<StageOutput>,
        error: StageError,
    },
}

impl StageOutcome {
    /// Failure before any work was attempted (bad top-level input).
    pub fn invalid_input(trace_id: &str, message: impl Into<String>) -> Self {
        StageOutcome::Failed {
            output: None,
            error: StageError::new(FailureStage::Validation, trace_id, message),
        }
    }

    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Completed(_) => StageStatus::Completed,
            StageOutcome::Partial { .. } => StageStatus::Partial,
            StageOutcome::Failed { .. } => StageStatus::Failed,
        }
    }

    pub fn output(&self) -> Option<&StageOutput> {
        match self {
            StageOutcome::Completed(output) | StageOutcome::Partial { output, .. } => Some(output),
            StageOutcome::Failed { output, .. } => output.as_ref(),
        }
    }

    pub fn error(&self) -> Option<&StageError> {
        match self {
            StageOutcome::Completed(_) => None,
            StageOutcome::Partial { error, .. } | StageOutcome::Failed { error, .. } => {
                Some(error)
            }
        }
    }

    pub fn into_parts(self) -> (Option<StageOutput>, Option<StageError>) {
        match self {
            StageOutcome::Completed(output) => (Some(output), None),
            StageOutcome::Partial { output, error } => (Some(output), Some(error)),
            StageOutcome::Failed { output, error } => (output, Some(error)),
        }
    }
}

/// Classify `tally` and build the outcome for a stage that ran to the end.
///
/// Fills `status`, `total`, `succeeded` and the failure counts of `output`;
/// the caller sets the stage-specific counters.
pub fn conclude(kind: StageKind, mut output: StageOutput, tally: &Tally) -> StageOutcome {
    let status = classify(tally);
    output.status = status;
    output.total = tally.total;
    output.succeeded = tally.succeeded;
    match kind {
        StageKind::Ingestion => {
            output.failed_storage = Some(tally.failed_storage);
            output.failed_inputs = Some(tally.failed_inputs);
        }
        StageKind::Vectorization => {
            output.failed_embeddings = Some(tally.failed_embeddings);
            output.failed_storage = Some(tally.failed_storage);
        }
    }

    let trace_id = output.trace_id.clone();
    match status {
        StageStatus::Completed => StageOutcome::Completed(output),
        StageStatus::Partial => {
            let message = format!(
                "partial {kind} failure for trace_id {trace_id}: {}/{} records stored successfully{}",
                tally.succeeded,
                tally.total,
                failure_detail(kind, tally),
            );
            output.error_message = Some(message.clone());
            StageOutcome::Partial {
                output,
                error: StageError::new(FailureStage::PartialProcessing, trace_id, message),
            }
        }
        StageStatus::Failed => {
            let message = format!(
                "{kind} failed for trace_id {trace_id}: no records stored out of {}{}",
                tally.total,
                failure_detail(kind, tally),
            );
            output.error_message = Some(message.clone());
            StageOutcome::Failed {
                output: Some(output),
                error: StageError::new(failure_stage(kind, tally), trace_id, message),
            }
        }
    }
}

fn failure_detail(kind: StageKind, tally: &Tally) -> String {
    match kind {
        StageKind::Ingestion => format!(
            " (storage failures: {}, rejected inputs: {})",
            tally.failed_storage, tally.failed_inputs
        ),
        StageKind::Vectorization => format!(
            " (embedding failures: {}, storage failures: {})",
            tally.failed_embeddings, tally.failed_storage
        ),
    }
}

fn failure_stage(kind: StageKind, tally: &Tally) -> FailureStage {
    match kind {
        StageKind::Ingestion if tally.failed_storage > 0 => FailureStage::RecordStorage,
        StageKind::Ingestion if tally.failed_inputs > 0 => FailureStage::PayloadParsing,
        StageKind::Vectorization if tally.failed_storage > 0 => FailureStage::VectorStorage,
        StageKind::Vectorization if tally.failed_embeddings > 0 => {
            FailureStage::EmbeddingGeneration
        }
        _ => FailureStage::OverallProcessing,
    }
}
