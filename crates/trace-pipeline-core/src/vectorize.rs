//! Vectorization stage: a trace id in, vector records stored.
//!
//! Retrieves every record of the trace, embeds each one, writes the vectors,
//! and classifies the outcome with embedding and storage failures counted
//! separately.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::PipelineError;
use crate::fanout::EmbeddingFanout;
use crate::outcome::{
    conclude, percent, FailureStage, StageError, StageKind, StageOutcome, StageOutput, StageStatus,
    Tally,
};
use crate::retriever::TraceRetriever;

pub struct VectorizationStage {
    retriever: TraceRetriever,
    fanout: EmbeddingFanout,
}

impl VectorizationStage {
    pub fn new(retriever: TraceRetriever, fanout: EmbeddingFanout) -> Self {
        Self { retriever, fanout }
    }

    #[instrument(skip_all, fields(trace_id = %trace_id))]
    pub async fn run(&self, trace_id: &str, cancel: &CancellationToken) -> StageOutcome {
        if trace_id.is_empty() {
            return StageOutcome::invalid_input(trace_id, "trace_id cannot be empty");
        }

        let started = Instant::now();
        info!("starting vectorization");

        let retrieval = match self.retriever.retrieve(trace_id, cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "failed to retrieve records");
                let stage = match e {
                    PipelineError::Cancelled { .. } => FailureStage::OverallProcessing,
                    _ => FailureStage::DataRetrieval,
                };
                return failed(trace_id, stage, 0, 0, e, started);
            }
        };

        let texts = retrieval.texts;
        if texts.is_empty() {
            info!("no records to vectorize");
            let mut output = StageOutput::new(trace_id);
            output.embeddings_generated = Some(0);
            output.invalid_count = Some(retrieval.invalid_count);
            output.processing_time_ms = started.elapsed().as_millis() as u64;
            return conclude(StageKind::Vectorization, output, &Tally::default());
        }

        let report = match self.fanout.vectorize(trace_id, &texts, cancel).await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "vectorization aborted");
                let stage = match e {
                    PipelineError::NoEmbeddings { .. } => FailureStage::EmbeddingGeneration,
                    _ => FailureStage::OverallProcessing,
                };
                return failed(trace_id, stage, texts.len(), texts.len(), e, started);
            }
        };

        let tally = Tally {
            total: report.total,
            succeeded: report.stored(),
            failed_embeddings: report.failures.len(),
            failed_storage: report.failed_storage(),
            failed_inputs: 0,
        };
        let mut output = StageOutput::new(trace_id);
        output.embeddings_generated = Some(report.embedded);
        output.invalid_count = Some(retrieval.invalid_count);
        output.batch_count = Some(report.write.chunk_count);
        output.processing_time_ms = started.elapsed().as_millis() as u64;

        let elapsed = started.elapsed().as_secs_f64();
        info!(
            total = report.total,
            embedded = report.embedded,
            stored = report.stored(),
            embedding_success_rate = percent(report.embedded, report.total),
            storage_success_rate = percent(report.stored(), report.embedded),
            overall_success_rate = percent(report.stored(), report.total),
            records_per_second = if elapsed > 0.0 {
                report.total as f64 / elapsed
            } else {
                0.0
            },
            "vectorization finished"
        );

        let outcome = conclude(StageKind::Vectorization, output, &tally);
        if let Some(error) = outcome.error() {
            warn!(status = %outcome.status(), error = %error, "vectorization did not complete");
        }
        outcome
    }
}

fn failed(
    trace_id: &str,
    stage: FailureStage,
    total: usize,
    failed_embeddings: usize,
    cause: PipelineError,
    started: Instant,
) -> StageOutcome {
    let message = match &cause {
        PipelineError::NoEmbeddings { .. } | PipelineError::Query { .. } => cause.to_string(),
        _ => format!("vectorization failed for trace_id {trace_id}: {cause}"),
    };
    let mut output = StageOutput::new(trace_id);
    output.status = StageStatus::Failed;
    output.total = total;
    output.failed_embeddings = Some(failed_embeddings);
    output.failed_storage = Some(0);
    output.embeddings_generated = Some(0);
    output.processing_time_ms = started.elapsed().as_millis() as u64;
    output.error_message = Some(message.clone());
    StageOutcome::Failed {
        output: Some(output),
        error: StageError::new(stage, trace_id, message),
    }
}
