//! Ingestion stage: payloads in, deduplicated source records stored.
//!
//! One run mints a trace id, parses every payload, stamps the records,
//! drops duplicates (first seen wins), writes the survivors through the
//! [`ChunkedBatchWriter`], and classifies the result.

use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::dedup::deduplicate;
use crate::models::{rfc3339, SourceRecord};
use crate::outcome::{conclude, StageKind, StageOutcome, StageOutput, Tally};
use crate::payload::{parse_payload, IngestPayload, PayloadError};
use crate::writer::ChunkedBatchWriter;

pub struct IngestionStage {
    writer: ChunkedBatchWriter,
}

impl IngestionStage {
    pub fn new(writer: ChunkedBatchWriter) -> Self {
        Self { writer }
    }

    /// Ingest a set of payloads under a freshly minted trace id.
    pub async fn run(&self, payloads: Vec<IngestPayload>, cancel: &CancellationToken) -> StageOutcome {
        let trace_id = Uuid::new_v4().to_string();
        if payloads.is_empty() {
            return StageOutcome::invalid_input(
                &trace_id,
                format!("no payloads to ingest for trace_id {trace_id}"),
            );
        }

        let started = Instant::now();
        let mut records = Vec::new();
        let mut failed_payloads = 0;
        let mut rejected = 0;
        for payload in &payloads {
            match parse_payload(&payload.data) {
                Ok(parsed) => {
                    info!(
                        trace_id = %trace_id,
                        object_key = %payload.object_key,
                        papers = parsed.records.len(),
                        rejected = parsed.rejected,
                        "parsed payload"
                    );
                    rejected += parsed.rejected;
                    records.extend(parsed.records);
                }
                Err(e) => {
                    warn!(
                        trace_id = %trace_id,
                        object_key = %payload.object_key,
                        error = %e,
                        "failed to parse payload"
                    );
                    failed_payloads += 1;
                    if let PayloadError::NoRecords { rejected: n } = e {
                        rejected += n;
                    }
                }
            }
        }

        let mut output = StageOutput::new(&trace_id);
        output.rejected_count = Some(rejected);
        self.ingest(&trace_id, records, failed_payloads, output, started, cancel)
            .await
    }

    /// Ingest already-parsed records under a caller-supplied trace id.
    pub async fn run_records(
        &self,
        trace_id: &str,
        records: Vec<SourceRecord>,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        if trace_id.is_empty() {
            return StageOutcome::invalid_input(trace_id, "trace_id cannot be empty");
        }
        let output = StageOutput::new(trace_id);
        self.ingest(trace_id, records, 0, output, Instant::now(), cancel)
            .await
    }

    #[instrument(skip_all, fields(trace_id = %trace_id))]
    async fn ingest(
        &self,
        trace_id: &str,
        mut records: Vec<SourceRecord>,
        failed_payloads: usize,
        mut output: StageOutput,
        started: Instant,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let batch_timestamp = rfc3339(Utc::now());
        for record in &mut records {
            record.stamp(trace_id, &batch_timestamp, &batch_timestamp);
        }

        let (unique, stats) = deduplicate(records);
        info!(
            original = stats.original_count,
            unique = stats.unique_count,
            duplicates = stats.duplicate_count,
            invalid = stats.invalid_count,
            "deduplicated papers"
        );

        let write = self.writer.batch_write(unique, cancel).await;

        let tally = Tally {
            total: stats.unique_count,
            succeeded: write.success_count,
            failed_embeddings: 0,
            failed_storage: write.failed_count(),
            failed_inputs: failed_payloads + stats.invalid_count,
        };
        output.duplicate_count = Some(stats.duplicate_count);
        output.invalid_count = Some(stats.invalid_count);
        output.batch_count = Some(write.chunk_count);
        output.processing_time_ms = started.elapsed().as_millis() as u64;

        let outcome = conclude(StageKind::Ingestion, output, &tally);
        match outcome.error() {
            None => info!(
                stored = tally.succeeded,
                batches = write.chunk_count,
                duration_ms = started.elapsed().as_millis() as u64,
                "ingestion completed"
            ),
            Some(error) => warn!(
                status = %outcome.status(),
                stored = tally.succeeded,
                failed = tally.failed_storage,
                error = %error,
                "ingestion did not complete"
            ),
        }
        outcome
    }
}
