//! Per-record embedding fan-out and vector persistence.
//!
//! [`EmbeddingFanout`] embeds each combined text through an
//! [`EmbeddingService`], builds a [`VectorRecord`] for every success, and
//! hands the records to a [`ChunkedBatchWriter`]. A failed call is recorded
//! against its paper and never stops the remaining calls. Embedding failures
//! and storage failures are reported separately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::embedding::{
    truncate_text, validate_response, EmbeddingService, MAX_EMBEDDING_TEXT_CHARS,
};
use crate::error::{EmbeddingError, PipelineError};
use crate::models::{CombinedText, VectorRecord, DEFAULT_VECTOR_KIND};
use crate::writer::{BatchWriteOutcome, ChunkedBatchWriter};

const PROGRESS_INTERVAL: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Sort key of the produced vector records.
    pub vector_kind: String,
    /// Input is cut to this many characters before each call.
    pub max_text_length: usize,
    /// Embedding calls in flight at once. `1` is strictly sequential.
    pub concurrency: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            vector_kind: DEFAULT_VECTOR_KIND.to_string(),
            max_text_length: MAX_EMBEDDING_TEXT_CHARS,
            concurrency: 1,
        }
    }
}

/// One text that could not be embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingFailure {
    pub paper_id: String,
    pub error: EmbeddingError,
}

#[derive(Debug, Clone)]
pub struct VectorizeReport {
    pub trace_id: String,
    pub total: usize,
    pub embedded: usize,
    pub failures: Vec<EmbeddingFailure>,
    pub write: BatchWriteOutcome<VectorRecord>,
}

impl VectorizeReport {
    pub fn stored(&self) -> usize {
        self.write.success_count
    }

    pub fn failed_storage(&self) -> usize {
        self.write.failed_count()
    }
}

pub struct EmbeddingFanout {
    service: Arc<dyn EmbeddingService>,
    writer: ChunkedBatchWriter,
    config: FanoutConfig,
}

impl EmbeddingFanout {
    pub fn new(
        service: Arc<dyn EmbeddingService>,
        writer: ChunkedBatchWriter,
        config: FanoutConfig,
    ) -> Self {
        Self {
            service,
            writer,
            config,
        }
    }

    /// Embed `texts` and persist the resulting vectors.
    ///
    /// Fails on an empty trace id (before any call), and with
    /// [`PipelineError::NoEmbeddings`] when not a single text could be
    /// embedded. Otherwise returns both failure axes in the report.
    pub async fn vectorize(
        &self,
        trace_id: &str,
        texts: &[CombinedText],
        cancel: &CancellationToken,
    ) -> Result<VectorizeReport, PipelineError> {
        if trace_id.is_empty() {
            return Err(PipelineError::InvalidArgument(
                "trace_id cannot be empty".into(),
            ));
        }

        let (records, failures) = self.embed_all(trace_id, texts, cancel).await;
        if records.is_empty() && !texts.is_empty() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    trace_id: trace_id.to_string(),
                });
            }
            return Err(PipelineError::NoEmbeddings {
                trace_id: trace_id.to_string(),
                attempted: texts.len(),
            });
        }

        let embedded = records.len();
        info!(
            trace_id,
            embedded,
            failed = failures.len(),
            "storing vector records"
        );
        let write = self.writer.batch_write(records, cancel).await;
        if !write.is_complete() {
            warn!(
                trace_id,
                stored = write.success_count,
                failed = write.failed_count(),
                "some vector records were not stored"
            );
        }

        Ok(VectorizeReport {
            trace_id: trace_id.to_string(),
            total: texts.len(),
            embedded,
            failures,
            write,
        })
    }

    /// Embed every text, in input order, with bounded concurrency.
    pub async fn embed_all(
        &self,
        trace_id: &str,
        texts: &[CombinedText],
        cancel: &CancellationToken,
    ) -> (Vec<VectorRecord>, Vec<EmbeddingFailure>) {
        let total = texts.len();
        let done = AtomicUsize::new(0);

        let results: Vec<Result<VectorRecord, EmbeddingFailure>> =
            stream::iter(texts.iter().map(|text| {
                let done = &done;
                async move {
                    let result = self.embed_one(trace_id, text, cancel).await;
                    if let Err(error) = &result {
                        warn!(
                            trace_id,
                            paper_id = %text.paper_id,
                            error = %error,
                            "failed to generate embedding"
                        );
                    }
                    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % PROGRESS_INTERVAL == 0 || n == total {
                        info!(trace_id, processed = n, total, "embedding progress");
                    }
                    result.map_err(|error| EmbeddingFailure {
                        paper_id: text.paper_id.clone(),
                        error,
                    })
                }
            }))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut records = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err(failure) => failures.push(failure),
            }
        }
        (records, failures)
    }

    async fn embed_one(
        &self,
        trace_id: &str,
        text: &CombinedText,
        cancel: &CancellationToken,
    ) -> Result<VectorRecord, EmbeddingError> {
        if cancel.is_cancelled() {
            return Err(EmbeddingError::Cancelled);
        }
        let input = truncate_text(&text.text, self.config.max_text_length.max(1));
        if input.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        let started = Instant::now();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EmbeddingError::Cancelled),
            r = self.service.embed(input) => r?,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        validate_response(&response)?;

        debug!(
            trace_id,
            paper_id = %text.paper_id,
            dimension = response.embedding.len(),
            duration_ms = elapsed_ms,
            "generated embedding"
        );

        let embedded = CombinedText {
            paper_id: text.paper_id.clone(),
            text: input.to_string(),
            source_fields: text.source_fields.clone(),
        };
        Ok(VectorRecord::from_embedding(
            &embedded,
            trace_id,
            &self.config.vector_kind,
            response.embedding,
            &response.model_version,
            elapsed_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingResponse;
    use crate::models::PAPER_KEY;
    use crate::store::memory::InMemoryTableStore;
    use crate::store::{ItemKey, KeyedTableStore};
    use crate::writer::WriterConfig;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns `[len, 1.0]` for every text except those listed as failing.
    struct StubEmbedder {
        failing: HashSet<String>,
        seen: Mutex<Vec<String>>,
    }

    impl StubEmbedder {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbeddingService for StubEmbedder {
        fn model_name(&self) -> &str {
            "stub"
        }

        async fn embed(&self, text: &str) -> Result<EmbeddingResponse, EmbeddingError> {
            self.seen.lock().unwrap().push(text.to_string());
            if self.failing.contains(text) {
                return Err(EmbeddingError::Api {
                    status: 503,
                    code: "UNAVAILABLE".into(),
                    message: "model overloaded".into(),
                });
            }
            Ok(EmbeddingResponse {
                embedding: vec![text.len() as f32, 1.0],
                model_version: "stub-v1".into(),
                dimension: 2,
                processing_time_ms: Some(1),
            })
        }
    }

    fn fanout(
        service: Arc<dyn EmbeddingService>,
        store: Arc<dyn KeyedTableStore>,
        config: FanoutConfig,
    ) -> EmbeddingFanout {
        let writer = ChunkedBatchWriter::new(
            store,
            VectorRecord::table_spec("vectors"),
            WriterConfig {
                retry_base_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        EmbeddingFanout::new(service, writer, config)
    }

    fn texts(items: &[(&str, &str)]) -> Vec<CombinedText> {
        items
            .iter()
            .map(|(id, text)| CombinedText::new(*id, *text))
            .collect()
    }

    #[tokio::test]
    async fn test_vectorize_stores_every_embedding() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&[]));
        let report = fanout(service, store.clone(), FanoutConfig::default())
            .vectorize(
                "trace-1",
                &texts(&[("a", "alpha"), ("b", "beta"), ("c", "gamma")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.stored(), 3);
        assert!(report.failures.is_empty());

        let item = store
            .get("vectors", &ItemKey::with_sort("b", "title_abstract"))
            .unwrap();
        assert_eq!(item[PAPER_KEY], "b");
        assert_eq!(item["embedding_metadata"]["model_version"], "stub-v1");
        assert_eq!(item["processing_info"]["trace_id"], "trace-1");
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_rest() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&["beta"]));
        let report = fanout(service.clone(), store.clone(), FanoutConfig::default())
            .vectorize(
                "trace-1",
                &texts(&[("a", "alpha"), ("b", "beta"), ("c", "gamma")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(service.seen.lock().unwrap().len(), 3);
        assert_eq!(report.embedded, 2);
        assert_eq!(report.stored(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].paper_id, "b");
        assert_eq!(report.failed_storage(), 0);
    }

    #[tokio::test]
    async fn test_storage_failures_are_counted_separately() {
        let store = Arc::new(InMemoryTableStore::new());
        store.throttle_key(ItemKey::with_sort("c", "title_abstract"));
        let service = Arc::new(StubEmbedder::new(&["alpha"]));
        let report = fanout(service, store.clone(), FanoutConfig::default())
            .vectorize(
                "trace-1",
                &texts(&[("a", "alpha"), ("b", "beta"), ("c", "gamma")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.embedded, 2);
        assert_eq!(report.stored(), 1);
        assert_eq!(report.failed_storage(), 1);
    }

    #[tokio::test]
    async fn test_zero_embeddings_is_an_error() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&["alpha", "beta"]));
        let err = fanout(service, store.clone(), FanoutConfig::default())
            .vectorize(
                "trace-1",
                &texts(&[("a", "alpha"), ("b", "beta")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NoEmbeddings { attempted: 2, .. }
        ));
        assert!(err.to_string().contains("no embeddings were generated successfully"));
        assert!(store.write_call_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_empty_trace_id_makes_no_calls() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&[]));
        let err = fanout(service.clone(), store.clone(), FanoutConfig::default())
            .vectorize("", &texts(&[("a", "alpha")]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
        assert!(service.seen.lock().unwrap().is_empty());
        assert!(store.write_call_sizes().is_empty());
    }

    #[tokio::test]
    async fn test_text_is_truncated_before_the_call() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&[]));
        let config = FanoutConfig {
            max_text_length: 5,
            ..Default::default()
        };
        let report = fanout(service.clone(), store, config)
            .vectorize(
                "trace-1",
                &texts(&[("a", "abcdefghij")]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(service.seen.lock().unwrap()[0], "abcde");
        assert_eq!(report.embedded, 1);
    }

    #[tokio::test]
    async fn test_concurrent_fanout_keeps_input_order() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&[]));
        let input: Vec<CombinedText> = (0..25)
            .map(|i| CombinedText::new(format!("p{i:02}"), "x".repeat(i + 1)))
            .collect();
        let config = FanoutConfig {
            concurrency: 8,
            ..Default::default()
        };
        let (records, failures) = fanout(service, store, config)
            .embed_all("trace-1", &input, &CancellationToken::new())
            .await;
        assert!(failures.is_empty());
        let ids: Vec<_> = records.iter().map(|r| r.paper_id.clone()).collect();
        let expected: Vec<_> = input.iter().map(|t| t.paper_id.clone()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_cancelled_fanout_reports_cancellation() {
        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&[]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fanout(service.clone(), store, FanoutConfig::default())
            .vectorize("trace-1", &texts(&[("a", "alpha")]), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { .. }));
        assert!(service.seen.lock().unwrap().is_empty());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_progress_logged_every_ten_and_at_last() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = Arc::new(InMemoryTableStore::new());
        let service = Arc::new(StubEmbedder::new(&[]));
        let input: Vec<CombinedText> = (0..12)
            .map(|i| CombinedText::new(format!("p{i:02}"), "text"))
            .collect();
        fanout(service, store, FanoutConfig::default())
            .embed_all("trace-1", &input, &CancellationToken::new())
            .await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let progress: Vec<_> = output
            .lines()
            .filter(|l| l.contains("embedding progress"))
            .collect();
        assert_eq!(progress.len(), 2);
        assert!(progress[0].contains("processed=10"));
        assert!(progress[1].contains("processed=12"));
    }
}
