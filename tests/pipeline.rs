//! End-to-end stage tests over the in-memory store and the hash embedder.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use trace_pipeline::config::Config;
use trace_pipeline::embedding::HashEmbedder;
use trace_pipeline::pipeline::{Pipeline, Stores};
use trace_pipeline_core::outcome::{FailureStage, StageStatus};
use trace_pipeline_core::payload::IngestPayload;
use trace_pipeline_core::store::memory::InMemoryTableStore;
use trace_pipeline_core::store::ItemKey;

const BATCH: &str = r#"[
  {"paper_id": "p1", "title": "Sparse attention", "abstract": "We study sparse attention."},
  {"paper_id": "p2", "title": "Graph transformers"},
  {"paper_id": "p3", "abstract": "Only an abstract here."},
  {"paper_id": "p4", "source": "arxiv"},
  {"paper_id": "p1", "title": "Duplicate of p1"}
]"#;

fn config() -> Config {
    let mut config = Config::default();
    config.writer.retry_base_delay_ms = 1;
    config.retriever.page_size = Some(2);
    config
}

fn pipeline(store: Arc<InMemoryTableStore>) -> Pipeline {
    Pipeline::with_services(
        &config(),
        Stores::from_shared(store),
        Arc::new(HashEmbedder::new(16)),
    )
}

#[tokio::test]
async fn test_run_ingests_and_vectorizes_one_trace() {
    let store = Arc::new(InMemoryTableStore::new());
    let pipeline = pipeline(store.clone());

    let (ingested, vectorized) = pipeline
        .run(
            vec![IngestPayload::new("batch.json", BATCH)],
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(ingested.status(), StageStatus::Completed);
    let ingest_output = ingested.output().unwrap();
    assert_eq!(ingest_output.total, 4);
    assert_eq!(ingest_output.duplicate_count, Some(1));

    let vectorized = vectorized.unwrap();
    assert_eq!(vectorized.status(), StageStatus::Completed);
    let output = vectorized.output().unwrap();
    assert_eq!(output.trace_id, ingest_output.trace_id);
    // p4 has neither title nor abstract
    assert_eq!(output.total, 3);
    assert_eq!(output.succeeded, 3);
    assert_eq!(output.invalid_count, Some(1));

    let vector = store
        .get("vectors-table", &ItemKey::with_sort("p1", "title_abstract"))
        .unwrap();
    assert_eq!(vector["embedding"].as_array().unwrap().len(), 16);
    assert_eq!(vector["embedding_metadata"]["dimension"], 16);
    assert_eq!(vector["source_text"]["content"], "Sparse attention. We study sparse attention.");
    assert_eq!(
        vector["processing_info"]["trace_id"],
        ingest_output.trace_id.as_str()
    );
    assert!(store
        .get("vectors-table", &ItemKey::with_sort("p4", "title_abstract"))
        .is_none());
}

#[tokio::test]
async fn test_vector_storage_failure_is_partial() {
    let store = Arc::new(InMemoryTableStore::new());
    store.throttle_key(ItemKey::with_sort("p2", "title_abstract"));
    let pipeline = pipeline(store.clone());

    let (_, vectorized) = pipeline
        .run(
            vec![IngestPayload::new("batch.json", BATCH)],
            &CancellationToken::new(),
        )
        .await;

    let vectorized = vectorized.unwrap();
    assert_eq!(vectorized.status(), StageStatus::Partial);
    let output = vectorized.output().unwrap();
    assert_eq!(output.succeeded, 2);
    assert_eq!(output.failed_storage, Some(1));
    assert_eq!(output.failed_embeddings, Some(0));

    let error = vectorized.error().unwrap();
    assert_eq!(error.stage, FailureStage::PartialProcessing);
    assert!(error.message.contains(&output.trace_id));
}

#[tokio::test]
async fn test_run_skips_vectorization_when_nothing_stored() {
    let store = Arc::new(InMemoryTableStore::new());
    let pipeline = pipeline(store.clone());

    let (ingested, vectorized) = pipeline
        .run(
            vec![IngestPayload::new("bad.json", "{not json")],
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(ingested.status(), StageStatus::Failed);
    assert!(vectorized.is_none());
    assert_eq!(store.query_call_count(), 0);
}

#[tokio::test]
async fn test_cancelled_run_returns_accounting() {
    let store = Arc::new(InMemoryTableStore::new());
    let pipeline = pipeline(store.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let (ingested, vectorized) = pipeline
        .run(vec![IngestPayload::new("batch.json", BATCH)], &cancel)
        .await;
    assert_eq!(ingested.status(), StageStatus::Failed);
    let output = ingested.output().unwrap();
    assert_eq!(output.total, 4);
    assert_eq!(output.failed_storage, Some(4));
    assert!(vectorized.is_none());
}
