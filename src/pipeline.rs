//! Stage wiring.
//!
//! Builds the store adapter selected by `[store] backend`, the embedding
//! service selected by `[embedding] provider`, and the two stages on top of
//! them. One store instance serves both the batch-write and index-query
//! roles.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use trace_pipeline_core::embedding::EmbeddingService;
use trace_pipeline_core::fanout::EmbeddingFanout;
use trace_pipeline_core::ingest::IngestionStage;
use trace_pipeline_core::models::{SourceRecord, VectorRecord};
use trace_pipeline_core::outcome::StageOutcome;
use trace_pipeline_core::payload::IngestPayload;
use trace_pipeline_core::retriever::TraceRetriever;
use trace_pipeline_core::store::memory::InMemoryTableStore;
use trace_pipeline_core::store::{KeyedTableStore, SecondaryIndexQuery};
use trace_pipeline_core::vectorize::VectorizationStage;
use trace_pipeline_core::writer::ChunkedBatchWriter;

use crate::config::Config;
use crate::dynamodb::DynamoDbTableStore;
use crate::embedding::create_service;
use crate::sqlite_store::SqliteTableStore;
use crate::{db, migrate};

/// A store adapter seen through both of its capabilities.
#[derive(Clone)]
pub struct Stores {
    pub tables: Arc<dyn KeyedTableStore>,
    pub index: Arc<dyn SecondaryIndexQuery>,
}

impl Stores {
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: KeyedTableStore + SecondaryIndexQuery + 'static,
    {
        Self {
            tables: store.clone(),
            index: store,
        }
    }
}

/// Open the store adapter named by `config.store.backend`.
pub async fn open_stores(config: &Config) -> Result<Stores> {
    match config.store.backend.as_str() {
        "memory" => Ok(Stores::from_shared(Arc::new(InMemoryTableStore::new()))),
        "sqlite" => {
            let sqlite = config
                .store
                .sqlite
                .as_ref()
                .context("store.sqlite.path must be set for the sqlite backend")?;
            let pool = db::connect(&sqlite.path).await?;
            migrate::run_migrations(&pool).await?;
            Ok(Stores::from_shared(Arc::new(SqliteTableStore::new(pool))))
        }
        "dynamodb" => {
            let dynamodb = config.store.dynamodb.clone().unwrap_or_default();
            let store = DynamoDbTableStore::from_config(&dynamodb)?;
            Ok(Stores::from_shared(Arc::new(store)))
        }
        other => bail!("Unknown store backend: {}", other),
    }
}

pub struct Pipeline {
    ingestion: IngestionStage,
    vectorization: VectorizationStage,
}

impl Pipeline {
    /// Wire both stages from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let stores = open_stores(config).await?;
        let embedder = create_service(&config.embedding)?;
        info!(
            backend = %config.store.backend,
            embedder = embedder.model_name(),
            "pipeline ready"
        );
        Ok(Self::with_services(config, stores, embedder))
    }

    /// Wire both stages over caller-supplied collaborators.
    pub fn with_services(
        config: &Config,
        stores: Stores,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Self {
        let writer_config = config.writer.to_writer_config();

        let papers_writer = ChunkedBatchWriter::new(
            stores.tables.clone(),
            SourceRecord::table_spec(&config.tables.papers),
            writer_config.clone(),
        );
        let vectors_writer = ChunkedBatchWriter::new(
            stores.tables,
            VectorRecord::table_spec(&config.tables.vectors),
            writer_config,
        );

        let retriever = TraceRetriever::new(
            stores.index,
            &config.tables.papers,
            config.tables.trace_index(),
            config.retriever.to_retriever_config(),
        );
        let fanout = EmbeddingFanout::new(
            embedder,
            vectors_writer,
            config.embedding.to_fanout_config(),
        );

        Self {
            ingestion: IngestionStage::new(papers_writer),
            vectorization: VectorizationStage::new(retriever, fanout),
        }
    }

    pub async fn ingest(
        &self,
        payloads: Vec<IngestPayload>,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        self.ingestion.run(payloads, cancel).await
    }

    pub async fn vectorize(&self, trace_id: &str, cancel: &CancellationToken) -> StageOutcome {
        self.vectorization.run(trace_id, cancel).await
    }

    /// Ingest, then vectorize the minted trace id if anything was stored.
    ///
    /// The second outcome is `None` when ingestion stored nothing.
    pub async fn run(
        &self,
        payloads: Vec<IngestPayload>,
        cancel: &CancellationToken,
    ) -> (StageOutcome, Option<StageOutcome>) {
        let ingested = self.ingest(payloads, cancel).await;
        let trace_id = match ingested.output() {
            Some(output) if output.succeeded > 0 && !cancel.is_cancelled() => {
                output.trace_id.clone()
            }
            _ => return (ingested, None),
        };
        let vectorized = self.vectorize(&trace_id, cancel).await;
        (ingested, Some(vectorized))
    }
}
