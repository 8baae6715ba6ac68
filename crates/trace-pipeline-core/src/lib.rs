//! # Trace Pipeline Core
//!
//! Runtime-agnostic logic for the trace-anchored batch stages: data models,
//! deduplication, chunked batch writes, paginated trace retrieval, embedding
//! fan-out, and outcome classification.
//!
//! This crate performs no HTTP, SQL, or filesystem I/O. External systems are
//! reached only through the collaborator traits in [`store`] and
//! [`embedding`], which the application crate implements for DynamoDB,
//! SQLite, and HTTP embedding services.
//!
//! ## Stages
//!
//! ```text
//! ingestion:      payload ─▶ dedup ─▶ ChunkedBatchWriter ─▶ classify
//! vectorization:  TraceRetriever ─▶ EmbeddingFanout ─▶ ChunkedBatchWriter ─▶ classify
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Source, vector, and combined-text records |
//! | [`dedup`] | First-seen-wins deduplication by primary key |
//! | [`writer`] | Chunked batch writes with partial-failure accounting |
//! | [`retriever`] | Paginated secondary-index retrieval by trace id |
//! | [`fanout`] | Per-record embedding calls and vector persistence |
//! | [`outcome`] | completed / partial / failed classification |
//! | [`ingest`] | Ingestion stage driver |
//! | [`vectorize`] | Vectorization stage driver |

pub mod dedup;
pub mod embedding;
pub mod error;
pub mod fanout;
pub mod ingest;
pub mod models;
pub mod outcome;
pub mod payload;
pub mod retriever;
pub mod store;
pub mod vectorize;
pub mod writer;
