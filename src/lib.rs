//! # Trace Pipeline
//!
//! Production adapters and wiring for the trace-anchored batch stages in
//! [`trace_pipeline_core`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌──────────────────┐
//! │ payload files│──▶│ IngestionStage     │──▶│ papers table     │
//! └──────────────┘   └────────────────────┘   └────────┬─────────┘
//!                                                      │ trace-id index
//!                    ┌────────────────────┐            ▼
//!                    │ VectorizationStage │◀── TraceRetriever
//!                    │  EmbeddingFanout   │──▶ vectors table
//!                    └────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tpipe init                                 # create the SQLite schema
//! tpipe ingest batch-001.jsonl               # prints the minted trace id
//! tpipe vectorize --trace-id <trace-id>
//! tpipe run batch-001.jsonl                  # both stages
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and env overrides |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | SQLite schema |
//! | [`sqlite_store`] | SQLite table store |
//! | [`dynamodb`] | DynamoDB table store (SigV4 over HTTP) |
//! | [`embedding`] | HTTP and hash embedding services |
//! | [`pipeline`] | Stage wiring from configuration |

pub mod config;
pub mod db;
pub mod dynamodb;
pub mod embedding;
pub mod logging;
pub mod migrate;
pub mod pipeline;
pub mod sqlite_store;
