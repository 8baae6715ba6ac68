//! Chunked batch writes with partial-failure accounting.
//!
//! [`ChunkedBatchWriter`] splits a record list into consecutive chunks no
//! larger than the store's batch limit and submits each chunk as one
//! batch-write call. Failures are classified per record:
//!
//! - a record that fails local validation is never sent;
//! - items the store hands back as unprocessed are resubmitted (only those
//!   items) until `max_attempts` is reached, then failed;
//! - a store call that errors fails every pending record of that chunk, and
//!   the writer moves on to the next chunk.
//!
//! Every record ends up either counted as stored or returned in
//! [`BatchWriteOutcome::failed_items`], so the two always sum to the input
//! length.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{StoreError, ValidationError};
use crate::store::{to_item, Item, ItemKey, KeyedTableStore, TableRecord, TableSpec};

/// Writer tuning shared by the source and vector writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Records per batch-write call. Clamped to the store's limit.
    pub chunk_size: usize,
    /// Submissions per chunk, counting the first one. `1` disables local
    /// retry of unprocessed items.
    pub max_attempts: u32,
    /// Backoff before retry `n` is `retry_base_delay * 2^(n-1)`.
    pub retry_base_delay: Duration,
    /// Chunks in flight at once. `1` writes chunks sequentially.
    pub max_concurrent_chunks: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::store::MAX_BATCH_WRITE_ITEMS,
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            max_concurrent_chunks: 1,
        }
    }
}

/// Why a single record (or group of records) was not stored.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    #[error("record {key} failed validation: {source}")]
    Invalid {
        key: ItemKey,
        #[source]
        source: ValidationError,
    },
    #[error("record {key} could not be serialized: {message}")]
    Serialization { key: ItemKey, message: String },
    #[error("chunk {chunk_index} write failed on attempt {attempt}: {source}")]
    Store {
        chunk_index: usize,
        attempt: u32,
        #[source]
        source: StoreError,
    },
    #[error("chunk {chunk_index}: {count} items still unprocessed after {attempts} attempts")]
    Unprocessed {
        chunk_index: usize,
        count: usize,
        attempts: u32,
    },
    #[error("chunk {chunk_index}: write cancelled with {count} items pending")]
    Cancelled { chunk_index: usize, count: usize },
}

/// Aggregate result of one [`ChunkedBatchWriter::batch_write`] call.
#[derive(Debug, Clone)]
pub struct BatchWriteOutcome<T> {
    pub total: usize,
    pub success_count: usize,
    /// Records that were not stored, in input order.
    pub failed_items: Vec<T>,
    pub errors: Vec<WriteError>,
    pub chunk_count: usize,
}

impl<T> BatchWriteOutcome<T> {
    pub fn failed_count(&self) -> usize {
        self.failed_items.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed_items.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, WriteError::Cancelled { .. }))
    }
}

struct ChunkResult<T> {
    succeeded: usize,
    failed: Vec<(usize, T)>,
    errors: Vec<WriteError>,
}

impl<T> ChunkResult<T> {
    fn new() -> Self {
        Self {
            succeeded: 0,
            failed: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn fail_pending(&mut self, pending: Vec<Pending<T>>) {
        self.failed
            .extend(pending.into_iter().map(|p| (p.index, p.record)));
    }
}

struct Pending<T> {
    index: usize,
    key: ItemKey,
    record: T,
    item: Item,
}

/// Writes records of one table in bounded chunks.
///
/// Holds no state between calls; concurrent calls for different traces do
/// not interact.
pub struct ChunkedBatchWriter {
    store: Arc<dyn KeyedTableStore>,
    table: TableSpec,
    config: WriterConfig,
}

impl ChunkedBatchWriter {
    pub fn new(store: Arc<dyn KeyedTableStore>, table: TableSpec, config: WriterConfig) -> Self {
        Self {
            store,
            table,
            config,
        }
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    /// Effective chunk size: the configured size bounded by the store limit.
    pub fn chunk_size(&self) -> usize {
        let limit = self.store.max_batch_size().max(1);
        self.config.chunk_size.clamp(1, limit)
    }

    /// Write `records`, returning per-record accounting.
    ///
    /// On cancellation the records already stored stay counted, and every
    /// record not yet confirmed is returned as failed with
    /// [`WriteError::Cancelled`].
    pub async fn batch_write<T: TableRecord>(
        &self,
        records: Vec<T>,
        cancel: &CancellationToken,
    ) -> BatchWriteOutcome<T> {
        let total = records.len();
        let chunk_size = self.chunk_size();

        let mut chunks: Vec<Vec<(usize, T)>> = Vec::with_capacity(total.div_ceil(chunk_size));
        let mut iter = records.into_iter().enumerate().peekable();
        while iter.peek().is_some() {
            chunks.push(iter.by_ref().take(chunk_size).collect());
        }
        let chunk_count = chunks.len();

        debug!(
            table = %self.table.name,
            total,
            chunk_size,
            chunk_count,
            "writing records in chunks"
        );

        let results: Vec<ChunkResult<T>> = stream::iter(
            chunks
                .into_iter()
                .enumerate()
                .map(|(chunk_index, chunk)| self.write_chunk(chunk_index, chunk, cancel)),
        )
        .buffered(self.config.max_concurrent_chunks.max(1))
        .collect()
        .await;

        let mut success_count = 0;
        let mut failed = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            success_count += result.succeeded;
            failed.extend(result.failed);
            errors.extend(result.errors);
        }
        failed.sort_by_key(|(index, _)| *index);

        BatchWriteOutcome {
            total,
            success_count,
            failed_items: failed.into_iter().map(|(_, record)| record).collect(),
            errors,
            chunk_count,
        }
    }

    async fn write_chunk<T: TableRecord>(
        &self,
        chunk_index: usize,
        chunk: Vec<(usize, T)>,
        cancel: &CancellationToken,
    ) -> ChunkResult<T> {
        let mut result = ChunkResult::new();
        let mut pending = Vec::with_capacity(chunk.len());

        for (index, record) in chunk {
            let key = record.item_key();
            if let Err(source) = record.validate() {
                warn!(chunk_index, item_key = %key, error = %source, "skipping invalid record");
                result.errors.push(WriteError::Invalid { key, source });
                result.failed.push((index, record));
                continue;
            }
            match to_item(&record) {
                Ok(item) => pending.push(Pending {
                    index,
                    key,
                    record,
                    item,
                }),
                Err(e) => {
                    warn!(chunk_index, item_key = %key, error = %e, "failed to serialize record");
                    result.errors.push(WriteError::Serialization {
                        key,
                        message: e.to_string(),
                    });
                    result.failed.push((index, record));
                }
            }
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        while !pending.is_empty() {
            attempt += 1;
            let items: Vec<Item> = pending.iter().map(|p| p.item.clone()).collect();

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = self.store.batch_write(&self.table, items) => Some(r),
            };

            let unprocessed = match response {
                None => {
                    warn!(chunk_index, pending = pending.len(), "chunk write cancelled");
                    result.errors.push(WriteError::Cancelled {
                        chunk_index,
                        count: pending.len(),
                    });
                    result.fail_pending(pending);
                    break;
                }
                Some(Err(source)) => {
                    error!(
                        chunk_index,
                        attempt,
                        items = pending.len(),
                        error = %source,
                        "batch write failed"
                    );
                    result.errors.push(WriteError::Store {
                        chunk_index,
                        attempt,
                        source,
                    });
                    result.fail_pending(pending);
                    break;
                }
                Some(Ok(response)) => response.unprocessed,
            };

            let unprocessed_keys: Option<HashSet<ItemKey>> = unprocessed
                .iter()
                .map(|item| self.table.key_of(item))
                .collect();
            let (retry, stored): (Vec<_>, Vec<_>) = match unprocessed_keys {
                Some(keys) => pending.into_iter().partition(|p| keys.contains(&p.key)),
                // An unkeyed leftover could be any pending record.
                None => {
                    warn!(chunk_index, attempt, "unprocessed item without a readable key");
                    (pending, Vec::new())
                }
            };
            result.succeeded += stored.len();
            pending = retry;

            if pending.is_empty() {
                break;
            }
            if attempt >= max_attempts {
                warn!(
                    chunk_index,
                    attempts = attempt,
                    unprocessed = pending.len(),
                    "giving up on unprocessed items"
                );
                result.errors.push(WriteError::Unprocessed {
                    chunk_index,
                    count: pending.len(),
                    attempts: attempt,
                });
                result.fail_pending(pending);
                break;
            }

            let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            warn!(
                chunk_index,
                attempt,
                unprocessed = pending.len(),
                delay_ms = delay.as_millis() as u64,
                "retrying unprocessed items"
            );
            let cancelled = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                result.errors.push(WriteError::Cancelled {
                    chunk_index,
                    count: pending.len(),
                });
                result.fail_pending(pending);
                break;
            }
        }

        result
    }
}
