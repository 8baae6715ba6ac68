//! Keyed table store abstraction.
//!
//! The pipeline reaches its persistence layer through two narrow traits:
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`KeyedTableStore`] | Batch-write whole items (upsert by primary key) |
//! | [`SecondaryIndexQuery`] | Page through a secondary index by partition value |
//!
//! Items are plain JSON maps so that every adapter (DynamoDB, SQLite,
//! in-memory) can translate them to its own wire format. Implementations
//! must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::{StoreError, ValidationError};

/// A stored item: attribute name to JSON value.
pub type Item = serde_json::Map<String, Value>;

/// Upper bound on items per batch-write call accepted by the store.
pub const MAX_BATCH_WRITE_ITEMS: usize = 25;

/// Primary key of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub partition: String,
    pub sort: Option<String>,
}

impl ItemKey {
    pub fn partition(value: impl Into<String>) -> Self {
        Self {
            partition: value.into(),
            sort: None,
        }
    }

    pub fn with_sort(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sort {
            Some(sort) => write!(f, "{}#{}", self.partition, sort),
            None => f.write_str(&self.partition),
        }
    }
}

/// Table name plus key schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            sort_key: None,
        }
    }

    pub fn with_sort_key(mut self, sort_key: impl Into<String>) -> Self {
        self.sort_key = Some(sort_key.into());
        self
    }

    /// Extract the primary key of `item` according to this schema.
    ///
    /// Returns `None` if a key attribute is missing or empty.
    pub fn key_of(&self, item: &Item) -> Option<ItemKey> {
        let partition = key_value(item, &self.partition_key)?;
        let sort = match &self.sort_key {
            Some(name) => Some(key_value(item, name)?),
            None => None,
        };
        Some(ItemKey { partition, sort })
    }
}

fn key_value(item: &Item, attribute: &str) -> Option<String> {
    let value = match item.get(attribute)? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

/// Result of one batch-write call. Items the store did not process are
/// handed back so the caller can retry or report them.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteResponse {
    pub unprocessed: Vec<Item>,
}

/// Batch upsert into a keyed table.
///
/// Each item replaces any existing item with the same primary key. A
/// successful call may still leave some items unprocessed (throttling);
/// an `Err` means the whole call failed.
#[async_trait]
pub trait KeyedTableStore: Send + Sync {
    /// Largest batch accepted by [`batch_write`](KeyedTableStore::batch_write).
    fn max_batch_size(&self) -> usize {
        MAX_BATCH_WRITE_ITEMS
    }

    async fn batch_write(
        &self,
        table: &TableSpec,
        items: Vec<Item>,
    ) -> Result<BatchWriteResponse, StoreError>;
}

/// Opaque continuation cursor returned by [`SecondaryIndexQuery::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct PageCursor(pub Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// A secondary index over a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryIndex {
    pub name: String,
    pub partition_key: String,
    pub sort_key: Option<String>,
}

/// One page request against a secondary index.
#[derive(Debug, Clone)]
pub struct IndexQuery {
    pub table: String,
    pub index: SecondaryIndex,
    pub partition_value: String,
    pub order: SortOrder,
    pub cursor: Option<PageCursor>,
    pub limit: Option<usize>,
}

/// One page of query results. `next_cursor` is `None` on the last page.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    pub next_cursor: Option<PageCursor>,
}

/// Paged reads from a secondary index.
#[async_trait]
pub trait SecondaryIndexQuery: Send + Sync {
    async fn query(&self, request: IndexQuery) -> Result<QueryPage, StoreError>;
}

/// A record type that can be written by the batch writer.
pub trait TableRecord: Serialize + Clone + Send + Sync + 'static {
    fn item_key(&self) -> ItemKey;

    /// Local checks run before the record is sent to the store.
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Serialize a record into a store item. Records must serialize to a JSON
/// object.
pub fn to_item<T: Serialize>(record: &T) -> Result<Item, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Serialization(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(StoreError::Serialization(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
