//! In-memory keyed table store for tests and local runs.
//!
//! Tables are `BTreeMap`s keyed by [`ItemKey`] behind `std::sync::RwLock`.
//! Secondary-index queries scan the table, sort on the index sort key, and
//! page with an offset cursor. Every batch-write call's size is recorded so
//! tests can assert on chunking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::StoreError;

use super::{
    BatchWriteResponse, IndexQuery, Item, ItemKey, KeyedTableStore, PageCursor, QueryPage,
    SecondaryIndexQuery, SortOrder, TableSpec, MAX_BATCH_WRITE_ITEMS,
};

const DEFAULT_PAGE_SIZE: usize = 100;

pub struct InMemoryTableStore {
    tables: RwLock<HashMap<String, BTreeMap<ItemKey, Item>>>,
    write_calls: Mutex<Vec<usize>>,
    query_calls: Mutex<usize>,
    throttled: RwLock<HashSet<ItemKey>>,
    page_size: usize,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Page size used when a query does not set its own limit.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            write_calls: Mutex::new(Vec::new()),
            query_calls: Mutex::new(0),
            throttled: RwLock::new(HashSet::new()),
            page_size: page_size.max(1),
        }
    }

    /// Always hand items with this key back as unprocessed.
    pub fn throttle_key(&self, key: ItemKey) {
        self.throttled
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
    }

    pub fn get(&self, table: &str, key: &ItemKey) -> Option<Item> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).and_then(|t| t.get(key)).cloned()
    }

    pub fn len(&self, table: &str) -> usize {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    /// All items of a table, ordered by primary key.
    pub fn items(&self, table: &str) -> Vec<Item> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sizes of every batch-write call received, in call order.
    pub fn write_call_sizes(&self) -> Vec<usize> {
        self.write_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn query_call_count(&self) -> usize {
        *self.query_calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an item without going through the batch path or key checks.
    pub fn insert_raw(&self, table: &str, key: ItemKey, item: Item) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.entry(table.to_string()).or_default().insert(key, item);
    }
}

impl Default for InMemoryTableStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validation_error(message: impl Into<String>) -> StoreError {
    StoreError::Service {
        status: 400,
        code: "ValidationException".to_string(),
        message: message.into(),
    }
}

fn sort_value(item: &Item, attribute: Option<&str>) -> String {
    match attribute.and_then(|a| item.get(a)) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn decode_offset(cursor: &PageCursor) -> Result<usize, StoreError> {
    cursor
        .0
        .get("offset")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .ok_or_else(|| validation_error("invalid pagination cursor"))
}

#[async_trait]
impl KeyedTableStore for InMemoryTableStore {
    async fn batch_write(
        &self,
        table: &TableSpec,
        items: Vec<Item>,
    ) -> Result<BatchWriteResponse, StoreError> {
        self.write_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(items.len());

        if items.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(validation_error(format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                MAX_BATCH_WRITE_ITEMS
            )));
        }

        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let key = table.key_of(&item).ok_or_else(|| {
                validation_error(format!(
                    "item is missing key attribute(s) for table {}",
                    table.name
                ))
            })?;
            keyed.push((key, item));
        }

        let throttled = self.throttled.read().unwrap_or_else(|e| e.into_inner());
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let stored = tables.entry(table.name.clone()).or_default();
        let mut unprocessed = Vec::new();
        for (key, item) in keyed {
            if throttled.contains(&key) {
                unprocessed.push(item);
            } else {
                stored.insert(key, item);
            }
        }

        Ok(BatchWriteResponse { unprocessed })
    }
}

#[async_trait]
impl SecondaryIndexQuery for InMemoryTableStore {
    async fn query(&self, request: IndexQuery) -> Result<QueryPage, StoreError> {
        *self.query_calls.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        let offset = match &request.cursor {
            Some(cursor) => decode_offset(cursor)?,
            None => 0,
        };
        let limit = request.limit.unwrap_or(self.page_size).max(1);
        let sort_key = request.index.sort_key.as_deref();

        let mut matches: Vec<Item> = {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            tables
                .get(&request.table)
                .map(|t| {
                    t.values()
                        .filter(|item| {
                            item.get(&request.index.partition_key).and_then(Value::as_str)
                                == Some(request.partition_value.as_str())
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        // Stable sort keeps primary-key order among equal sort values in
        // either direction.
        matches.sort_by(|a, b| {
            let (a, b) = (sort_value(a, sort_key), sort_value(b, sort_key));
            match request.order {
                SortOrder::Ascending => a.cmp(&b),
                SortOrder::Descending => b.cmp(&a),
            }
        });

        let end = (offset + limit).min(matches.len());
        let items = matches
            .get(offset..end)
            .map(<[Item]>::to_vec)
            .unwrap_or_default();
        let next_cursor = (end < matches.len()).then(|| PageCursor(json!({ "offset": end })));

        Ok(QueryPage { items, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SecondaryIndex;

    fn papers() -> TableSpec {
        TableSpec::new("papers", "paper_id")
    }

    fn paper(id: &str, trace: &str, ts: &str) -> Item {
        json!({"paper_id": id, "trace_id": trace, "batch_timestamp": ts, "title": id})
            .as_object()
            .cloned()
            .unwrap()
    }

    fn trace_query(trace: &str, cursor: Option<PageCursor>, limit: usize) -> IndexQuery {
        IndexQuery {
            table: "papers".to_string(),
            index: SecondaryIndex {
                name: "trace_id-index".to_string(),
                partition_key: "trace_id".to_string(),
                sort_key: Some("batch_timestamp".to_string()),
            },
            partition_value: trace.to_string(),
            order: SortOrder::Descending,
            cursor,
            limit: Some(limit),
        }
    }

    #[tokio::test]
    async fn test_batch_write_upserts_by_key() {
        let store = InMemoryTableStore::new();
        store
            .batch_write(&papers(), vec![paper("p1", "t", "1"), paper("p2", "t", "1")])
            .await
            .unwrap();
        let mut replacement = paper("p1", "t", "2");
        replacement.insert("title".into(), json!("new title"));
        store.batch_write(&papers(), vec![replacement]).await.unwrap();

        assert_eq!(store.len("papers"), 2);
        let stored = store.get("papers", &ItemKey::partition("p1")).unwrap();
        assert_eq!(stored["title"], "new title");
        assert_eq!(store.write_call_sizes(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_batch_write_rejects_oversized_batch() {
        let store = InMemoryTableStore::new();
        let items: Vec<Item> = (0..26).map(|i| paper(&format!("p{i}"), "t", "1")).collect();
        let err = store.batch_write(&papers(), items).await.unwrap_err();
        assert!(matches!(err, StoreError::Service { status: 400, .. }));
        assert!(store.is_empty("papers"));
    }

    #[tokio::test]
    async fn test_throttled_keys_come_back_unprocessed() {
        let store = InMemoryTableStore::new();
        store.throttle_key(ItemKey::partition("p2"));
        let response = store
            .batch_write(&papers(), vec![paper("p1", "t", "1"), paper("p2", "t", "1")])
            .await
            .unwrap();
        assert_eq!(response.unprocessed.len(), 1);
        assert_eq!(response.unprocessed[0]["paper_id"], "p2");
        assert_eq!(store.len("papers"), 1);
    }

    #[tokio::test]
    async fn test_query_pages_in_descending_order() {
        let store = InMemoryTableStore::new();
        store
            .batch_write(
                &papers(),
                vec![
                    paper("a", "t1", "2024-01-01"),
                    paper("b", "t1", "2024-01-03"),
                    paper("c", "t1", "2024-01-02"),
                    paper("d", "t2", "2024-01-04"),
                ],
            )
            .await
            .unwrap();

        let first = store.query(trace_query("t1", None, 2)).await.unwrap();
        let ids: Vec<_> = first.items.iter().map(|i| i["paper_id"].clone()).collect();
        assert_eq!(ids, vec![json!("b"), json!("c")]);
        assert!(first.next_cursor.is_some());

        let second = store
            .query(trace_query("t1", first.next_cursor, 2))
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0]["paper_id"], "a");
        assert!(second.next_cursor.is_none());
        assert_eq!(store.query_call_count(), 2);
    }

    #[tokio::test]
    async fn test_query_ties_keep_key_order_in_both_directions() {
        let store = InMemoryTableStore::new();
        store
            .batch_write(
                &papers(),
                vec![
                    paper("c", "t1", "2024-01-01"),
                    paper("a", "t1", "2024-01-01"),
                    paper("d", "t1", "2024-01-02"),
                    paper("b", "t1", "2024-01-01"),
                ],
            )
            .await
            .unwrap();

        let descending = store.query(trace_query("t1", None, 10)).await.unwrap();
        let ids: Vec<_> = descending.items.iter().map(|i| i["paper_id"].clone()).collect();
        assert_eq!(ids, vec![json!("d"), json!("a"), json!("b"), json!("c")]);

        let mut request = trace_query("t1", None, 10);
        request.order = SortOrder::Ascending;
        let ascending = store.query(request).await.unwrap();
        let ids: Vec<_> = ascending.items.iter().map(|i| i["paper_id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("b"), json!("c"), json!("d")]);
    }

    #[tokio::test]
    async fn test_query_rejects_bad_cursor() {
        let store = InMemoryTableStore::new();
        let err = store
            .query(trace_query("t1", Some(PageCursor(json!("bogus"))), 2))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Service { .. }));
    }
}
