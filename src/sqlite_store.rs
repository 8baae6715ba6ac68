//! SQLite-backed table store for local runs.
//!
//! All logical tables share the `items` table created by
//! [`run_migrations`](crate::migrate::run_migrations). Index queries filter
//! and order on the JSON body with `json_extract`, and page with an offset
//! cursor of the form `{"offset": n}`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;

use trace_pipeline_core::error::StoreError;
use trace_pipeline_core::store::{
    BatchWriteResponse, IndexQuery, Item, KeyedTableStore, PageCursor, QueryPage,
    SecondaryIndexQuery, SortOrder, TableSpec, MAX_BATCH_WRITE_ITEMS,
};

/// Rows per page when the query sets no limit.
pub const DEFAULT_PAGE_SIZE: usize = 100;

pub struct SqliteTableStore {
    pool: SqlitePool,
}

impl SqliteTableStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Transport(format!("sqlite: {}", e))
}

fn validation_error(message: impl Into<String>) -> StoreError {
    StoreError::Service {
        status: 400,
        code: "ValidationException".to_string(),
        message: message.into(),
    }
}

fn json_path(attribute: &str) -> String {
    format!("$.\"{}\"", attribute.replace('"', ""))
}

#[async_trait]
impl KeyedTableStore for SqliteTableStore {
    async fn batch_write(
        &self,
        table: &TableSpec,
        items: Vec<Item>,
    ) -> Result<BatchWriteResponse, StoreError> {
        if items.len() > MAX_BATCH_WRITE_ITEMS {
            return Err(validation_error(format!(
                "batch of {} items exceeds the limit of {}",
                items.len(),
                MAX_BATCH_WRITE_ITEMS
            )));
        }

        let mut rows = Vec::with_capacity(items.len());
        for item in &items {
            let key = table.key_of(item).ok_or_else(|| {
                validation_error(format!("item is missing a key attribute of {}", table.name))
            })?;
            let body = serde_json::to_string(item)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            rows.push((key, body));
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        for (key, body) in rows {
            sqlx::query(
                "INSERT OR REPLACE INTO items (table_name, pk, sk, body, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&table.name)
            .bind(&key.partition)
            .bind(key.sort.as_deref().unwrap_or(""))
            .bind(body)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }
        tx.commit().await.map_err(db_error)?;

        Ok(BatchWriteResponse::default())
    }
}

#[async_trait]
impl SecondaryIndexQuery for SqliteTableStore {
    async fn query(&self, request: IndexQuery) -> Result<QueryPage, StoreError> {
        let offset = match &request.cursor {
            Some(PageCursor(cursor)) => cursor
                .get("offset")
                .and_then(Value::as_u64)
                .ok_or_else(|| validation_error("invalid pagination cursor"))?,
            None => 0,
        };
        let limit = request.limit.unwrap_or(DEFAULT_PAGE_SIZE).max(1);
        let direction = match request.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let sort_path = json_path(request.index.sort_key.as_deref().unwrap_or(""));

        let sql = format!(
            "SELECT body FROM items \
             WHERE table_name = ? AND json_extract(body, ?) = ? \
             ORDER BY json_extract(body, ?) {direction}, pk ASC, sk ASC \
             LIMIT ? OFFSET ?"
        );

        // One extra row tells us whether another page exists.
        let bodies: Vec<String> = sqlx::query_scalar(&sql)
            .bind(&request.table)
            .bind(json_path(&request.index.partition_key))
            .bind(&request.partition_value)
            .bind(sort_path)
            .bind((limit + 1) as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        let has_more = bodies.len() > limit;
        let mut items = Vec::with_capacity(limit.min(bodies.len()));
        for body in bodies.into_iter().take(limit) {
            match serde_json::from_str::<Value>(&body) {
                Ok(Value::Object(item)) => items.push(item),
                Ok(_) => {
                    return Err(StoreError::Serialization(
                        "stored item is not a JSON object".into(),
                    ))
                }
                Err(e) => return Err(StoreError::Serialization(e.to_string())),
            }
        }

        let next_cursor =
            has_more.then(|| PageCursor(json!({ "offset": offset + items.len() as u64 })));

        Ok(QueryPage { items, next_cursor })
    }
}
