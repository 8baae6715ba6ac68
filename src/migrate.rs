use anyhow::Result;
use sqlx::SqlitePool;

/// Create the `items` table and its lookup index. Idempotent.
///
/// Every logical table shares one physical table: rows are keyed by
/// `(table_name, pk, sk)` and the full item is kept as JSON in `body`.
/// Tables without a sort key store `''` in `sk`.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            table_name TEXT NOT NULL,
            pk TEXT NOT NULL,
            sk TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (table_name, pk, sk)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_table ON items(table_name)")
        .execute(pool)
        .await?;

    Ok(())
}
