use anyhow::Result;
use sqlx::SqlitePool;

/// Create the bookkeeping tables. Safe to run on every startup.
///
/// Data collections are not created here; each one becomes its own table
/// when the batch writer provisions it.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Registry of provisioned collections and the mapping they were created with
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            mapping_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
