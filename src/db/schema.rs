//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL)
        .execute(pool)
        .await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Upload records (durable status and ownership)
CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    owner_id INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    size INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_category_status ON uploads(category, status);
CREATE INDEX IF NOT EXISTS idx_uploads_created_at ON uploads(created_at);
CREATE INDEX IF NOT EXISTS idx_uploads_updated_at ON uploads(updated_at);
"#;
