//! Upload record database operations

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::upload::{
    PersistedStatus, PersistedUpload, PersistedUploadRepository, Removal, UploadCategory,
    UploadError,
};

/// Upload record row
#[derive(Debug, Clone, sqlx::FromRow)]
struct UploadRow {
    id: String,
    category: String,
    owner_id: Option<i64>,
    status: String,
    size: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<UploadRow> for PersistedUpload {
    type Error = UploadError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
        Ok(PersistedUpload {
            category: row.category.parse().map_err(|_| {
                UploadError::Repository(format!("unknown category: {}", row.category))
            })?,
            status: row.status.parse()?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            id: row.id,
            owner_id: row.owner_id,
            size: row.size,
        })
    }
}

/// Fixed precision keeps lexical order equal to chronological order
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, UploadError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| UploadError::Repository(format!("invalid timestamp {}: {}", raw, e)))
}

fn db_error(e: sqlx::Error) -> UploadError {
    UploadError::Repository(e.to_string())
}

/// SQLite-backed upload repository
#[derive(Clone)]
pub struct SqliteUploadRepository {
    pool: SqlitePool,
}

impl SqliteUploadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn ids(
        &self,
        sql: &str,
        category: UploadCategory,
        status: PersistedStatus,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, UploadError> {
        let mut query = sqlx::query_scalar::<_, String>(sql)
            .bind(category.as_str())
            .bind(status.as_str());
        if let Some(cutoff) = cutoff {
            query = query.bind(format_timestamp(cutoff));
        }

        query.fetch_all(&self.pool).await.map_err(db_error)
    }
}

#[async_trait::async_trait]
impl PersistedUploadRepository for SqliteUploadRepository {
    async fn create(&self, upload: &PersistedUpload) -> Result<(), UploadError> {
        sqlx::query(
            r#"
            INSERT INTO uploads (id, category, owner_id, status, size, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&upload.id)
        .bind(upload.category.as_str())
        .bind(upload.owner_id)
        .bind(upload.status.as_str())
        .bind(upload.size)
        .bind(format_timestamp(upload.created_at))
        .bind(format_timestamp(upload.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PersistedUpload>, UploadError> {
        let row = sqlx::query_as::<_, UploadRow>(
            r#"
            SELECT id, category, owner_id, status, size, created_at, updated_at
            FROM uploads
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(PersistedUpload::try_from).transpose()
    }

    async fn update_status(&self, id: &str, status: PersistedStatus) -> Result<(), UploadError> {
        let result = sqlx::query("UPDATE uploads SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(format_timestamp(Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(UploadError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<Removal, UploadError> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(if result.rows_affected() > 0 {
            Removal::Deleted
        } else {
            Removal::AlreadyAbsent
        })
    }

    async fn active_upload_ids(
        &self,
        category: UploadCategory,
    ) -> Result<Vec<String>, UploadError> {
        self.ids(
            "SELECT id FROM uploads WHERE category = ? AND status = ? ORDER BY updated_at ASC",
            category,
            PersistedStatus::Uploading,
            None,
        )
        .await
    }

    async fn pending_upload_ids(
        &self,
        category: UploadCategory,
    ) -> Result<Vec<String>, UploadError> {
        self.ids(
            "SELECT id FROM uploads WHERE category = ? AND status = ? ORDER BY created_at ASC",
            category,
            PersistedStatus::Pending,
            None,
        )
        .await
    }

    async fn expired_candidates(
        &self,
        category: UploadCategory,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<String>, UploadError> {
        self.ids(
            "SELECT id FROM uploads \
             WHERE category = ? AND status = ? AND created_at < ? \
             ORDER BY created_at ASC",
            category,
            PersistedStatus::Pending,
            Some(created_before),
        )
        .await
    }

    async fn abandoned_candidates(
        &self,
        category: UploadCategory,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<String>, UploadError> {
        self.ids(
            "SELECT id FROM uploads \
             WHERE category = ? AND status = ? AND updated_at < ? \
             ORDER BY updated_at ASC",
            category,
            PersistedStatus::Uploading,
            Some(updated_before),
        )
        .await
    }
}
