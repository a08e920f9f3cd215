//! Durable upload records
//!
//! The repository owns long-lived status and ownership. It outlives the chunk
//! store and the admission queue across restarts and is the source of truth
//! for reconciliation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Removal, UploadCategory, UploadError};

/// Lifecycle status of a durable upload record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistedStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl PersistedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PersistedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistedStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UploadError::Repository(format!("unknown upload status: {}", other))),
        }
    }
}

/// Durable upload record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedUpload {
    pub id: String,
    pub category: UploadCategory,
    pub owner_id: Option<i64>,
    pub status: PersistedStatus,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedUpload {
    pub fn pending(
        id: impl Into<String>,
        category: UploadCategory,
        owner_id: Option<i64>,
        size: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            category,
            owner_id,
            status: PersistedStatus::Pending,
            size,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage for durable upload records
#[async_trait::async_trait]
pub trait PersistedUploadRepository: Send + Sync {
    async fn create(&self, upload: &PersistedUpload) -> Result<(), UploadError>;

    async fn get(&self, id: &str) -> Result<Option<PersistedUpload>, UploadError>;

    /// Set the status and bump `updated_at`
    async fn update_status(&self, id: &str, status: PersistedStatus) -> Result<(), UploadError>;

    async fn delete(&self, id: &str) -> Result<Removal, UploadError>;

    /// IDs in `uploading` status, used to rebuild the admission queue
    async fn active_upload_ids(
        &self,
        category: UploadCategory,
    ) -> Result<Vec<String>, UploadError>;

    /// IDs in `pending` status, oldest first
    async fn pending_upload_ids(
        &self,
        category: UploadCategory,
    ) -> Result<Vec<String>, UploadError>;

    /// `pending` uploads created before `created_before`
    async fn expired_candidates(
        &self,
        category: UploadCategory,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<String>, UploadError>;

    /// `uploading` uploads not updated since `updated_before`
    async fn abandoned_candidates(
        &self,
        category: UploadCategory,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<String>, UploadError>;
}
