//! Upload types for the TUS protocol

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Protocol version advertised and accepted by default
pub const TUS_RESUMABLE: &str = "1.0.0";

/// Content type every PATCH request must carry
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// TUS extensions supported by the HTTP surface
pub const TUS_EXTENSIONS: &str = "creation,termination";

/// Default maximum upload size: 500MB
pub const DEFAULT_MAX_UPLOAD_SIZE: i64 = 500 * 1024 * 1024;

/// Default number of uploads allowed to be active at once
pub const DEFAULT_MAX_CONCURRENT: usize = 1;

/// Default interval between reconciliation sweeps: 5 minutes
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Default idle time before an uploading transfer is considered abandoned: 30 minutes
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Default time a created-but-never-started upload is kept: 24 hours
pub const DEFAULT_EXPIRY_SECS: u64 = 24 * 60 * 60;

// ============================================================================
// Upload Record
// ============================================================================

/// Offset and size bookkeeping for one in-flight upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,

    /// Declared total length in bytes
    pub size: i64,

    /// Bytes persisted so far
    pub offset: i64,

    #[serde(default)]
    pub metadata: HashMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(id: impl Into<String>, size: i64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            size,
            offset: 0,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.size
    }

    /// Percentage of bytes persisted, 0 at creation and 100 at completion
    pub fn progress(&self) -> f64 {
        progress(self.offset, self.size)
    }
}

/// `100 * offset / size`
pub fn progress(offset: i64, size: i64) -> f64 {
    if size <= 0 {
        return 0.0;
    }
    (offset as f64 / size as f64) * 100.0
}

// ============================================================================
// Categories
// ============================================================================

/// Independent upload pipelines, each with its own store, queue and limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadCategory {
    Project,
    Modul,
}

impl UploadCategory {
    pub const ALL: [UploadCategory; 2] = [UploadCategory::Project, UploadCategory::Modul];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Modul => "modul",
        }
    }
}

impl fmt::Display for UploadCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadCategory {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "project" => Ok(Self::Project),
            "modul" => Ok(Self::Modul),
            other => Err(UploadError::Validation(format!(
                "kategori upload tidak dikenal: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Slot / Status Types
// ============================================================================

/// Snapshot of admission state reported to clients before they start an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSlot {
    pub available: bool,
    pub message: String,
    pub queue_length: usize,
    pub active_upload: bool,
    pub max_concurrent: usize,
}

/// Read-through status of one upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub offset: i64,
    pub size: i64,
    pub progress: f64,
    pub complete: bool,

    /// 0 when active, 1-based when waiting, -1 when unknown to the queue
    pub queue_position: i64,
}

/// Outcome of clearing an admission queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueReset {
    /// IDs the queue held, active and waiting
    pub queued: usize,
    pub terminated: usize,
    pub failed: usize,
}

/// Outcome of an idempotent delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    AlreadyAbsent,
}

impl Removal {
    pub fn was_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
///
/// User-facing messages are written in Indonesian, matching the clients
/// this server is deployed for.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),

    #[error("versi TUS protocol tidak didukung: {0}")]
    UnsupportedVersion(String),

    #[error("upload tidak ditemukan: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    Locked(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("repository error: {0}")]
    Repository(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Locked(_) => StatusCode::LOCKED,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            Self::NotFound(_) => "UPLOAD_NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Locked(_) => "UPLOAD_LOCKED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Repository(_) => "REPOSITORY_ERROR",
        }
    }
}
