//! Resumable Upload Module (TUS 1.0)
//!
//! Implements offset-tracked chunked uploads with:
//! - Local-disk chunk storage that survives restarts
//! - Bounded concurrent uploads with FIFO queueing
//! - Background reconciliation of expired and abandoned uploads
//!
//! Protocol Flow:
//! 1. Client creates an upload with its total length and metadata
//! 2. Server admits it or queues it
//! 3. Client sends chunks, each starting at the server's current offset
//! 4. Server relocates the file once the offset reaches the length

pub mod chunk_store;
pub mod manager;
pub mod metadata;
pub mod queue;
pub mod relocate;
pub mod repository;
pub mod sweeper;
pub mod types;

pub use chunk_store::ChunkStore;
pub use manager::UploadManager;
pub use metadata::{
    encode_metadata, extract_user_id, parse_metadata, validate_modul_metadata,
    validate_project_metadata,
};
pub use queue::{AdmissionQueue, NOT_QUEUED};
pub use relocate::{DirectoryRelocator, FileRelocator};
pub use repository::{PersistedStatus, PersistedUpload, PersistedUploadRepository};
pub use sweeper::{ReconciliationSweeper, SweepReport, SweepTarget};
pub use types::*;
