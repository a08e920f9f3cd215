//! Upload Manager
//!
//! Applies TUS protocol rules on top of the chunk store and admission queue:
//! - version, content type and offset preconditions
//! - metadata parsing and per-category validation
//! - progress and slot reporting
//! - relocation of finished uploads

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use tokio::io::AsyncRead;

use super::chunk_store::ChunkStore;
use super::metadata;
use super::queue::AdmissionQueue;
use super::relocate::FileRelocator;
use super::types::{
    QueueReset, Removal, UploadCategory, UploadError, UploadRecord, UploadSlot, UploadStatus,
    OFFSET_OCTET_STREAM,
};

// ============================================================================
// Upload Manager
// ============================================================================

/// Protocol orchestration for one upload category
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<UploadManagerInner>,
}

struct UploadManagerInner {
    category: UploadCategory,
    tus_version: String,
    store: ChunkStore,
    queue: AdmissionQueue,
    relocator: Arc<dyn FileRelocator>,
}

impl UploadManager {
    pub fn new(
        category: UploadCategory,
        tus_version: impl Into<String>,
        store: ChunkStore,
        queue: AdmissionQueue,
        relocator: Arc<dyn FileRelocator>,
    ) -> Self {
        Self {
            inner: Arc::new(UploadManagerInner {
                category,
                tus_version: tus_version.into(),
                store,
                queue,
                relocator,
            }),
        }
    }

    pub fn category(&self) -> UploadCategory {
        self.inner.category
    }

    pub fn tus_version(&self) -> &str {
        &self.inner.tus_version
    }

    pub fn store(&self) -> &ChunkStore {
        &self.inner.store
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.inner.queue
    }

    pub fn max_size(&self) -> i64 {
        self.inner.store.max_size()
    }

    // ========================================================================
    // Protocol Preconditions
    // ========================================================================

    pub fn validate_tus_version(&self, version: &str) -> Result<(), UploadError> {
        if version != self.inner.tus_version {
            return Err(UploadError::UnsupportedVersion(version.to_string()));
        }
        Ok(())
    }

    pub fn validate_content_type(&self, content_type: &str) -> Result<(), UploadError> {
        if content_type != OFFSET_OCTET_STREAM {
            return Err(UploadError::Validation(format!(
                "content type tidak valid: {} (harus {})",
                content_type, OFFSET_OCTET_STREAM
            )));
        }
        Ok(())
    }

    /// Must pass before any byte of a chunk is written
    pub async fn validate_offset(&self, id: &str, client_offset: i64) -> Result<(), UploadError> {
        let server_offset = self.inner.store.get_offset(id).await?;
        if server_offset != client_offset {
            return Err(UploadError::Conflict(format!(
                "offset tidak cocok: server {}, client {}",
                server_offset, client_offset
            )));
        }
        Ok(())
    }

    /// Check a request body against the length the client declared
    pub fn read_chunk_from_body(
        body: Bytes,
        expected_size: i64,
    ) -> Result<Cursor<Bytes>, UploadError> {
        if body.is_empty() {
            return Err(UploadError::Validation("body chunk kosong".into()));
        }
        if body.len() as i64 != expected_size {
            return Err(UploadError::Validation(format!(
                "ukuran chunk tidak cocok: diterima {}, diharapkan {}",
                body.len(),
                expected_size
            )));
        }
        Ok(Cursor::new(body))
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub fn parse_metadata(raw: &str) -> Result<HashMap<String, String>, UploadError> {
        metadata::parse_metadata(raw)
    }

    pub fn extract_user_id(metadata: &HashMap<String, String>) -> Result<u64, UploadError> {
        metadata::extract_user_id(metadata)
    }

    /// Run the validator for this manager's category
    pub fn validate_metadata(
        &self,
        metadata: &mut HashMap<String, String>,
    ) -> Result<(), UploadError> {
        match self.inner.category {
            UploadCategory::Project => metadata::validate_project_metadata(metadata),
            UploadCategory::Modul => metadata::validate_modul_metadata(metadata),
        }
    }

    pub fn default_tus_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("Tus-Resumable".to_string(), self.inner.tus_version.clone());
        headers
    }

    // ========================================================================
    // Upload Lifecycle
    // ========================================================================

    pub async fn initiate_upload(
        &self,
        id: &str,
        size: i64,
        metadata: HashMap<String, String>,
    ) -> Result<UploadRecord, UploadError> {
        let mut record = self.inner.store.initiate_upload(id, size).await?;

        if !metadata.is_empty() {
            if let Err(e) = self.inner.store.update_metadata(id, metadata.clone()).await {
                if let Err(cleanup) = self.inner.store.terminate(id).await {
                    tracing::warn!(
                        upload_id = %id,
                        error = %cleanup,
                        "Failed to roll back upload after metadata error"
                    );
                }
                return Err(e);
            }
            record.metadata = metadata;
        }

        Ok(record)
    }

    pub async fn handle_chunk<R>(
        &self,
        id: &str,
        offset: i64,
        reader: R,
    ) -> Result<i64, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.inner.store.write_chunk(id, offset, reader).await
    }

    /// Delete the upload's artifacts and release its queue slot
    pub async fn cancel_upload(&self, id: &str) -> Result<Removal, UploadError> {
        let removal = self.inner.store.terminate(id).await?;
        self.inner.queue.finish_upload(id);

        tracing::info!(
            upload_id = %id,
            category = %self.inner.category,
            deleted = removal.was_deleted(),
            "Upload cancelled"
        );

        Ok(removal)
    }

    /// Move the upload to `dest` without checking completeness
    pub async fn finalize_upload(&self, id: &str, dest: &Path) -> Result<PathBuf, UploadError> {
        self.inner.store.finalize_upload(id, dest).await
    }

    /// Move a complete upload to the destination resolved from its metadata
    /// and release its queue slot
    pub async fn finalize_to_destination(&self, id: &str) -> Result<PathBuf, UploadError> {
        let info = self.inner.store.get_info(id).await?;
        if !info.is_complete() {
            return Err(UploadError::Conflict(format!(
                "upload belum selesai: {} dari {} bytes",
                info.offset, info.size
            )));
        }

        let dest = self
            .inner
            .relocator
            .destination(self.inner.category, id, &info.metadata)?;
        let path = self.inner.store.finalize_upload(id, &dest).await?;
        self.inner.queue.finish_upload(id);

        Ok(path)
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    pub async fn get_upload_info(&self, id: &str) -> Result<UploadRecord, UploadError> {
        self.inner.store.get_info(id).await
    }

    pub async fn get_upload_status(&self, id: &str) -> Result<UploadStatus, UploadError> {
        let info = self.inner.store.get_info(id).await?;
        Ok(UploadStatus {
            offset: info.offset,
            size: info.size,
            progress: info.progress(),
            complete: info.is_complete(),
            queue_position: self.inner.queue.get_queue_position(id),
        })
    }

    pub async fn get_upload_progress(&self, id: &str) -> Result<f64, UploadError> {
        self.inner.store.get_progress(id).await
    }

    pub async fn is_upload_complete(&self, id: &str) -> Result<bool, UploadError> {
        self.inner.store.is_complete(id).await
    }

    // ========================================================================
    // Admission
    // ========================================================================

    pub fn add_to_queue(&self, id: &str) {
        self.inner.queue.add(id);
    }

    pub fn remove_from_queue(&self, id: &str) -> Result<(), UploadError> {
        self.inner.queue.remove(id)
    }

    pub fn finish_upload(&self, id: &str) {
        self.inner.queue.finish_upload(id);
    }

    pub fn can_accept_upload(&self) -> bool {
        self.inner.queue.can_accept_upload()
    }

    pub fn is_active_upload(&self, id: &str) -> bool {
        self.inner.queue.is_active_upload(id)
    }

    pub fn queue_position(&self, id: &str) -> i64 {
        self.inner.queue.get_queue_position(id)
    }

    /// Clear the queue and terminate every upload it held
    ///
    /// A failed termination is logged and counted; the remaining uploads are
    /// still terminated.
    pub async fn reset_upload_queue(&self) -> QueueReset {
        let ids = self.inner.queue.clear();
        let mut report = QueueReset {
            queued: ids.len(),
            ..QueueReset::default()
        };

        for id in &ids {
            match self.inner.store.terminate(id).await {
                Ok(removal) if removal.was_deleted() => report.terminated += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        upload_id = %id,
                        category = %self.inner.category,
                        error = %e,
                        "Failed to terminate queued upload"
                    );
                }
            }
        }

        tracing::info!(
            category = %self.inner.category,
            queued = report.queued,
            terminated = report.terminated,
            failed = report.failed,
            "Upload queue reset"
        );

        report
    }

    pub fn check_upload_slot(&self) -> UploadSlot {
        let queue = &self.inner.queue;
        let available = queue.can_accept_upload();
        let queue_length = queue.get_queue_length();
        let active = queue.get_active_uploads().len();
        let max_concurrent = queue.max_concurrent();

        let message = if available {
            format!(
                "Slot upload tersedia ({} dari {} slot terpakai)",
                active, max_concurrent
            )
        } else if queue_length == 0 {
            format!(
                "Semua slot upload sedang digunakan ({}/{}), upload baru akan masuk antrian",
                active, max_concurrent
            )
        } else {
            format!(
                "Semua slot upload sedang digunakan ({}/{}), {} upload menunggu dalam antrian",
                active, max_concurrent, queue_length
            )
        };

        UploadSlot {
            available,
            message,
            queue_length,
            active_upload: active > 0,
            max_concurrent,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::relocate::DirectoryRelocator;
    use crate::upload::types::TUS_RESUMABLE;
    use tempfile::TempDir;

    const MAX: i64 = 1024;

    fn manager(temp_dir: &TempDir, max_concurrent: usize) -> UploadManager {
        UploadManager::new(
            UploadCategory::Project,
            TUS_RESUMABLE,
            ChunkStore::new(temp_dir.path().join("tmp"), MAX),
            AdmissionQueue::new(max_concurrent),
            Arc::new(DirectoryRelocator::new(temp_dir.path().join("final"))),
        )
    }

    #[tokio::test]
    async fn test_validate_tus_version() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        manager.validate_tus_version("1.0.0").unwrap();
        let err = manager.validate_tus_version("0.2.2").unwrap_err();
        assert!(matches!(err, UploadError::UnsupportedVersion(_)));
        assert!(err.to_string().contains("versi TUS protocol tidak didukung"));
    }

    #[tokio::test]
    async fn test_validate_content_type() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        manager.validate_content_type(OFFSET_OCTET_STREAM).unwrap();
        assert!(matches!(
            manager.validate_content_type("application/json"),
            Err(UploadError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_offset_mismatch_blocks_write() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);
        manager.initiate_upload("u1", 20, HashMap::new()).await.unwrap();

        let err = manager.validate_offset("u1", 5).await.unwrap_err();
        assert!(matches!(err, UploadError::Conflict(_)));
        assert!(err.to_string().contains("offset tidak cocok"));
        assert_eq!(manager.get_upload_info("u1").await.unwrap().offset, 0);

        manager.validate_offset("u1", 0).await.unwrap();
        assert!(matches!(
            manager.validate_offset("missing", 0).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[test]
    fn test_read_chunk_from_body() {
        let err = UploadManager::read_chunk_from_body(Bytes::new(), 0).unwrap_err();
        assert!(err.to_string().contains("kosong"));

        let err = UploadManager::read_chunk_from_body(Bytes::from_static(b"abc"), 5).unwrap_err();
        assert!(err.to_string().contains("tidak cocok"));

        let reader = UploadManager::read_chunk_from_body(Bytes::from_static(b"abc"), 3).unwrap();
        assert_eq!(&reader.get_ref()[..], b"abc");
    }

    #[tokio::test]
    async fn test_initiate_persists_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        let metadata = UploadManager::parse_metadata("filename dGVzdC56aXA=").unwrap();
        let record = manager.initiate_upload("u1", 20, metadata).await.unwrap();
        assert_eq!(record.metadata["filename"], "test.zip");

        let info = manager.get_upload_info("u1").await.unwrap();
        assert_eq!(info.metadata["filename"], "test.zip");
    }

    #[tokio::test]
    async fn test_initiate_size_bounds() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        assert!(matches!(
            manager.initiate_upload("a", 0, HashMap::new()).await,
            Err(UploadError::Validation(_))
        ));
        assert!(matches!(
            manager.initiate_upload("b", MAX + 1, HashMap::new()).await,
            Err(UploadError::PayloadTooLarge(_))
        ));
        manager.initiate_upload("c", MAX, HashMap::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);
        manager.initiate_upload("u1", 20, HashMap::new()).await.unwrap();
        manager.add_to_queue("u1");
        assert!(manager.is_active_upload("u1"));

        let body = Bytes::from_static(b"test chunk content!!");
        manager.validate_offset("u1", 0).await.unwrap();
        let reader = UploadManager::read_chunk_from_body(body, 20).unwrap();
        let offset = manager.handle_chunk("u1", 0, reader).await.unwrap();

        assert_eq!(offset, 20);
        assert!(manager.is_upload_complete("u1").await.unwrap());
        assert_eq!(manager.get_upload_progress("u1").await.unwrap(), 100.0);

        let dest = temp_dir.path().join("final").join("file.zip");
        manager.finalize_upload("u1", &dest).await.unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_finalize_to_destination_requires_completion() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        let mut metadata = HashMap::new();
        metadata.insert("filename".to_string(), "laporan.pdf".to_string());
        metadata.insert("user_id".to_string(), "9".to_string());
        manager.initiate_upload("u1", 4, metadata).await.unwrap();
        manager.add_to_queue("u1");

        manager.handle_chunk("u1", 0, Cursor::new(b"ab".to_vec())).await.unwrap();
        assert!(matches!(
            manager.finalize_to_destination("u1").await,
            Err(UploadError::Conflict(_))
        ));

        manager.handle_chunk("u1", 2, Cursor::new(b"cd".to_vec())).await.unwrap();
        let path = manager.finalize_to_destination("u1").await.unwrap();

        assert_eq!(
            path,
            temp_dir.path().join("final/project/9/u1/laporan.pdf")
        );
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcd");
        assert!(!manager.is_active_upload("u1"));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);
        manager.initiate_upload("u1", 10, HashMap::new()).await.unwrap();
        manager.add_to_queue("u1");

        assert_eq!(manager.cancel_upload("u1").await.unwrap(), Removal::Deleted);
        assert!(!manager.is_active_upload("u1"));
        assert_eq!(manager.cancel_upload("u1").await.unwrap(), Removal::AlreadyAbsent);
        assert_eq!(manager.cancel_upload("nope").await.unwrap(), Removal::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_reset_upload_queue_terminates_uploads() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        for id in ["a", "b"] {
            manager.initiate_upload(id, 10, HashMap::new()).await.unwrap();
            manager.add_to_queue(id);
        }
        assert_eq!(manager.queue_position("b"), 1);

        let report = manager.reset_upload_queue().await;
        assert_eq!(
            report,
            QueueReset {
                queued: 2,
                terminated: 2,
                failed: 0
            }
        );
        assert!(manager.can_accept_upload());
        assert!(matches!(manager.get_upload_info("a").await, Err(UploadError::NotFound(_))));
        assert!(matches!(manager.get_upload_info("b").await, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_reset_upload_queue_continues_after_failure() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        // Rejected by the store's ID validation
        manager.add_to_queue("bad/id");
        manager.initiate_upload("b", 10, HashMap::new()).await.unwrap();
        manager.add_to_queue("b");

        let report = manager.reset_upload_queue().await;
        assert_eq!(report.queued, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.terminated, 1);
        assert!(manager.can_accept_upload());
        assert_eq!(manager.queue_position("b"), crate::upload::NOT_QUEUED);
        assert!(matches!(manager.get_upload_info("b").await, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_check_upload_slot() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        let slot = manager.check_upload_slot();
        assert!(slot.available);
        assert!(!slot.active_upload);
        assert_eq!(slot.max_concurrent, 1);

        manager.add_to_queue("a");
        manager.add_to_queue("b");
        let slot = manager.check_upload_slot();
        assert!(!slot.available);
        assert!(slot.active_upload);
        assert_eq!(slot.queue_length, 1);
        assert!(slot.message.contains("antrian"));
    }

    #[tokio::test]
    async fn test_upload_status() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);
        manager.initiate_upload("u1", 20, HashMap::new()).await.unwrap();
        manager.handle_chunk("u1", 0, Cursor::new(vec![0u8; 10])).await.unwrap();

        let status = manager.get_upload_status("u1").await.unwrap();
        assert_eq!(status.offset, 10);
        assert_eq!(status.progress, 50.0);
        assert!(!status.complete);
        assert_eq!(status.queue_position, -1);
    }

    #[tokio::test]
    async fn test_validate_metadata_by_category() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir, 1);

        let mut metadata = HashMap::new();
        metadata.insert("nama_project".to_string(), "Aplikasi Kasir".to_string());
        metadata.insert("semester".to_string(), "4".to_string());
        manager.validate_metadata(&mut metadata).unwrap();
        assert_eq!(metadata["kategori"], "website");

        assert_eq!(manager.default_tus_headers()["Tus-Resumable"], "1.0.0");
    }
}
