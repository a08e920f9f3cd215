//! Chunk Store
//!
//! Local-disk storage for in-flight uploads. Each upload owns a directory
//! under the base path:
//!
//! ```text
//! <base>/<upload_id>/data.bin   bytes received so far
//! <base>/<upload_id>/info.json  serialized UploadRecord
//! ```
//!
//! Writes for the same upload are serialized by a per-upload lock. Bytes are
//! flushed to `data.bin` before the offset in `info.json` is advanced, so a
//! crash never reports more bytes than were persisted.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use super::types::{Removal, UploadError, UploadRecord};

const DATA_FILE: &str = "data.bin";
const INFO_FILE: &str = "info.json";

// ============================================================================
// Chunk Store
// ============================================================================

/// Per-upload byte storage with offset, size and metadata bookkeeping
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    base_path: PathBuf,

    /// Largest accepted `Upload-Length`
    max_size: i64,

    /// Upload ID -> record, each behind its own write lock
    uploads: RwLock<HashMap<String, Arc<Mutex<UploadRecord>>>>,
}

impl ChunkStore {
    /// Create an empty store. Directories are created lazily.
    pub fn new(base_path: impl Into<PathBuf>, max_size: i64) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                base_path: base_path.into(),
                max_size,
                uploads: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Open a store, reloading every upload left on disk by a previous process
    pub async fn open(base_path: impl Into<PathBuf>, max_size: i64) -> Result<Self, UploadError> {
        let store = Self::new(base_path, max_size);
        tokio::fs::create_dir_all(&store.inner.base_path).await?;

        let mut loaded = HashMap::new();
        let mut entries = tokio::fs::read_dir(&store.inner.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let dir = entry.path();
            match load_record(&dir).await {
                Ok(record) => {
                    loaded.insert(record.id.clone(), Arc::new(Mutex::new(record)));
                }
                Err(e) => {
                    tracing::warn!(
                        path = %dir.display(),
                        error = %e,
                        "Skipping unreadable upload directory"
                    );
                }
            }
        }

        let count = loaded.len();
        *store.inner.uploads.write().await = loaded;

        tracing::info!(
            base_path = %store.inner.base_path.display(),
            uploads = count,
            "Chunk store opened"
        );

        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn max_size(&self) -> i64 {
        self.inner.max_size
    }

    /// Path of the backing file for an upload
    pub fn data_path(&self, id: &str) -> PathBuf {
        self.upload_dir(id).join(DATA_FILE)
    }

    fn upload_dir(&self, id: &str) -> PathBuf {
        self.inner.base_path.join(id)
    }

    fn info_path(&self, id: &str) -> PathBuf {
        self.upload_dir(id).join(INFO_FILE)
    }

    async fn entry(&self, id: &str) -> Result<Arc<Mutex<UploadRecord>>, UploadError> {
        let uploads = self.inner.uploads.read().await;
        uploads
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a zero-length backing file and a record at offset 0
    pub async fn initiate_upload(&self, id: &str, size: i64) -> Result<UploadRecord, UploadError> {
        validate_upload_id(id)?;

        if size <= 0 {
            return Err(UploadError::Validation(format!(
                "ukuran file tidak valid: {}",
                size
            )));
        }
        if size > self.inner.max_size {
            return Err(UploadError::PayloadTooLarge(format!(
                "ukuran file melebihi batas maksimal ({} > {} bytes)",
                size, self.inner.max_size
            )));
        }

        let mut uploads = self.inner.uploads.write().await;
        if uploads.contains_key(id) {
            return Err(UploadError::Conflict(format!("upload sudah ada: {}", id)));
        }

        let record = UploadRecord::new(id, size);

        tokio::fs::create_dir_all(self.upload_dir(id)).await?;
        tokio::fs::File::create(self.data_path(id)).await?;
        write_record(&self.info_path(id), &record).await?;

        uploads.insert(id.to_string(), Arc::new(Mutex::new(record.clone())));

        tracing::info!(upload_id = %id, size = size, "Created upload");

        Ok(record)
    }

    /// Append everything read from `reader` and return the new offset.
    ///
    /// `offset` must equal the stored offset; a writer that lost the race to
    /// another request for the same upload is rejected with a conflict. A chunk
    /// that would run past the declared size is rolled back.
    pub async fn write_chunk<R>(&self, id: &str, offset: i64, reader: R) -> Result<i64, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let entry = self.entry(id).await?;
        let mut record = entry.lock().await;

        if record.offset != offset {
            return Err(UploadError::Conflict(format!(
                "offset tidak cocok: server {}, client {}",
                record.offset, offset
            )));
        }

        let start = record.offset;
        let remaining = (record.size - start) as u64;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.data_path(id))
            .await?;

        // Drop any bytes a crashed request wrote past the recorded offset
        file.set_len(start as u64).await?;
        file.seek(SeekFrom::Start(start as u64)).await?;

        let mut limited = reader.take(remaining + 1);
        let written = tokio::io::copy(&mut limited, &mut file).await?;

        if written > remaining {
            file.set_len(start as u64).await?;
            return Err(UploadError::PayloadTooLarge(format!(
                "chunk melebihi ukuran upload ({} bytes tersisa)",
                remaining
            )));
        }

        if written == 0 {
            return Ok(start);
        }

        file.flush().await?;
        file.sync_data().await?;

        let mut updated = record.clone();
        updated.offset = start + written as i64;
        updated.updated_at = Utc::now();
        write_record(&self.info_path(id), &updated).await?;
        *record = updated;

        tracing::debug!(
            upload_id = %id,
            offset = record.offset,
            size = record.size,
            written = written,
            "Chunk written"
        );

        Ok(record.offset)
    }

    /// Merge key/value pairs into the upload's metadata
    pub async fn update_metadata(
        &self,
        id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), UploadError> {
        let entry = self.entry(id).await?;
        let mut record = entry.lock().await;

        let mut updated = record.clone();
        updated.metadata.extend(metadata);
        updated.updated_at = Utc::now();
        write_record(&self.info_path(id), &updated).await?;
        *record = updated;

        Ok(())
    }

    /// Delete the upload's artifacts and record. Unknown IDs are not an error.
    pub async fn terminate(&self, id: &str) -> Result<Removal, UploadError> {
        validate_upload_id(id)?;

        let entry = self.inner.uploads.write().await.remove(id);

        // Wait for an in-flight write on this upload to finish
        let _guard = match &entry {
            Some(entry) => Some(entry.lock().await),
            None => None,
        };

        let dir_removed = match tokio::fs::remove_dir_all(self.upload_dir(id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if entry.is_some() || dir_removed {
            tracing::info!(upload_id = %id, "Upload terminated");
            Ok(Removal::Deleted)
        } else {
            Ok(Removal::AlreadyAbsent)
        }
    }

    /// Move the backing file to `dest`, creating parent directories.
    ///
    /// No completeness check happens here; callers decide whether a partial
    /// upload may be finalized.
    pub async fn finalize_upload(&self, id: &str, dest: &Path) -> Result<PathBuf, UploadError> {
        let entry = self.entry(id).await?;
        let record = entry.lock().await;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source = self.data_path(id);
        if let Err(e) = tokio::fs::rename(&source, dest).await {
            // Rename fails across filesystems
            tracing::debug!(upload_id = %id, error = %e, "Rename failed, copying instead");
            tokio::fs::copy(&source, dest).await?;
            tokio::fs::remove_file(&source).await?;
        }

        self.inner.uploads.write().await.remove(id);
        if let Err(e) = tokio::fs::remove_dir_all(self.upload_dir(id)).await {
            tracing::warn!(upload_id = %id, error = %e, "Failed to remove upload directory");
        }

        tracing::info!(
            upload_id = %id,
            offset = record.offset,
            size = record.size,
            destination = %dest.display(),
            "Upload finalized"
        );

        Ok(dest.to_path_buf())
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    pub async fn get_info(&self, id: &str) -> Result<UploadRecord, UploadError> {
        let entry = self.entry(id).await?;
        let record = entry.lock().await;
        Ok(record.clone())
    }

    pub async fn get_offset(&self, id: &str) -> Result<i64, UploadError> {
        Ok(self.get_info(id).await?.offset)
    }

    pub async fn is_complete(&self, id: &str) -> Result<bool, UploadError> {
        Ok(self.get_info(id).await?.is_complete())
    }

    pub async fn get_progress(&self, id: &str) -> Result<f64, UploadError> {
        Ok(self.get_info(id).await?.progress())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.uploads.read().await.contains_key(id)
    }

    pub async fn upload_ids(&self) -> Vec<String> {
        self.inner.uploads.read().await.keys().cloned().collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Reject IDs that could escape the base directory
fn validate_upload_id(id: &str) -> Result<(), UploadError> {
    let invalid = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(&['/', '\\', '\0'][..]);

    if invalid {
        return Err(UploadError::Validation(format!("upload id tidak valid: {:?}", id)));
    }
    Ok(())
}

/// Write the record next to the data file, replacing the old one atomically
async fn write_record(path: &Path, record: &UploadRecord) -> Result<(), UploadError> {
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| UploadError::Storage(std::io::Error::other(e)))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_record(dir: &Path) -> Result<UploadRecord, UploadError> {
    let bytes = tokio::fs::read(dir.join(INFO_FILE)).await?;
    let mut record: UploadRecord = serde_json::from_slice(&bytes)
        .map_err(|e| UploadError::Storage(std::io::Error::other(e)))?;

    let persisted = tokio::fs::metadata(dir.join(DATA_FILE)).await?.len() as i64;
    if persisted < record.offset {
        tracing::warn!(
            upload_id = %record.id,
            recorded = record.offset,
            persisted = persisted,
            "Recorded offset ahead of data file, clamping"
        );
        record.offset = persisted;
    }

    Ok(record)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const MAX: i64 = 1024;

    fn store(temp_dir: &TempDir) -> ChunkStore {
        ChunkStore::new(temp_dir.path().join("uploads"), MAX)
    }

    #[tokio::test]
    async fn test_initiate_rejects_invalid_sizes() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        for size in [0, -1] {
            let err = store.initiate_upload("u1", size).await.unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)));
            assert!(err.to_string().contains("ukuran file tidak valid"));
        }

        let err = store.initiate_upload("u1", MAX + 1).await.unwrap_err();
        assert!(matches!(err, UploadError::PayloadTooLarge(_)));
        assert!(err.to_string().contains("melebihi batas maksimal"));

        let record = store.initiate_upload("u1", MAX).await.unwrap();
        assert_eq!(record.offset, 0);
        assert_eq!(record.size, MAX);
        assert!(store.data_path("u1").exists());
    }

    #[tokio::test]
    async fn test_initiate_rejects_path_like_ids() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        for id in ["", "..", "../escape", "a/b"] {
            assert!(matches!(
                store.initiate_upload(id, 10).await,
                Err(UploadError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_sequential_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 20).await.unwrap();

        let offset = store.write_chunk("u1", 0, Cursor::new(b"0123456789".to_vec())).await.unwrap();
        assert_eq!(offset, 10);
        assert_eq!(store.get_progress("u1").await.unwrap(), 50.0);
        assert!(!store.is_complete("u1").await.unwrap());

        let offset = store
            .write_chunk("u1", 10, Cursor::new(b"abcdefghij".to_vec()))
            .await
            .unwrap();
        assert_eq!(offset, 20);
        assert!(store.is_complete("u1").await.unwrap());

        let data = tokio::fs::read(store.data_path("u1")).await.unwrap();
        assert_eq!(data, b"0123456789abcdefghij");
    }

    #[tokio::test]
    async fn test_zero_length_chunk_keeps_offset() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 20).await.unwrap();

        let offset = store.write_chunk("u1", 0, Cursor::new(Vec::new())).await.unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_write_unknown_upload() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);

        let result = store.write_chunk("missing", 0, Cursor::new(b"data".to_vec())).await;
        assert!(matches!(result, Err(UploadError::NotFound(_))));
        assert!(matches!(store.get_offset("missing").await, Err(UploadError::NotFound(_))));
        assert!(matches!(store.get_progress("missing").await, Err(UploadError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stale_offset_rejected_without_writing() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 20).await.unwrap();
        store.write_chunk("u1", 0, Cursor::new(b"01234".to_vec())).await.unwrap();

        let result = store.write_chunk("u1", 0, Cursor::new(b"xxxxx".to_vec())).await;
        assert!(matches!(result, Err(UploadError::Conflict(_))));

        let data = tokio::fs::read(store.data_path("u1")).await.unwrap();
        assert_eq!(data, b"01234");
    }

    #[tokio::test]
    async fn test_oversized_chunk_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 4).await.unwrap();

        let result = store.write_chunk("u1", 0, Cursor::new(b"too long".to_vec())).await;
        assert!(matches!(result, Err(UploadError::PayloadTooLarge(_))));
        assert_eq!(store.get_offset("u1").await.unwrap(), 0);

        let data = tokio::fs::read(store.data_path("u1")).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_same_offset() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 10).await.unwrap();

        let a = store.clone();
        let b = store.clone();
        let (ra, rb) = tokio::join!(
            a.write_chunk("u1", 0, Cursor::new(b"aaaaa".to_vec())),
            b.write_chunk("u1", 0, Cursor::new(b"bbbbb".to_vec())),
        );

        // Exactly one writer wins
        assert_eq!(ra.is_ok() as u8 + rb.is_ok() as u8, 1);
        assert_eq!(store.get_offset("u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_update_metadata_merges() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 10).await.unwrap();

        let mut first = HashMap::new();
        first.insert("filename".to_string(), "a.zip".to_string());
        first.insert("user_id".to_string(), "7".to_string());
        store.update_metadata("u1", first).await.unwrap();

        let mut second = HashMap::new();
        second.insert("filename".to_string(), "b.zip".to_string());
        store.update_metadata("u1", second).await.unwrap();

        let info = store.get_info("u1").await.unwrap();
        assert_eq!(info.metadata["filename"], "b.zip");
        assert_eq!(info.metadata["user_id"], "7");
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 10).await.unwrap();

        assert_eq!(store.terminate("u1").await.unwrap(), Removal::Deleted);
        assert!(!store.data_path("u1").exists());
        assert_eq!(store.terminate("u1").await.unwrap(), Removal::AlreadyAbsent);
        assert_eq!(store.terminate("never-existed").await.unwrap(), Removal::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_end_to_end_finalize() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 20).await.unwrap();

        store
            .write_chunk("u1", 0, Cursor::new(b"test chunk content!!".to_vec()))
            .await
            .unwrap();
        assert!(store.is_complete("u1").await.unwrap());

        let dest = temp_dir.path().join("final").join("nested").join("file.zip");
        let path = store.finalize_upload("u1", &dest).await.unwrap();

        assert_eq!(path, dest);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"test chunk content!!");
        assert!(!store.contains("u1").await);
    }

    #[tokio::test]
    async fn test_finalize_does_not_require_completion() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.initiate_upload("u1", 20).await.unwrap();
        store.write_chunk("u1", 0, Cursor::new(b"partial".to_vec())).await.unwrap();

        let dest = temp_dir.path().join("final").join("partial.bin");
        store.finalize_upload("u1", &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"partial");
    }

    #[tokio::test]
    async fn test_open_reloads_uploads() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("uploads");

        {
            let store = ChunkStore::new(&base, MAX);
            store.initiate_upload("u1", 20).await.unwrap();
            store.write_chunk("u1", 0, Cursor::new(b"0123456789".to_vec())).await.unwrap();
        }

        let reopened = ChunkStore::open(&base, MAX).await.unwrap();
        assert_eq!(reopened.get_offset("u1").await.unwrap(), 10);

        let offset = reopened
            .write_chunk("u1", 10, Cursor::new(b"abcdefghij".to_vec()))
            .await
            .unwrap();
        assert_eq!(offset, 20);
    }

    #[tokio::test]
    async fn test_open_clamps_offset_to_persisted_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("uploads");

        {
            let store = ChunkStore::new(&base, MAX);
            store.initiate_upload("u1", 20).await.unwrap();
            store.write_chunk("u1", 0, Cursor::new(b"0123456789".to_vec())).await.unwrap();
        }

        // Simulate a lost tail of the data file
        let data = base.join("u1").join(DATA_FILE);
        let file = tokio::fs::OpenOptions::new().write(true).open(&data).await.unwrap();
        file.set_len(4).await.unwrap();

        let reopened = ChunkStore::open(&base, MAX).await.unwrap();
        assert_eq!(reopened.get_offset("u1").await.unwrap(), 4);
    }
}
