//! Final destination resolution for completed uploads

use std::collections::HashMap;
use std::path::PathBuf;

use super::types::{UploadCategory, UploadError};

/// Resolves where a finished upload is moved to
pub trait FileRelocator: Send + Sync {
    fn destination(
        &self,
        category: UploadCategory,
        upload_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PathBuf, UploadError>;
}

/// Lays files out as `<root>/<category>/<user_id>/<upload_id>/<filename>`
#[derive(Debug, Clone)]
pub struct DirectoryRelocator {
    root: PathBuf,
}

impl DirectoryRelocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileRelocator for DirectoryRelocator {
    fn destination(
        &self,
        category: UploadCategory,
        upload_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<PathBuf, UploadError> {
        let owner = metadata
            .get("user_id")
            .map(|id| sanitize_component(id))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "anonymous".to_string());

        let file_name = metadata
            .get("filename")
            .map(|name| sanitize_component(name))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("{}.bin", upload_id));

        let upload_dir = sanitize_component(upload_id);
        if upload_dir.is_empty() {
            return Err(UploadError::Validation(format!(
                "upload id tidak valid: {:?}",
                upload_id
            )));
        }

        Ok(self
            .root
            .join(category.as_str())
            .join(owner)
            .join(upload_dir)
            .join(file_name))
    }
}

/// Keep only the last path segment and replace characters unsafe in file names
fn sanitize_component(raw: &str) -> String {
    let last = raw.rsplit(&['/', '\\'][..]).next().unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    trimmed.to_string()
}
