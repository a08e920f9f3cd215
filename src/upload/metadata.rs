//! Upload-Metadata handling
//!
//! The header is a comma-separated list of `key base64(value)` pairs.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::types::UploadError;

/// Project categories accepted in the `kategori` field
pub const PROJECT_CATEGORIES: [&str; 5] =
    ["website", "mobile", "iot", "machine_learning", "deep_learning"];

/// Category assigned when a project upload carries none
pub const DEFAULT_PROJECT_CATEGORY: &str = "website";

/// Module types accepted in the `tipe` field
pub const MODUL_TYPES: [&str; 5] = ["pdf", "docx", "pptx", "video", "zip"];

const MIN_NAME_LEN: usize = 3;
const MAX_NAME_LEN: usize = 255;
const SEMESTER_RANGE: std::ops::RangeInclusive<u8> = 1..=8;

/// Decode an `Upload-Metadata` header value.
///
/// Segments without a value are skipped. A value that is not valid base64 or
/// not valid UTF-8 is an error.
pub fn parse_metadata(raw: &str) -> Result<HashMap<String, String>, UploadError> {
    let mut metadata = HashMap::new();

    for segment in raw.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let parts: Vec<&str> = segment.split(' ').collect();
        if parts.len() != 2 {
            continue;
        }

        let (key, encoded) = (parts[0], parts[1]);
        let bytes = STANDARD.decode(encoded).map_err(|e| {
            UploadError::Validation(format!("error decoding metadata {}: {}", key, e))
        })?;
        let value = String::from_utf8(bytes).map_err(|e| {
            UploadError::Validation(format!("error decoding metadata {}: {}", key, e))
        })?;

        metadata.insert(key.to_string(), value);
    }

    Ok(metadata)
}

/// Encode metadata into `Upload-Metadata` form, keys sorted
pub fn encode_metadata(metadata: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();

    keys.into_iter()
        .map(|key| format!("{} {}", key, STANDARD.encode(&metadata[key])))
        .collect::<Vec<_>>()
        .join(",")
}

/// Read the uploader's numeric ID from the `user_id` field
pub fn extract_user_id(metadata: &HashMap<String, String>) -> Result<u64, UploadError> {
    let raw = metadata
        .get("user_id")
        .ok_or_else(|| UploadError::Validation("user_id tidak ditemukan dalam metadata".into()))?;

    raw.trim()
        .parse::<u64>()
        .map_err(|_| UploadError::Validation(format!("user_id tidak valid: {}", raw)))
}

/// Validate project upload metadata, defaulting `kategori` when absent
pub fn validate_project_metadata(
    metadata: &mut HashMap<String, String>,
) -> Result<(), UploadError> {
    validate_name(metadata, "nama_project")?;

    let kategori = metadata
        .entry("kategori".to_string())
        .or_insert_with(|| DEFAULT_PROJECT_CATEGORY.to_string());
    if !PROJECT_CATEGORIES.contains(&kategori.as_str()) {
        return Err(UploadError::Validation(format!(
            "kategori tidak valid: {} (pilihan: {})",
            kategori,
            PROJECT_CATEGORIES.join(", ")
        )));
    }

    validate_semester(metadata)
}

/// Validate module upload metadata
pub fn validate_modul_metadata(metadata: &mut HashMap<String, String>) -> Result<(), UploadError> {
    validate_name(metadata, "nama_modul")?;

    let tipe = metadata
        .get("tipe")
        .ok_or_else(|| UploadError::Validation("tipe wajib diisi".into()))?;
    if !MODUL_TYPES.contains(&tipe.as_str()) {
        return Err(UploadError::Validation(format!(
            "tipe modul tidak valid: {} (pilihan: {})",
            tipe,
            MODUL_TYPES.join(", ")
        )));
    }

    validate_semester(metadata)
}

fn validate_name(metadata: &HashMap<String, String>, field: &str) -> Result<(), UploadError> {
    let value = metadata
        .get(field)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| UploadError::Validation(format!("{} wajib diisi", field)))?;

    let len = value.chars().count();
    if !(MIN_NAME_LEN..=MAX_NAME_LEN).contains(&len) {
        return Err(UploadError::Validation(format!(
            "{} harus {}-{} karakter",
            field, MIN_NAME_LEN, MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_semester(metadata: &HashMap<String, String>) -> Result<(), UploadError> {
    let raw = metadata
        .get("semester")
        .ok_or_else(|| UploadError::Validation("semester wajib diisi".into()))?;

    let semester = raw
        .trim()
        .parse::<u8>()
        .map_err(|_| UploadError::Validation(format!("semester tidak valid: {}", raw)))?;

    if !SEMESTER_RANGE.contains(&semester) {
        return Err(UploadError::Validation(format!(
            "semester harus antara {} dan {}",
            SEMESTER_RANGE.start(),
            SEMESTER_RANGE.end()
        )));
    }
    Ok(())
}
