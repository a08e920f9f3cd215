//! TUS Routes
//!
//! HTTP endpoints for the TUS 1.0 resumable upload protocol, one router per
//! upload category.
//!
//! Endpoints (relative to `/api/v1/uploads/{category}`):
//! - OPTIONS / - Advertise protocol version, extensions and size limit
//! - GET /slot - Report admission availability
//! - POST / - Create an upload
//! - HEAD /:id - Current offset and length
//! - GET /:id - Upload info as JSON
//! - PATCH /:id - Append a chunk at the current offset
//! - DELETE /:id - Terminate an upload

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, OriginalUri, Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, head, options},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::state::AppState;
use crate::upload::{
    encode_metadata, PersistedStatus, PersistedUpload, UploadCategory, UploadError,
    UploadManager, TUS_EXTENSIONS, TUS_RESUMABLE,
};

const TUS_RESUMABLE_HEADER: &str = "tus-resumable";
const TUS_VERSION_HEADER: &str = "tus-version";
const TUS_EXTENSION_HEADER: &str = "tus-extension";
const TUS_MAX_SIZE_HEADER: &str = "tus-max-size";
const UPLOAD_OFFSET: &str = "upload-offset";
const UPLOAD_LENGTH: &str = "upload-length";
const UPLOAD_METADATA: &str = "upload-metadata";
const X_QUEUE_POSITION: &str = "x-queue-position";

// ============================================================================
// State
// ============================================================================

/// Per-category route state
#[derive(Clone)]
pub struct TusState {
    pub app: AppState,
    pub category: UploadCategory,
}

impl TusState {
    fn manager(&self) -> &UploadManager {
        self.app.manager(self.category)
    }
}

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, [(TUS_RESUMABLE_HEADER, TUS_RESUMABLE)], body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the TUS router for one upload category
pub fn router(app: AppState, category: UploadCategory) -> Router<AppState> {
    let body_limit = usize::try_from(app.manager(category).max_size()).unwrap_or(usize::MAX);
    let state = TusState { app, category };

    Router::new()
        .route("/", options(tus_options).post(create_upload))
        .route("/slot", get(check_slot))
        .route(
            "/:id",
            head(upload_offset)
                .get(upload_info)
                .patch(upload_chunk)
                .delete(terminate_upload),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// OPTIONS /
async fn tus_options(State(state): State<TusState>) -> Response {
    let manager = state.manager();
    let mut headers = tus_headers(manager);
    insert_str(&mut headers, TUS_VERSION_HEADER, manager.tus_version());
    headers.insert(TUS_EXTENSION_HEADER, HeaderValue::from_static(TUS_EXTENSIONS));
    headers.insert(TUS_MAX_SIZE_HEADER, HeaderValue::from(manager.max_size()));

    (StatusCode::NO_CONTENT, headers).into_response()
}

/// GET /slot
async fn check_slot(State(state): State<TusState>) -> impl IntoResponse {
    Json(state.manager().check_upload_slot())
}

/// POST /
///
/// Create an upload from `Upload-Length` and `Upload-Metadata`. The upload
/// is admitted if a slot is free, otherwise it waits in the queue.
async fn create_upload(
    State(state): State<TusState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    let manager = state.manager();
    check_version(manager, &headers)?;

    let size = header_str(&headers, UPLOAD_LENGTH)
        .and_then(|raw| raw.parse::<i64>().ok())
        .ok_or_else(|| {
            UploadError::Validation("ukuran file tidak valid: Upload-Length wajib diisi".into())
        })?;

    let mut metadata = match header_str(&headers, UPLOAD_METADATA) {
        Some(raw) => UploadManager::parse_metadata(raw)?,
        None => HashMap::new(),
    };
    manager.validate_metadata(&mut metadata)?;

    let user_id = UploadManager::extract_user_id(&metadata)?;
    let owner_id = i64::try_from(user_id)
        .map_err(|_| UploadError::Validation(format!("user_id tidak valid: {}", user_id)))?;

    let id = Uuid::new_v4().to_string();
    manager.initiate_upload(&id, size, metadata).await?;

    let record = PersistedUpload::pending(&id, manager.category(), Some(owner_id), size);
    if let Err(e) = state.app.repository().create(&record).await {
        if let Err(cleanup) = manager.cancel_upload(&id).await {
            tracing::warn!(upload_id = %id, error = %cleanup, "Failed to roll back upload");
        }
        return Err(e);
    }

    manager.add_to_queue(&id);
    let position = manager.queue_position(&id);

    tracing::info!(
        upload_id = %id,
        category = %manager.category(),
        size = size,
        owner_id = owner_id,
        queue_position = position,
        "Upload created"
    );

    let mut response = tus_headers(manager);
    let location = format!("{}/{}", uri.path().trim_end_matches('/'), id);
    insert_str(&mut response, header::LOCATION.as_str(), &location);
    response.insert(UPLOAD_OFFSET, HeaderValue::from(0i64));
    if position > 0 {
        response.insert(X_QUEUE_POSITION, HeaderValue::from(position));
    }

    Ok((StatusCode::CREATED, response).into_response())
}

/// HEAD /:id
async fn upload_offset(
    State(state): State<TusState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    let manager = state.manager();
    check_version(manager, &headers)?;

    let info = manager.get_upload_info(&id).await?;

    let mut response = tus_headers(manager);
    response.insert(UPLOAD_OFFSET, HeaderValue::from(info.offset));
    response.insert(UPLOAD_LENGTH, HeaderValue::from(info.size));
    response.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if !info.metadata.is_empty() {
        insert_str(&mut response, UPLOAD_METADATA, &encode_metadata(&info.metadata));
    }

    Ok((StatusCode::OK, response).into_response())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadInfoResponse {
    id: String,
    category: UploadCategory,
    offset: i64,
    size: i64,
    progress: f64,
    complete: bool,
    queue_position: i64,
    metadata: HashMap<String, String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// GET /:id
async fn upload_info(
    State(state): State<TusState>,
    Path(id): Path<String>,
) -> Result<Json<UploadInfoResponse>, UploadError> {
    let manager = state.manager();
    let info = manager.get_upload_info(&id).await?;

    Ok(Json(UploadInfoResponse {
        progress: info.progress(),
        complete: info.is_complete(),
        queue_position: manager.queue_position(&id),
        category: manager.category(),
        id: info.id,
        offset: info.offset,
        size: info.size,
        metadata: info.metadata,
        created_at: info.created_at,
        updated_at: info.updated_at,
    }))
}

/// PATCH /:id
///
/// Append one chunk. Only active uploads may write; the declared offset must
/// match the stored one. The last chunk moves the file to its destination.
async fn upload_chunk(
    State(state): State<TusState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, UploadError> {
    let manager = state.manager();
    check_version(manager, &headers)?;
    manager.validate_content_type(header_str(&headers, "content-type").unwrap_or_default())?;

    let info = manager.get_upload_info(&id).await?;

    if !manager.is_active_upload(&id) {
        let position = manager.queue_position(&id);
        return Err(UploadError::Locked(if position > 0 {
            format!("upload masih dalam antrian (posisi {})", position)
        } else {
            format!("upload tidak aktif: {}", id)
        }));
    }

    // Every byte is stored but relocation failed earlier: retry it
    if info.is_complete() {
        complete_upload(&state, &id).await?;
        return Ok(offset_response(manager, info.size));
    }

    let offset = header_str(&headers, UPLOAD_OFFSET)
        .and_then(|raw| raw.parse::<i64>().ok())
        .filter(|offset| *offset >= 0)
        .ok_or_else(|| {
            UploadError::Validation("offset tidak valid: Upload-Offset wajib diisi".into())
        })?;
    manager.validate_offset(&id, offset).await?;

    let expected = match header_str(&headers, "content-length") {
        Some(raw) => raw.parse::<i64>().map_err(|_| {
            UploadError::Validation(format!("Content-Length tidak valid: {}", raw))
        })?,
        None => body.len() as i64,
    };
    let reader = UploadManager::read_chunk_from_body(body, expected)?;

    let new_offset = manager.handle_chunk(&id, offset, reader).await?;
    record_status(&state, &id, PersistedStatus::Uploading).await;
    tracing::debug!(upload_id = %id, offset = new_offset, size = info.size, "Chunk stored");

    if new_offset >= info.size {
        complete_upload(&state, &id).await?;
    }

    Ok(offset_response(manager, new_offset))
}

/// Move a fully received upload to its destination and mark it completed
async fn complete_upload(state: &TusState, id: &str) -> Result<(), UploadError> {
    let manager = state.manager();
    let path = manager.finalize_to_destination(id).await?;
    record_status(state, id, PersistedStatus::Completed).await;

    tracing::info!(
        upload_id = %id,
        category = %manager.category(),
        path = %path.display(),
        "Upload completed"
    );
    Ok(())
}

fn offset_response(manager: &UploadManager, offset: i64) -> Response {
    let mut response = tus_headers(manager);
    response.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
    (StatusCode::NO_CONTENT, response).into_response()
}

/// DELETE /:id
///
/// Idempotent: terminating an unknown upload succeeds.
async fn terminate_upload(
    State(state): State<TusState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, UploadError> {
    let manager = state.manager();
    check_version(manager, &headers)?;

    let repository = state.app.repository();
    if let Some(record) = repository.get(&id).await? {
        if record.category != manager.category() {
            return Err(UploadError::NotFound(id));
        }
    }

    let files = manager.cancel_upload(&id).await?;
    let record = repository.delete(&id).await?;

    tracing::info!(
        upload_id = %id,
        files_deleted = files.was_deleted(),
        record_deleted = record.was_deleted(),
        "Upload terminated"
    );

    Ok((StatusCode::NO_CONTENT, tus_headers(manager)).into_response())
}

// ============================================================================
// Helpers
// ============================================================================

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

fn check_version(manager: &UploadManager, headers: &HeaderMap) -> Result<(), UploadError> {
    manager.validate_tus_version(header_str(headers, TUS_RESUMABLE_HEADER).unwrap_or_default())
}

fn tus_headers(manager: &UploadManager) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in manager.default_tus_headers() {
        insert_str(&mut headers, &name, &value);
    }
    headers
}

fn insert_str(headers: &mut HeaderMap, name: &str, value: &str) {
    match (HeaderName::try_from(name), HeaderValue::from_str(value)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(header = name, "Skipping header with invalid value"),
    }
}

/// Durable status is best effort once the bytes are safely stored
async fn record_status(state: &TusState, id: &str, status: PersistedStatus) {
    if let Err(e) = state.app.repository().update_status(id, status).await {
        tracing::warn!(
            upload_id = %id,
            status = %status,
            error = %e,
            "Failed to update upload status"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
