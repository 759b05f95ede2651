//! HTTP handlers for upload sessions. Thin: parse, delegate to the
//! `UploadSessionManager`, serialize.

use crate::{
    errors::AppError,
    models::{
        chunk_status::ChunkStatus, media_file::{MediaFile, MediaStatus}, upload_session::UploadProgress,
    },
    services::{
        blob_gateway::PresignedPart,
        upload_sessions::{CompletedUpload, OpenSessionRequest, OpenedSession},
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct PartUploadedReq {
    pub etag: String,
}

#[derive(Debug, Deserialize)]
pub struct PartFailedReq {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct DuplicateHint {
    pub duplicate: Option<MediaFile>,
}

#[derive(Debug, Serialize)]
pub struct UploadStatus {
    pub upload_id: String,
    pub status: MediaStatus,
}

/// `POST /uploads`
pub async fn open_upload(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<OpenedSession>), AppError> {
    let opened = state.sessions.open_session(req).await?;
    Ok((StatusCode::CREATED, Json(opened)))
}

/// `PUT /uploads/{id}/parts/{n}` with `{"etag": "..."}`
pub async fn record_part(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, i32)>,
    Json(req): Json<PartUploadedReq>,
) -> Result<Json<ChunkStatus>, AppError> {
    let status = state
        .sessions
        .record_part_uploaded(&upload_id, part_number, &req.etag)
        .await?;
    Ok(Json(status))
}

/// `POST /uploads/{id}/parts/{n}/failure`
pub async fn record_part_failure(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, i32)>,
    Json(req): Json<PartFailedReq>,
) -> Result<Json<ChunkStatus>, AppError> {
    let status = state
        .sessions
        .record_part_failed(&upload_id, part_number, &req.error)
        .await?;
    Ok(Json(status))
}

/// `POST /uploads/{id}/parts/{n}/retry`
pub async fn retry_part(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, i32)>,
) -> Result<Json<PresignedPart>, AppError> {
    Ok(Json(state.sessions.retry_part(&upload_id, part_number).await?))
}

/// `GET /uploads/{id}`
pub async fn upload_progress(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadProgress>, AppError> {
    Ok(Json(state.sessions.progress(&upload_id).await?))
}

/// `GET /uploads/{id}/duplicate`
pub async fn duplicate_hint(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<DuplicateHint>, AppError> {
    let duplicate = state.sessions.duplicate_hint(&upload_id).await?;
    Ok(Json(DuplicateHint { duplicate }))
}

/// `GET /uploads/{id}/status`
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatus>, AppError> {
    let status = state.state_machine.status_for_upload(&upload_id).await?;
    Ok(Json(UploadStatus { upload_id, status }))
}

/// `POST /uploads/{id}/complete`
///
/// Validation of a newly stored asset runs in the background; duplicates skip it.
pub async fn complete_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<Json<CompletedUpload>, AppError> {
    let done = state.sessions.complete_session(&upload_id).await?;

    if !done.deduplicated && done.media.status == MediaStatus::Uploaded {
        let validation = state.validation.clone();
        let media_id = done.media.id;
        tokio::spawn(async move {
            // the periodic recovery sweep picks it up if this fails
            if let Err(err) = validation.validate(media_id).await {
                warn!(media_id = %media_id, error = %err, "post-completion validation failed");
            }
        });
    }
    Ok(Json(done))
}

/// `DELETE /uploads/{id}`
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.sessions.abort_session(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
