//! Media asset status, deletion and outbox dead-letter handling.

use crate::{
    errors::AppError,
    models::{
        media_file::{MediaFile, MediaStatus},
        outbox_event::OutboxEvent,
    },
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header naming the caller for owner-only operations.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Serialize)]
pub struct MediaStatusResp {
    pub media_id: Uuid,
    pub status: MediaStatus,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<i64>,
}

/// `GET /media/{id}/status`
pub async fn media_status(
    State(state): State<AppState>,
    Path(media_id): Path<Uuid>,
) -> Result<Json<MediaStatusResp>, AppError> {
    let media = state.state_machine.get(media_id).await?;
    Ok(Json(MediaStatusResp {
        media_id,
        status: media.status,
        reject_reason: media.reject_reason,
    }))
}

/// `DELETE /media/{id}`; only the owning user may delete.
pub async fn delete_media(
    State(state): State<AppState>,
    Path(media_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<MediaFile>, AppError> {
    let caller = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let media = state.state_machine.get(media_id).await?;
    let allow_delete = caller == Some(media.user_id.as_str());
    Ok(Json(state.state_machine.delete(media_id, allow_delete).await?))
}

/// `GET /outbox/dead-letters?limit=`
pub async fn dead_letters(
    State(state): State<AppState>,
    Query(q): Query<DeadLetterQuery>,
) -> Result<Json<Vec<OutboxEvent>>, AppError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(state.outbox.dead_letters(limit).await?))
}

/// `POST /outbox/{id}/requeue`
pub async fn requeue_event(
    State(state): State<AppState>,
    Path(event_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.outbox.requeue(event_id).await? {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::new(
            StatusCode::NOT_FOUND,
            format!("no dead-lettered event {}", event_id),
        ))
    }
}
