//! Endpoints behind the local blob store's presigned URLs.
//! Bodies are streamed in both directions; nothing is buffered in memory.

use crate::{
    errors::AppError,
    services::blob_gateway::BlobGateway,
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::StreamExt;
use serde::Deserialize;
use std::io;

/// Signature parameters appended to every presigned URL.
#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

/// `PUT /blobs/uploads/{id}/parts/{n}?expires=&signature=`; responds with the part ETag.
pub async fn put_part(
    State(state): State<AppState>,
    Path((upload_id, part_number)): Path<(String, i32)>,
    Query(sig): Query<SignedQuery>,
    body: Body,
) -> Result<Response, AppError> {
    state
        .blobs
        .verify_part_url(&upload_id, part_number, sig.expires, &sig.signature)?;

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let etag = state
        .blobs
        .put_part_stream(&upload_id, part_number, stream)
        .await?;

    let mut resp_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        resp_headers.insert(header::ETAG, value);
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = resp_headers;
    Ok(response)
}

/// `GET /blobs/objects/{*key}?expires=&signature=` as a streaming response.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(sig): Query<SignedQuery>,
) -> Result<Response, AppError> {
    state
        .blobs
        .verify_object_url(&key, sig.expires, &sig.signature)?;

    let len = state.blobs.object_len(&key).await?;
    let stream = state.blobs.open_object(&key).await?;

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    Ok(response)
}
