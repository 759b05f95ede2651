//! Contracts for the external blob store.
//!
//! The pipeline never moves upload bytes itself: clients PUT parts against
//! presigned URLs, and the service only drives multipart bookkeeping,
//! finalization and (streamed, bounded-memory) reads for checksumming.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::{io, pin::Pin};
use thiserror::Error;

/// A boxed stream of object bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = BlobResult<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("invalid object key")]
    InvalidKey,
    #[error("part {part_number} rejected: {reason}")]
    InvalidPart { part_number: i32, reason: String },
    #[error("presigned URL is invalid or expired")]
    InvalidSignature,
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// A time-limited URL a client can use without credentials.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Presigned target for one part of a multipart upload.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PresignedPart {
    pub part_number: i32,
    pub url: String,
    pub expires_at: DateTime<Utc>,
    pub start_byte: i64,
    pub end_byte: i64,
}

/// A part the client reported as uploaded, as handed to multipart-complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i32,
    pub etag: String,
}

/// Multipart surface used by the upload session manager.
#[async_trait]
pub trait BlobGateway: Send + Sync {
    /// Backend name recorded on media rows (e.g. "local", "s3").
    fn provider(&self) -> &str;

    /// Bucket all ingested objects land in.
    fn bucket(&self) -> &str;

    /// Start a multipart upload for `key`; returns the gateway's upload id.
    async fn create_multipart_upload(&self, key: &str) -> BlobResult<String>;

    async fn presign_part(&self, upload_id: &str, part_number: i32) -> BlobResult<PresignedUrl>;

    /// Stitch `parts` (ascending part numbers) into the final object; returns its size.
    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<i64>;

    /// Release everything reserved for an unfinished upload. Unknown ids are not an error.
    async fn abort_multipart_upload(&self, upload_id: &str) -> BlobResult<()>;

    async fn open_object(&self, key: &str) -> BlobResult<ByteStream>;

    /// Remove a finalized object. Missing objects are not an error.
    async fn delete_object(&self, key: &str) -> BlobResult<()>;
}

/// Read-side surface used by transcoding workers.
#[async_trait]
pub trait ObjectReader: Send + Sync {
    async fn presign_get(&self, bucket: &str, key: &str) -> BlobResult<PresignedUrl>;

    /// At most the first `len` bytes of the object.
    async fn read_prefix(&self, bucket: &str, key: &str, len: u64) -> BlobResult<Bytes>;

    async fn open_stream(&self, bucket: &str, key: &str) -> BlobResult<ByteStream>;
}
