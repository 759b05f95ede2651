//! Shared handler state.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::{
    local_blob_store::LocalBlobStore, outbox::OutboxPublisher, state_machine::MediaStateMachine,
    upload_sessions::UploadSessionManager, validation::ValidationService,
};

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub sessions: UploadSessionManager,
    pub state_machine: MediaStateMachine,
    pub validation: ValidationService,
    pub outbox: OutboxPublisher,
    pub blobs: Arc<LocalBlobStore>,
}
