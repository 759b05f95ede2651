//! Core data models for the media ingestion pipeline.
//!
//! Row types map to the four tables of `migrations/0001_init.sql` via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod chunk_status;
pub mod media_file;
pub mod outbox_event;
pub mod probe;
pub mod upload_session;
