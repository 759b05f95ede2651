pub mod blob_gateway;
pub mod checksum;
pub mod chunk_tracker;
pub mod dedup;
pub mod error;
pub mod local_blob_store;
pub mod message_bus;
pub mod outbox;
pub mod scheduler;
pub mod state_machine;
pub mod upload_sessions;
pub mod validation;
