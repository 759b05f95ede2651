//! Content hashing for deduplication.
//!
//! Both checksums are lowercase hex SHA-256. The sparse checksum covers only
//! the first `sparse_sample_bytes` of the content (the whole content when it
//! is shorter), so a client can compute it as soon as its first part is ready.

use futures::StreamExt;
use sha2::{Digest, Sha256};

use crate::services::blob_gateway::{BlobResult, ByteStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub checksum: String,
    pub sparse_checksum: String,
    pub size_bytes: i64,
}

/// Hash an object in one streaming pass with bounded memory.
pub async fn digest_stream(mut stream: ByteStream, sparse_len: usize) -> BlobResult<ContentDigest> {
    let mut full = Sha256::new();
    let mut sparse = Sha256::new();
    let mut sampled = 0usize;
    let mut size_bytes: i64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if sampled < sparse_len {
            let take = (sparse_len - sampled).min(chunk.len());
            sparse.update(&chunk[..take]);
            sampled += take;
        }
        full.update(&chunk);
        size_bytes += chunk.len() as i64;
    }

    Ok(ContentDigest {
        checksum: hex::encode(full.finalize()),
        sparse_checksum: hex::encode(sparse.finalize()),
        size_bytes,
    })
}

/// Sparse checksum of an in-memory buffer.
pub fn sparse_checksum(bytes: &[u8], sample: usize) -> String {
    hex::encode(Sha256::digest(&bytes[..sample.min(bytes.len())]))
}

/// Normalize a client-supplied hex digest; `None` if it is not SHA-256 hex.
pub fn normalize_hex_digest(value: &str) -> Option<String> {
    let value = value.trim().to_ascii_lowercase();
    (value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())).then_some(value)
}
