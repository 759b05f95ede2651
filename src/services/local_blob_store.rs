//! src/services/local_blob_store.rs
//!
//! LocalBlobStore: a filesystem-backed blob store gateway for single-node
//! deployments and tests. Multipart parts live under
//! `base_path/.multipart/{upload_id}/part-{n}` until completion stitches them
//! into `base_path/{bucket}/{shard}/{shard}/{key}`. Clients reach it through
//! HMAC-signed, expiring URLs served by the blob handlers.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{Stream, StreamExt, TryStreamExt, pin_mut};
use hmac::{Hmac, Mac};
use md5::Context;
use sha2::Sha256;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::services::blob_gateway::{
    BlobError, BlobGateway, BlobResult, ByteStream, CompletedPart, ObjectReader, PresignedUrl,
};

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";
const TARGET_FILE: &str = "target";
const COPY_BUFFER: usize = 64 * 1024;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies the resource strings embedded in presigned URLs.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, resource: &str, expires: i64) -> BlobResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| BlobError::Unavailable(format!("signing key rejected: {}", e)))?;
        mac.update(resource.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, resource: &str, expires: i64) -> BlobResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(self.mac(resource, expires)?.finalize().into_bytes()))
    }

    /// Constant-time check of `signature`, rejecting anything past `expires`.
    pub fn verify(
        &self,
        resource: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> BlobResult<()> {
        if now.timestamp() > expires {
            return Err(BlobError::InvalidSignature);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| BlobError::InvalidSignature)?;
        self.mac(resource, expires)?
            .verify_slice(&raw)
            .map_err(|_| BlobError::InvalidSignature)
    }
}

#[derive(Clone)]
pub struct LocalBlobStore {
    base_path: PathBuf,
    bucket: String,
    public_base_url: String,
    signer: UrlSigner,
    presign_ttl: Duration,
}

impl LocalBlobStore {
    pub fn new(
        base_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        public_base_url: impl Into<String>,
        signer: UrlSigner,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signer,
            presign_ttl,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(key: &str) -> BlobResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(BlobError::InvalidKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(BlobError::InvalidKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::InvalidKey);
        }
        Ok(())
    }

    /// Upload ids are generated here; anything else is a forged path component.
    fn ensure_upload_id_safe(upload_id: &str) -> BlobResult<()> {
        if upload_id.is_empty()
            || upload_id.len() > 64
            || !upload_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(BlobError::UploadNotFound(upload_id.to_string()));
        }
        Ok(())
    }

    fn ensure_bucket(&self, bucket: &str, key: &str) -> BlobResult<()> {
        if bucket != self.bucket {
            return Err(BlobError::NotFound(format!("{}/{}", bucket, key)));
        }
        Ok(())
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard ids from MD5(bucket/key); keeps directory fan-out small.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(&self.bucket, key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn multipart_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: i32) -> PathBuf {
        self.multipart_dir(upload_id)
            .join(format!("part-{:05}", part_number))
    }

    fn part_resource(upload_id: &str, part_number: i32) -> String {
        format!("PUT\n/blobs/uploads/{}/parts/{}", upload_id, part_number)
    }

    fn object_resource(key: &str) -> String {
        format!("GET\n/blobs/objects/{}", key)
    }

    fn presign(&self, resource: &str, path: &str) -> BlobResult<PresignedUrl> {
        let expires_at = Utc::now()
            + ChronoDuration::from_std(self.presign_ttl).unwrap_or(ChronoDuration::hours(1));
        let expires = expires_at.timestamp();
        let signature = self.signer.sign(resource, expires)?;
        Ok(PresignedUrl {
            url: format!(
                "{}{}?expires={}&signature={}",
                self.public_base_url, path, expires, signature
            ),
            expires_at,
        })
    }

    pub fn verify_part_url(
        &self,
        upload_id: &str,
        part_number: i32,
        expires: i64,
        signature: &str,
    ) -> BlobResult<()> {
        self.signer.verify(
            &Self::part_resource(upload_id, part_number),
            expires,
            signature,
            Utc::now(),
        )
    }

    pub fn verify_object_url(&self, key: &str, expires: i64, signature: &str) -> BlobResult<()> {
        self.signer
            .verify(&Self::object_resource(key), expires, signature, Utc::now())
    }

    async fn target_key(&self, upload_id: &str) -> BlobResult<String> {
        Self::ensure_upload_id_safe(upload_id)?;
        match fs::read_to_string(self.multipart_dir(upload_id).join(TARGET_FILE)).await {
            Ok(key) => Ok(key),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::UploadNotFound(upload_id.to_string()))
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Stream one part to disk; returns its MD5 ETag.
    ///
    /// - Writes to a temporary file, fsyncs, then renames over any previous
    ///   attempt so retried parts are last-write-wins.
    /// - Cleans up the temp file on every error path.
    pub async fn put_part_stream<S>(
        &self,
        upload_id: &str,
        part_number: i32,
        stream: S,
    ) -> BlobResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if part_number < 1 {
            return Err(BlobError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".into(),
            });
        }
        self.target_key(upload_id).await?;

        let dir = self.multipart_dir(upload_id);
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            };
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, self.part_path(upload_id, part_number)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        Ok(format!("{:x}", digest.compute()))
    }

    /// Append one part to `out`, returning its byte count and MD5.
    async fn append_part(path: &Path, out: &mut File) -> io::Result<(i64, String)> {
        let mut part = File::open(path).await?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written: i64 = 0;
        loop {
            let n = part.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            written += n as i64;
        }
        Ok((written, format!("{:x}", digest.compute())))
    }

    async fn assemble(&self, upload_id: &str, parts: &[CompletedPart], tmp_path: &Path) -> BlobResult<i64> {
        let mut out = File::create(tmp_path).await?;
        let mut total: i64 = 0;
        for part in parts {
            let path = self.part_path(upload_id, part.part_number);
            let (len, md5) = match Self::append_part(&path, &mut out).await {
                Ok(res) => res,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(BlobError::InvalidPart {
                        part_number: part.part_number,
                        reason: "part was never uploaded".into(),
                    });
                }
                Err(err) => return Err(BlobError::Io(err)),
            };
            if md5 != part.etag.trim_matches('"') {
                return Err(BlobError::InvalidPart {
                    part_number: part.part_number,
                    reason: format!("etag mismatch: stored {}, reported {}", md5, part.etag),
                });
            }
            total += len;
        }
        out.sync_all().await?;
        Ok(total)
    }

    /// Recursively remove empty directories up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn open_file(&self, key: &str) -> BlobResult<File> {
        Self::ensure_key_safe(key)?;
        File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BlobError::NotFound(key.to_string())
            } else {
                BlobError::Io(err)
            }
        })
    }

    pub async fn object_len(&self, key: &str) -> BlobResult<u64> {
        let file = self.open_file(key).await?;
        Ok(file.metadata().await?.len())
    }
}

#[async_trait]
impl BlobGateway for LocalBlobStore {
    fn provider(&self) -> &str {
        "local"
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn create_multipart_upload(&self, key: &str) -> BlobResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.multipart_dir(&upload_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(TARGET_FILE), key.as_bytes()).await?;
        debug!(upload_id = %upload_id, key = %key, "created multipart upload");
        Ok(upload_id)
    }

    async fn presign_part(&self, upload_id: &str, part_number: i32) -> BlobResult<PresignedUrl> {
        self.target_key(upload_id).await?;
        self.presign(
            &Self::part_resource(upload_id, part_number),
            &format!("/blobs/uploads/{}/parts/{}", upload_id, part_number),
        )
    }

    async fn complete_multipart_upload(
        &self,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<i64> {
        let key = self.target_key(upload_id).await?;
        if parts.is_empty() {
            return Err(BlobError::InvalidPart {
                part_number: 0,
                reason: "no parts supplied".into(),
            });
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(BlobError::InvalidPart {
                part_number: 0,
                reason: "parts must be in ascending order".into(),
            });
        }

        let file_path = self.object_path(&key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            BlobError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let size = match self.assemble(upload_id, parts, &tmp_path).await {
            Ok(size) => size,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }

        if let Err(err) = fs::remove_dir_all(self.multipart_dir(upload_id)).await {
            debug!("failed to remove multipart dir for {}: {}", upload_id, err);
        }

        debug!(upload_id = %upload_id, key = %key, size, "completed multipart upload");
        Ok(size)
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> BlobResult<()> {
        Self::ensure_upload_id_safe(upload_id)?;
        match fs::remove_dir_all(self.multipart_dir(upload_id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    async fn open_object(&self, key: &str) -> BlobResult<ByteStream> {
        let file = self.open_file(key).await?;
        Ok(Box::pin(ReaderStream::new(file).map_err(BlobError::from)))
    }

    async fn delete_object(&self, key: &str) -> BlobResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root()).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectReader for LocalBlobStore {
    async fn presign_get(&self, bucket: &str, key: &str) -> BlobResult<PresignedUrl> {
        self.ensure_bucket(bucket, key)?;
        Self::ensure_key_safe(key)?;
        self.presign(
            &Self::object_resource(key),
            &format!("/blobs/objects/{}", key),
        )
    }

    async fn read_prefix(&self, bucket: &str, key: &str, len: u64) -> BlobResult<Bytes> {
        self.ensure_bucket(bucket, key)?;
        let file = self.open_file(key).await?;
        let mut buf = Vec::new();
        file.take(len).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn open_stream(&self, bucket: &str, key: &str) -> BlobResult<ByteStream> {
        self.ensure_bucket(bucket, key)?;
        self.open_object(key).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures::stream;

    pub(crate) fn store_in(dir: &Path) -> LocalBlobStore {
        LocalBlobStore::new(
            dir,
            "media-raw",
            "http://localhost:3000/",
            UrlSigner::new("test-secret"),
            Duration::from_secs(3600),
        )
    }

    pub(crate) async fn put_part(store: &LocalBlobStore, upload_id: &str, part: i32, data: &[u8]) -> String {
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::copy_from_slice(data))]);
        store.put_part_stream(upload_id, part, body).await.unwrap()
    }

    async fn read_all(store: &LocalBlobStore, key: &str) -> Vec<u8> {
        let mut stream = store.open_object(key).await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn multipart_roundtrip_assembles_in_part_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let id = store.create_multipart_upload("movies/a.mp4").await.unwrap();

        let e2 = put_part(&store, &id, 2, b"world").await;
        let e1 = put_part(&store, &id, 1, b"hello ").await;
        assert_eq!(e1, format!("{:x}", md5::compute(b"hello ")));

        let size = store
            .complete_multipart_upload(
                &id,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: format!("\"{}\"", e2) },
                ],
            )
            .await
            .unwrap();
        assert_eq!(size, 11);
        assert_eq!(read_all(&store, "movies/a.mp4").await, b"hello world");
        assert!(!store.multipart_dir(&id).exists());

        let prefix = store.read_prefix("media-raw", "movies/a.mp4", 5).await.unwrap();
        assert_eq!(&prefix[..], b"hello");
    }

    #[tokio::test]
    async fn complete_rejects_etag_mismatch_and_keeps_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let id = store.create_multipart_upload("k.bin").await.unwrap();
        put_part(&store, &id, 1, b"abc").await;

        let err = store
            .complete_multipart_upload(&id, &[CompletedPart { part_number: 1, etag: "bogus".into() }])
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidPart { part_number: 1, .. }));
        assert!(store.part_path(&id, 1).exists());
        assert!(matches!(
            store.open_object("k.bin").await.err(),
            Some(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let id = store.create_multipart_upload("k.bin").await.unwrap();
        put_part(&store, &id, 1, b"abc").await;

        store.abort_multipart_upload(&id).await.unwrap();
        store.abort_multipart_upload(&id).await.unwrap();
        assert!(matches!(
            store.presign_part(&id, 1).await,
            Err(BlobError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_prunes_shard_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let id = store.create_multipart_upload("nested/k.bin").await.unwrap();
        let etag = put_part(&store, &id, 1, b"abc").await;
        store
            .complete_multipart_upload(&id, &[CompletedPart { part_number: 1, etag }])
            .await
            .unwrap();

        let path = store.object_path("nested/k.bin");
        store.delete_object("nested/k.bin").await.unwrap();
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
        store.delete_object("nested/k.bin").await.unwrap();
    }

    #[tokio::test]
    async fn presigned_part_urls_verify_and_reject_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let id = store.create_multipart_upload("k.bin").await.unwrap();
        let presigned = store.presign_part(&id, 3).await.unwrap();
        assert!(presigned.url.starts_with(&format!("http://localhost:3000/blobs/uploads/{}/parts/3?", id)));

        let query = presigned.url.split('?').nth(1).unwrap();
        let mut expires = 0;
        let mut signature = String::new();
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap();
            match k {
                "expires" => expires = v.parse().unwrap(),
                "signature" => signature = v.to_string(),
                _ => {}
            }
        }

        store.verify_part_url(&id, 3, expires, &signature).unwrap();
        assert!(store.verify_part_url(&id, 4, expires, &signature).is_err());
        assert!(store.verify_part_url(&id, 3, expires + 1, &signature).is_err());
    }

    #[test]
    fn signatures_expire() {
        let signer = UrlSigner::new("s");
        let now = Utc::now();
        let expires = now.timestamp() - 1;
        let sig = signer.sign("GET\n/x", expires).unwrap();
        assert!(matches!(
            signer.verify("GET\n/x", expires, &sig, now),
            Err(BlobError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn unsafe_keys_and_foreign_buckets_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(matches!(
            store.create_multipart_upload("../etc/passwd").await,
            Err(BlobError::InvalidKey)
        ));
        assert!(matches!(
            store.presign_get("other-bucket", "k").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            store.presign_part("../../x", 1).await,
            Err(BlobError::UploadNotFound(_))
        ));
    }
}
