use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::services::outbox::{Backoff, OutboxPolicy};

const ENV_PREFIX: &str = "MEDIA_INGEST_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL clients use to reach this service; presigned URLs are built on it.
    pub public_base_url: String,
    pub bucket: String,
    pub signing_secret: String,
    /// `host:port` of a clamd daemon. Scanning is disabled when absent.
    pub clamd_addr: Option<String>,
    pub ffprobe_path: PathBuf,
    /// External program invoked once per probed asset.
    pub transcode_command: PathBuf,
    pub pipeline: PipelineConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media ingestion pipeline: resumable uploads, dedup, outbox")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides MEDIA_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for presigned links (overrides MEDIA_INGEST_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Bucket name for raw uploads (overrides MEDIA_INGEST_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// clamd address, e.g. 127.0.0.1:3310 (overrides MEDIA_INGEST_CLAMD_ADDR)
    #[arg(long)]
    pub clamd_addr: Option<String>,

    /// Path to ffprobe (overrides MEDIA_INGEST_FFPROBE_PATH)
    #[arg(long)]
    pub ffprobe_path: Option<PathBuf>,

    /// Transcode program (overrides MEDIA_INGEST_TRANSCODE_COMMAND)
    #[arg(long)]
    pub transcode_command: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        let env_port = env_or("PORT", 3000u16)?;
        let host = args.host.unwrap_or_else(|| env_string("HOST", "0.0.0.0"));
        let port = args.port.unwrap_or(env_port);

        let signing_secret = match env::var(format!("{ENV_PREFIX}SIGNING_SECRET")) {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    "MEDIA_INGEST_SIGNING_SECRET not set; presigned URLs will not survive a restart"
                );
                uuid::Uuid::new_v4().simple().to_string()
            }
        };

        let cfg = Self {
            public_base_url: args
                .public_base_url
                .unwrap_or_else(|| env_string("PUBLIC_BASE_URL", &format!("http://127.0.0.1:{port}"))),
            host,
            port,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_string("STORAGE_DIR", "./data/blobs")),
            database_url: args
                .database_url
                .unwrap_or_else(|| env_string("DATABASE_URL", "sqlite://./data/meta/media_ingest.db")),
            bucket: args.bucket.unwrap_or_else(|| env_string("BUCKET", "media-raw")),
            signing_secret,
            clamd_addr: args
                .clamd_addr
                .or_else(|| env::var(format!("{ENV_PREFIX}CLAMD_ADDR")).ok()),
            ffprobe_path: args
                .ffprobe_path
                .unwrap_or_else(|| env_string("FFPROBE_PATH", "ffprobe").into()),
            transcode_command: args
                .transcode_command
                .unwrap_or_else(|| env_string("TRANSCODE_COMMAND", "media-transcode").into()),
            pipeline: PipelineConfig::from_env()?,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tunables for the ingestion pipeline. Environment only.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub session_ttl: Duration,
    pub max_upload_bytes: i64,
    pub min_part_size: i64,
    pub max_parts: i32,
    /// Leading bytes hashed into the sparse checksum.
    pub sparse_sample_bytes: usize,
    pub presign_ttl: Duration,
    pub part_retry_limit: i32,
    pub session_sweep_interval: Duration,
    pub session_sweep_batch: i64,
    /// Non-terminal assets untouched this long are marked EXPIRED.
    pub stale_media_ttl: Duration,
    pub validation_sweep_interval: Duration,
    pub outbox_publish_interval: Duration,
    pub outbox_clean_interval: Duration,
    pub outbox: OutboxPolicy,
    pub probe_partial_bytes: u64,
    pub probe_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let publish_interval = Duration::from_secs(30);
        Self {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            max_upload_bytes: 50 * 1024 * 1024 * 1024,
            min_part_size: 5 * 1024 * 1024,
            max_parts: 10_000,
            sparse_sample_bytes: 1024 * 1024,
            presign_ttl: Duration::from_secs(60 * 60),
            part_retry_limit: 3,
            session_sweep_interval: Duration::from_secs(5 * 60),
            session_sweep_batch: 100,
            stale_media_ttl: Duration::from_secs(72 * 60 * 60),
            validation_sweep_interval: Duration::from_secs(60),
            outbox_publish_interval: publish_interval,
            outbox_clean_interval: Duration::from_secs(60 * 60),
            outbox: OutboxPolicy {
                max_retries: 5,
                batch_size: 100,
                claim_ttl: Duration::from_secs(60),
                retention: Duration::from_secs(7 * 24 * 60 * 60),
                backoff: Backoff::Fixed(publish_interval),
            },
            probe_partial_bytes: 10 * 1024 * 1024,
            probe_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let publish_interval = env_secs("OUTBOX_PUBLISH_INTERVAL_SECS", defaults.outbox_publish_interval)?;

        let backoff = match env_string("OUTBOX_BACKOFF", "fixed").as_str() {
            "fixed" => Backoff::Fixed(publish_interval),
            "exponential" => Backoff::Exponential {
                base: publish_interval,
                max: env_secs("OUTBOX_BACKOFF_MAX_SECS", Duration::from_secs(60 * 60))?,
            },
            other => bail!("unknown MEDIA_INGEST_OUTBOX_BACKOFF `{}` (fixed|exponential)", other),
        };

        let cfg = Self {
            session_ttl: env_secs("SESSION_TTL_SECS", defaults.session_ttl)?,
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            min_part_size: env_or("MIN_PART_SIZE", defaults.min_part_size)?,
            max_parts: env_or("MAX_PARTS", defaults.max_parts)?,
            sparse_sample_bytes: env_or("SPARSE_SAMPLE_BYTES", defaults.sparse_sample_bytes)?,
            presign_ttl: env_secs("PRESIGN_TTL_SECS", defaults.presign_ttl)?,
            part_retry_limit: env_or("PART_RETRY_LIMIT", defaults.part_retry_limit)?,
            session_sweep_interval: env_secs("SESSION_SWEEP_INTERVAL_SECS", defaults.session_sweep_interval)?,
            session_sweep_batch: env_or("SESSION_SWEEP_BATCH", defaults.session_sweep_batch)?,
            stale_media_ttl: env_secs("STALE_MEDIA_TTL_SECS", defaults.stale_media_ttl)?,
            validation_sweep_interval: env_secs(
                "VALIDATION_SWEEP_INTERVAL_SECS",
                defaults.validation_sweep_interval,
            )?,
            outbox_publish_interval: publish_interval,
            outbox_clean_interval: env_secs("OUTBOX_CLEAN_INTERVAL_SECS", defaults.outbox_clean_interval)?,
            outbox: OutboxPolicy {
                max_retries: env_or("OUTBOX_MAX_RETRIES", defaults.outbox.max_retries)?,
                batch_size: env_or("OUTBOX_BATCH_SIZE", defaults.outbox.batch_size)?,
                claim_ttl: env_secs("OUTBOX_CLAIM_TTL_SECS", defaults.outbox.claim_ttl)?,
                retention: env_secs("OUTBOX_RETENTION_SECS", defaults.outbox.retention)?,
                backoff,
            },
            probe_partial_bytes: env_or("PROBE_PARTIAL_BYTES", defaults.probe_partial_bytes)?,
            probe_timeout: env_secs("PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
        };

        if cfg.max_parts < 1 || cfg.min_part_size < 1 || cfg.sparse_sample_bytes == 0 {
            bail!("MAX_PARTS, MIN_PART_SIZE and SPARSE_SAMPLE_BYTES must be positive");
        }
        if cfg.outbox.max_retries < 1 || cfg.outbox.batch_size < 1 {
            bail!("OUTBOX_MAX_RETRIES and OUTBOX_BATCH_SIZE must be positive");
        }
        for (name, interval) in [
            ("OUTBOX_PUBLISH_INTERVAL_SECS", cfg.outbox_publish_interval),
            ("OUTBOX_CLEAN_INTERVAL_SECS", cfg.outbox_clean_interval),
            ("SESSION_SWEEP_INTERVAL_SECS", cfg.session_sweep_interval),
            ("VALIDATION_SWEEP_INTERVAL_SECS", cfg.validation_sweep_interval),
        ] {
            // tokio::time::interval panics on a zero period
            if interval.is_zero() {
                bail!("{ENV_PREFIX}{name} must be greater than zero");
            }
        }

        Ok(cfg)
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(format!("{ENV_PREFIX}{name}")).unwrap_or_else(|_| default.into())
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_or(name, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.outbox_publish_interval, Duration::from_secs(30));
        assert_eq!(cfg.outbox.max_retries, 5);
        assert_eq!(cfg.max_parts, 10_000);
        assert!(matches!(cfg.outbox.backoff, Backoff::Fixed(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn missing_env_falls_back_to_default() {
        let value: i64 = env_or("SURELY_NOT_SET_FOR_TESTS", 42).unwrap();
        assert_eq!(value, 42);
    }
}
