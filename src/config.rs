/*!
 * Configuration types for s3file
 */

use crate::error::{S3Error, S3Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default region used when no bucket is involved
pub const DEFAULT_REGION: &str = "us-west-2";

/// Default ranged-read sub-range size (16 MiB)
pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Default multipart part size (16 MiB)
pub const DEFAULT_UPLOAD_PART_SIZE: usize = 16 * 1024 * 1024;

/// Minimum part size accepted by S3 for all but the last part (5 MiB)
pub const MIN_UPLOAD_PART_SIZE: usize = 5 * 1024 * 1024;

/// Default number of upload workers per write handle
pub const DEFAULT_UPLOAD_PARALLELISM: usize = 16;

/// Default FileActor request-channel capacity
pub const DEFAULT_REQUEST_QUEUE_DEPTH: usize = 16;

/// Top-level configuration of the S3 file engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3FileConfig {
    /// Region used when no bucket is involved (e.g. ListBuckets)
    pub default_region: String,

    /// Fixed AWS region; disables bucket-region discovery
    pub region: Option<String>,

    /// Custom endpoint URL (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,

    /// Path-style addressing (required for some S3-compatible services)
    pub force_path_style: bool,

    /// AWS access key ID (optional - uses credential chain if not provided)
    pub access_key: Option<String>,

    /// AWS secret access key (optional - uses credential chain if not provided)
    pub secret_key: Option<String>,

    /// Session token (for temporary credentials)
    pub session_token: Option<String>,

    /// AWS profile name to use
    pub profile: Option<String>,

    /// Server-side encryption algorithm passed through on uploads (e.g. "AES256")
    pub server_side_encryption: Option<String>,

    /// Sub-range size for parallel ranged reads
    pub read_chunk_size: usize,

    /// Multipart upload part size
    pub upload_part_size: usize,

    /// Upload workers per write handle
    pub upload_parallelism: usize,

    /// Capacity of each handle's request queue
    pub request_queue_depth: usize,

    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Lifetime of a bucket-to-region cache entry
    pub bucket_region_cache_ttl_secs: u64,

    /// Backoff and retry-deadline settings
    pub retry: RetryConfig,

    /// Interval between metric log lines in seconds; 0 disables them
    pub metric_log_period_secs: u64,

    /// Log level
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    pub verbose: bool,
}

impl Default for S3FileConfig {
    fn default() -> Self {
        Self {
            default_region: DEFAULT_REGION.to_string(),
            region: None,
            endpoint: None,
            force_path_style: false,
            access_key: None,
            secret_key: None,
            session_token: None,
            profile: None,
            server_side_encryption: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            upload_part_size: DEFAULT_UPLOAD_PART_SIZE,
            upload_parallelism: DEFAULT_UPLOAD_PARALLELISM,
            request_queue_depth: DEFAULT_REQUEST_QUEUE_DEPTH,
            timeout_seconds: 300, // 5 minutes
            bucket_region_cache_ttl_secs: 3600,
            retry: RetryConfig::default(),
            metric_log_period_secs: 0,
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

impl S3FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> S3Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            S3Error::Invalid(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: S3FileConfig = toml::from_str(&contents)
            .map_err(|e| S3Error::Invalid(format!("cannot parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> S3Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| S3Error::Invalid(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            S3Error::Invalid(format!("cannot write config {}: {}", path.display(), e))
        })?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> S3Result<()> {
        if self.default_region.is_empty() {
            return Err(S3Error::Invalid("default_region cannot be empty".to_string()));
        }

        if self.read_chunk_size == 0 {
            return Err(S3Error::Invalid(
                "read_chunk_size must be at least 1".to_string(),
            ));
        }

        if self.upload_part_size == 0 {
            return Err(S3Error::Invalid(
                "upload_part_size must be at least 1".to_string(),
            ));
        }

        if self.upload_parallelism == 0 {
            return Err(S3Error::Invalid(
                "upload_parallelism must be at least 1".to_string(),
            ));
        }

        if self.request_queue_depth == 0 {
            return Err(S3Error::Invalid(
                "request_queue_depth must be at least 1".to_string(),
            ));
        }

        self.retry.validate()?;

        // Validate credentials consistency
        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(S3Error::Invalid(
                "Both access_key and secret_key must be provided together".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if using explicit credentials
    pub fn has_explicit_credentials(&self) -> bool {
        self.access_key.is_some() && self.secret_key.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn bucket_region_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.bucket_region_cache_ttl_secs)
    }

    /// Metric logging interval, if enabled
    pub fn metric_log_period(&self) -> Option<Duration> {
        (self.metric_log_period_secs > 0).then(|| Duration::from_secs(self.metric_log_period_secs))
    }
}

/// Backoff schedule and retry deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First backoff step in milliseconds
    pub initial_backoff_ms: u64,

    /// Upper bound of a single backoff step in milliseconds
    pub max_backoff_ms: u64,

    /// Multiplier applied per retry
    pub backoff_factor: f64,

    /// Fraction of each wait that is randomized (0.0 - 1.0)
    pub jitter: f64,

    /// Hard deadline for all retries of one operation, from its start
    pub max_retry_duration_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 60_000,
            backoff_factor: 1.2,
            jitter: 0.2,
            max_retry_duration_secs: 3600,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> S3Result<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(S3Error::Invalid(format!(
                "retry.jitter {} must be between 0 and 1",
                self.jitter
            )));
        }
        if self.backoff_factor < 1.0 {
            return Err(S3Error::Invalid(format!(
                "retry.backoff_factor {} must be at least 1",
                self.backoff_factor
            )));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(S3Error::Invalid(
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Builder for S3FileConfig
#[derive(Debug, Default)]
pub struct S3FileConfigBuilder {
    config: S3FileConfig,
}

impl S3FileConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the region used when no bucket is involved
    pub fn default_region(mut self, region: impl Into<String>) -> Self {
        self.config.default_region = region.into();
        self
    }

    /// Pin every bucket to one region
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Set custom endpoint (for MinIO, LocalStack, etc.)
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    /// Enable path-style addressing
    pub fn force_path_style(mut self, force: bool) -> Self {
        self.config.force_path_style = force;
        self
    }

    /// Set AWS credentials explicitly
    pub fn credentials(mut self, access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        self.config.access_key = Some(access_key.into());
        self.config.secret_key = Some(secret_key.into());
        self
    }

    /// Set session token (for temporary credentials)
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.config.session_token = Some(token.into());
        self
    }

    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config.profile = Some(profile.into());
        self
    }

    pub fn server_side_encryption(mut self, algorithm: impl Into<String>) -> Self {
        self.config.server_side_encryption = Some(algorithm.into());
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    /// Set the multipart part size. Values below 5 MiB only work against test doubles.
    pub fn upload_part_size(mut self, size: usize) -> Self {
        self.config.upload_part_size = size;
        self
    }

    pub fn upload_parallelism(mut self, workers: usize) -> Self {
        self.config.upload_parallelism = workers;
        self
    }

    pub fn request_queue_depth(mut self, depth: usize) -> Self {
        self.config.request_queue_depth = depth;
        self
    }

    /// Set request timeout
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.timeout_seconds = seconds;
        self
    }

    pub fn bucket_region_cache_ttl_secs(mut self, secs: u64) -> Self {
        self.config.bucket_region_cache_ttl_secs = secs;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn metric_log_period_secs(mut self, secs: u64) -> Self {
        self.config.metric_log_period_secs = secs;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Build the configuration
    pub fn build(self) -> S3Result<S3FileConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = S3FileConfig::default();
        assert_eq!(config.default_region, "us-west-2");
        assert_eq!(config.read_chunk_size, 16 * 1024 * 1024);
        assert_eq!(config.upload_part_size, 16 * 1024 * 1024);
        assert_eq!(config.upload_parallelism, 16);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.retry.max_retry_duration_secs, 3600);
        assert!(config.metric_log_period().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_metric_log_period() {
        let config = S3FileConfigBuilder::new()
            .metric_log_period_secs(30)
            .build()
            .unwrap();
        assert_eq!(config.metric_log_period(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = S3FileConfig::default();
        config.upload_parallelism = 0;
        assert!(config.validate().is_err());

        let mut config = S3FileConfig::default();
        config.read_chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_credentials_pairing() {
        let mut config = S3FileConfig::default();
        config.access_key = Some("AKIA".to_string());
        assert!(config.validate().is_err());

        config.secret_key = Some("secret".to_string());
        assert!(config.validate().is_ok());
        assert!(config.has_explicit_credentials());
    }

    #[test]
    fn test_retry_config_validation() {
        let retry = RetryConfig {
            jitter: 1.5,
            ..Default::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetryConfig {
            backoff_factor: 0.5,
            ..Default::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = S3FileConfigBuilder::new()
            .region("eu-west-1")
            .endpoint("http://localhost:9000")
            .force_path_style(true)
            .upload_part_size(1024)
            .upload_parallelism(4)
            .build()
            .unwrap();

        assert_eq!(config.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.force_path_style);
        assert_eq!(config.upload_part_size, 1024);
        assert_eq!(config.upload_parallelism, 4);
    }

    #[test]
    fn test_file_round_trip() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = S3FileConfigBuilder::new()
            .region("ap-south-1")
            .read_chunk_size(4096)
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        config.to_file(temp_file.path()).unwrap();
        let loaded = S3FileConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.region.as_deref(), Some("ap-south-1"));
        assert_eq!(loaded.read_chunk_size, 4096);
        assert_eq!(loaded.log_level, LogLevel::Debug);
        assert_eq!(loaded.retry, RetryConfig::default());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: S3FileConfig = toml::from_str(
            r#"
            endpoint = "http://minio:9000"

            [retry]
            jitter = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.upload_parallelism, DEFAULT_UPLOAD_PARALLELISM);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
