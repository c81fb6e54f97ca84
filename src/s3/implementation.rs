//! The `s3://` storage implementation

use super::file::{stat_object, FileState, S3File};
use super::list::Lister;
use super::metrics::Metrics;
use super::multipart::Uploader;
use super::provider::{ClientProvider, DefaultClientProvider, DefaultSessionProvider};
use super::recovery::{with_cancel, BackoffConfig, PolicyFactory};
use super::types::PresignMethod;
use crate::config::S3FileConfig;
use crate::error::{S3Error, S3Result};
use crate::interface::{File, FileInfo, Implementation, ListOptions, Opts};
use crate::uri::S3Path;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Opens, creates, lists, removes and presigns S3 objects
pub struct S3Implementation {
    provider: Arc<dyn ClientProvider>,
    config: S3FileConfig,
    backoff: BackoffConfig,
    metrics: Arc<Metrics>,
    metrics_logger: CancellationToken,
}

impl S3Implementation {
    /// Create an implementation; starts the metrics logger when a period is
    /// configured and a tokio runtime is running
    pub fn new(provider: Arc<dyn ClientProvider>, config: S3FileConfig) -> Self {
        let backoff = BackoffConfig::from(&config.retry);
        let metrics = Arc::new(Metrics::new());
        let metrics_logger = CancellationToken::new();
        if let Some(period) = config.metric_log_period() {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => {
                    Arc::clone(&metrics).spawn_logger(period, metrics_logger.clone());
                }
                Err(_) => warn!("no tokio runtime; s3file metrics will not be logged"),
            }
        }
        Self {
            provider,
            config,
            backoff,
            metrics,
            metrics_logger,
        }
    }

    /// Implementation over the default AWS credential chain
    pub fn from_config(config: S3FileConfig) -> S3Result<Self> {
        config.validate()?;
        let sessions = Arc::new(DefaultSessionProvider::new(config.clone()));
        let provider = Arc::new(DefaultClientProvider::new(&config, sessions));
        Ok(Self::new(provider, config))
    }

    pub fn config(&self) -> &S3FileConfig {
        &self.config
    }

    /// Counters of every operation run through this implementation
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    async fn policies(
        &self,
        cancel: &CancellationToken,
        path: &S3Path,
        opts: Opts,
    ) -> S3Result<PolicyFactory> {
        let clients = self
            .provider
            .clients(cancel, &path.bucket)
            .await
            .map_err(|e| e.context(format!("s3file: resolve clients for {}", path)))?;
        Ok(PolicyFactory::new(clients, self.backoff.clone(), opts)?
            .with_metrics(Arc::clone(&self.metrics)))
    }
}

impl Drop for S3Implementation {
    fn drop(&mut self) {
        self.metrics_logger.cancel();
    }
}

/// Parse `path`, requiring both a bucket and a key
fn object_path(path: &str, op: &str) -> S3Result<S3Path> {
    let parsed = S3Path::parse(path)?;
    if parsed.bucket.is_empty() || parsed.key.is_empty() {
        return Err(S3Error::Invalid(format!(
            "{} {}: path must name a bucket and a key",
            op, path
        )));
    }
    Ok(parsed)
}

#[async_trait]
impl Implementation for S3Implementation {
    type File = S3File;
    type Lister = Lister;

    async fn open(&self, cancel: &CancellationToken, path: &str, opts: Opts) -> S3Result<S3File> {
        let parsed = object_path(path, "open")?;
        let policies = self.policies(cancel, &parsed, opts).await?;
        let file = S3File::spawn(
            FileState::for_read(
                path,
                parsed.bucket,
                parsed.key,
                policies,
                self.config.read_chunk_size,
            ),
            self.config.request_queue_depth,
        );
        file.stat(cancel).await?;
        debug!(path, "opened for reading");
        Ok(file)
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        path: &str,
        opts: Opts,
    ) -> S3Result<S3File> {
        let parsed = object_path(path, "create")?;
        let policies = self.policies(cancel, &parsed, opts).await?;
        let uploader = Uploader::new(
            cancel,
            path,
            parsed.bucket.clone(),
            parsed.key.clone(),
            policies.clone(),
            &self.config,
        )
        .await?;
        Ok(S3File::spawn(
            FileState::for_write(path, parsed.bucket, parsed.key, policies, uploader),
            self.config.request_queue_depth,
        ))
    }

    async fn stat(&self, cancel: &CancellationToken, path: &str, opts: Opts) -> S3Result<FileInfo> {
        let parsed = S3Path::parse(path)?;
        if parsed.key.is_empty() {
            return Err(S3Error::Invalid(format!("stat {}: empty key", path)));
        }
        let policies = self.policies(cancel, &parsed, opts).await?;
        stat_object(cancel, &policies, path, &parsed.bucket, &parsed.key).await
    }

    fn list(&self, path: &str, options: ListOptions) -> S3Result<Lister> {
        Lister::new(
            Arc::clone(&self.provider),
            self.backoff.clone(),
            path,
            options,
        )
    }

    async fn remove(&self, cancel: &CancellationToken, path: &str) -> S3Result<()> {
        let parsed = object_path(path, "remove")?;
        let policies = self.policies(cancel, &parsed, Opts::default()).await?;
        let mut policy = policies.policy_for("remove");
        loop {
            let client = policy.client();
            let delete = client.delete_object(&parsed.bucket, &parsed.key);
            let result = with_cancel(cancel, "remove", delete).await;
            if !policy.should_retry(cancel, &result, path).await {
                return result.map_err(|e| policy.annotate(e, format!("s3file.remove {}", path)));
            }
        }
    }

    async fn presign(
        &self,
        cancel: &CancellationToken,
        path: &str,
        method: &str,
        expiry: Duration,
    ) -> S3Result<String> {
        let method: PresignMethod = method.parse()?;
        let parsed = object_path(path, "presign")?;
        let policies = self.policies(cancel, &parsed, Opts::default()).await?;
        let mut policy = policies.policy();
        loop {
            let client = policy.client();
            let presign = client.presign(method, &parsed.bucket, &parsed.key, expiry);
            let result = with_cancel(cancel, "presign", presign).await;
            if !policy.should_retry(cancel, &result, path).await {
                return result
                    .map_err(|e| policy.annotate(e, format!("s3file.presign {} {}", method, path)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::s3::client::ObjectClient;
    use crate::s3::mock::{MockObjectClient, MockOp};
    use crate::s3::provider::StaticClientProvider;

    fn implementation(mock: &MockObjectClient) -> S3Implementation {
        let config = S3FileConfig {
            read_chunk_size: 4,
            upload_part_size: 8,
            upload_parallelism: 2,
            ..Default::default()
        };
        S3Implementation::new(
            Arc::new(StaticClientProvider::single(
                Arc::new(mock.clone()) as Arc<dyn ObjectClient>
            )),
            config,
        )
    }

    #[tokio::test]
    async fn test_create_then_open() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        let s3 = implementation(&mock);
        let cancel = CancellationToken::new();

        let file = s3.create(&cancel, "s3://b/dir/x", Opts::default()).await.unwrap();
        file.writer(cancel.clone()).write_all(b"some bytes here").await.unwrap();
        file.close(&cancel).await.unwrap();

        let file = s3.open(&cancel, "s3://b/dir/x", Opts::default()).await.unwrap();
        assert_eq!(file.name(), "s3://b/dir/x");
        let info = file.stat(&cancel).await.unwrap();
        assert_eq!(info.size, 15);
        let mut out = Vec::new();
        file.reader(cancel.clone()).read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"some bytes here");
        file.close(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_missing_is_not_exist() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        let s3 = implementation(&mock);
        let err = s3
            .open(&CancellationToken::new(), "s3://b/nope", Opts::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_not_exist());
        assert_eq!(mock.calls(MockOp::HeadObject), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_retries_until_visible() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        mock.fail_next(MockOp::HeadObject, 3, S3Error::service("NotFound", "Not Found"));
        mock.put("b", "late", b"here now");
        let s3 = implementation(&mock);
        let opts = Opts {
            retry_when_not_found: true,
            ..Default::default()
        };

        s3.open(&CancellationToken::new(), "s3://b/late", opts)
            .await
            .unwrap();
        assert_eq!(mock.calls(MockOp::HeadObject), 4);
    }

    #[tokio::test]
    async fn test_stat_edge_cases() {
        let mock = MockObjectClient::new();
        mock.put("b", "dir/", b"");
        mock.put("b", "empty", b"");
        let s3 = implementation(&mock);
        let cancel = CancellationToken::new();

        let err = s3.stat(&cancel, "s3://b", Opts::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        let err = s3.stat(&cancel, "s3://b/dir/", Opts::default()).await.unwrap_err();
        assert!(err.is_not_exist());
        let info = s3.stat(&cancel, "s3://b/empty", Opts::default()).await.unwrap();
        assert_eq!(info.size, 0);
        assert_eq!(info.name, "s3://b/empty");
    }

    #[tokio::test]
    async fn test_remove() {
        let mock = MockObjectClient::new();
        mock.put("b", "k", b"x");
        let s3 = implementation(&mock);
        s3.remove(&CancellationToken::new(), "s3://b/k").await.unwrap();
        assert!(mock.object("b", "k").is_none());
    }

    #[tokio::test]
    async fn test_presign_methods() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        let s3 = implementation(&mock);
        let cancel = CancellationToken::new();

        let url = s3
            .presign(&cancel, "s3://b/k", "put", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.contains("X-Amz-Expires=60"));

        let err = s3
            .presign(&cancel, "s3://b/k", "PATCH", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_operations_feed_metrics() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        let s3 = implementation(&mock);
        let cancel = CancellationToken::new();

        let file = s3.create(&cancel, "s3://b/m", Opts::default()).await.unwrap();
        file.writer(cancel.clone()).write_all(b"fifteen bytes!!").await.unwrap();
        file.close(&cancel).await.unwrap();
        let file = s3.open(&cancel, "s3://b/m", Opts::default()).await.unwrap();
        let mut out = Vec::new();
        file.reader(cancel.clone()).read_to_end(&mut out).await.unwrap();
        file.close(&cancel).await.unwrap();
        s3.remove(&cancel, "s3://b/m").await.unwrap();

        let snap = s3.metrics().take();
        assert_eq!(snap["write"].count, 2);
        assert_eq!(snap["write"].bytes, 15);
        assert_eq!(snap["read"].bytes, 15);
        assert_eq!(snap["stat"].count, 1);
        assert_eq!(snap["remove"].count, 1);
        assert!(s3.metrics().snapshot().is_empty());
    }

    #[test]
    fn test_metrics_logger_without_runtime() {
        let config = S3FileConfig {
            metric_log_period_secs: 1,
            ..Default::default()
        };
        let s3 = S3Implementation::new(
            Arc::new(StaticClientProvider::single(
                Arc::new(MockObjectClient::new()) as Arc<dyn ObjectClient>
            )),
            config,
        );
        assert!(s3.metrics().snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_bad_paths() {
        let mock = MockObjectClient::new();
        let s3 = implementation(&mock);
        let cancel = CancellationToken::new();

        assert!(s3.open(&cancel, "gs://b/k", Opts::default()).await.is_err());
        assert!(s3.create(&cancel, "s3://b", Opts::default()).await.is_err());
        assert!(s3.remove(&cancel, "s3://b/").await.is_err());
    }
}
