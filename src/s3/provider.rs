//! Sessions and client resolution
//!
//! A [`Session`] is one set of credentials and shared SDK settings. A
//! [`ClientProvider`] turns a bucket into the list of interchangeable clients
//! a [`RetryPolicy`](super::recovery::RetryPolicy) may try, one per session.

use super::cache::{BucketRegionCache, ClientCache, ClientFactory};
use super::client::{load_sdk_config, AwsObjectClient, ObjectClient};
use super::recovery::BackoffConfig;
use crate::config::S3FileConfig;
use crate::error::{S3Error, S3Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// One credential set plus SDK settings
///
/// Clones share the identity used as the client-cache key.
#[derive(Clone)]
pub struct Session {
    id: u64,
    name: String,
    sdk_config: SdkConfig,
}

impl Session {
    pub fn new(name: impl Into<String>, sdk_config: SdkConfig) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            sdk_config,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sdk_config(&self) -> &SdkConfig {
        &self.sdk_config
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str) -> Self {
        Self::new(name, SdkConfig::builder().build())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Source of the sessions to try, in preference order
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn sessions(&self) -> S3Result<Vec<Session>>;
}

/// A fixed list of sessions
#[derive(Debug, Clone)]
pub struct StaticSessionProvider {
    sessions: Vec<Session>,
}

impl StaticSessionProvider {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn sessions(&self) -> S3Result<Vec<Session>> {
        if self.sessions.is_empty() {
            return Err(S3Error::Invalid("no S3 sessions configured".to_string()));
        }
        Ok(self.sessions.clone())
    }
}

/// One session from the configured credentials or the default AWS chain,
/// loaded on first use
pub struct DefaultSessionProvider {
    config: S3FileConfig,
    session: OnceCell<Session>,
}

impl DefaultSessionProvider {
    pub fn new(config: S3FileConfig) -> Self {
        Self {
            config,
            session: OnceCell::new(),
        }
    }
}

#[async_trait]
impl SessionProvider for DefaultSessionProvider {
    async fn sessions(&self) -> S3Result<Vec<Session>> {
        let session = self
            .session
            .get_or_init(|| async {
                let name = self.config.profile.as_deref().unwrap_or("default");
                Session::new(name, load_sdk_config(&self.config).await)
            })
            .await;
        Ok(vec![session.clone()])
    }
}

/// Resolves the clients to use for a bucket
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Interchangeable clients for `bucket` (empty for bucket-less calls)
    async fn clients(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
    ) -> S3Result<Vec<Arc<dyn ObjectClient>>>;
}

/// The same clients for every bucket
#[derive(Clone)]
pub struct StaticClientProvider {
    clients: Vec<Arc<dyn ObjectClient>>,
}

impl StaticClientProvider {
    pub fn new(clients: Vec<Arc<dyn ObjectClient>>) -> Self {
        Self { clients }
    }

    pub fn single(client: Arc<dyn ObjectClient>) -> Self {
        Self::new(vec![client])
    }
}

#[async_trait]
impl ClientProvider for StaticClientProvider {
    async fn clients(
        &self,
        _cancel: &CancellationToken,
        _bucket: &str,
    ) -> S3Result<Vec<Arc<dyn ObjectClient>>> {
        Ok(self.clients.clone())
    }
}

/// Region-aware provider over cached clients, one per session
pub struct DefaultClientProvider {
    sessions: Arc<dyn SessionProvider>,
    clients: Arc<ClientCache>,
    regions: Arc<BucketRegionCache>,
    fixed_region: Option<String>,
    default_region: String,
}

impl DefaultClientProvider {
    /// Provider with fresh caches building `aws-sdk-s3` clients
    pub fn new(config: &S3FileConfig, sessions: Arc<dyn SessionProvider>) -> Self {
        let client_config = config.clone();
        let factory: ClientFactory = Arc::new(move |session: &Session, region: &str| {
            Arc::new(AwsObjectClient::new(
                session.sdk_config(),
                &client_config,
                region,
            )) as Arc<dyn ObjectClient>
        });
        let regions = BucketRegionCache::new(
            config.bucket_region_cache_ttl(),
            BackoffConfig::from(&config.retry),
        );
        Self::with_caches(
            config,
            sessions,
            Arc::new(ClientCache::new(factory)),
            Arc::new(regions),
        )
    }

    /// Provider over caches owned by the caller
    pub fn with_caches(
        config: &S3FileConfig,
        sessions: Arc<dyn SessionProvider>,
        clients: Arc<ClientCache>,
        regions: Arc<BucketRegionCache>,
    ) -> Self {
        Self {
            sessions,
            clients,
            regions,
            fixed_region: config.region.clone(),
            default_region: config.default_region.clone(),
        }
    }

    pub fn client_cache(&self) -> &Arc<ClientCache> {
        &self.clients
    }

    pub fn region_cache(&self) -> &Arc<BucketRegionCache> {
        &self.regions
    }
}

#[async_trait]
impl ClientProvider for DefaultClientProvider {
    async fn clients(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
    ) -> S3Result<Vec<Arc<dyn ObjectClient>>> {
        let sessions = self.sessions.sessions().await?;
        if sessions.is_empty() {
            return Err(S3Error::Invalid("no S3 sessions available".to_string()));
        }

        let region = match &self.fixed_region {
            Some(region) => region.clone(),
            None if bucket.is_empty() => self.default_region.clone(),
            None => {
                let candidates = sessions
                    .iter()
                    .map(|s| self.clients.get_or_create(s, &self.default_region))
                    .collect();
                self.regions.locate(cancel, bucket, candidates).await?
            }
        };

        Ok(sessions
            .iter()
            .map(|s| self.clients.get_or_create(s, &region))
            .collect())
    }
}
