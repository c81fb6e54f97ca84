//! Client and bucket-region caches shared by all handles.
//!
//! [`ClientCache`] keeps one client per (region, session) forever once
//! created. Its size is bounded by the number of regions times the number of
//! distinct sessions, which is small unless a caller mints sessions without
//! bound; such callers should own a `ClientCache` and drop it when done.
//!
//! [`BucketRegionCache`] remembers the home region of each bucket for a TTL.
//! Concurrent misses on one bucket share a single lookup; expired entries are
//! pruned whenever a new region is stored.

use super::client::ObjectClient;
use super::provider::Session;
use super::recovery::{with_cancel, BackoffConfig, RetryPolicy};
use crate::error::S3Result;
use crate::interface::Opts;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cache key for client instances
type CacheKey = (String, u64); // (region, session id)

/// Builds a client for a session and region
pub type ClientFactory = Arc<dyn Fn(&Session, &str) -> Arc<dyn ObjectClient> + Send + Sync>;

/// Thread-safe client cache that avoids rebuilding clients per operation
pub struct ClientCache {
    cache: RwLock<HashMap<CacheKey, Arc<dyn ObjectClient>>>,
    factory: ClientFactory,
}

impl ClientCache {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Get an existing client or create a new one for the session and region
    pub fn get_or_create(&self, session: &Session, region: &str) -> Arc<dyn ObjectClient> {
        let key = (region.to_string(), session.id());

        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(client) = cache.get(&key) {
                return Arc::clone(client);
            }
        }

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let client = cache.entry(key).or_insert_with(|| {
            debug!(region, session = session.name(), "creating S3 client");
            (self.factory)(session, region)
        });
        Arc::clone(client)
    }

    /// Number of cached clients
    pub fn len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// TTL cache of bucket home regions
pub struct BucketRegionCache {
    entries: RwLock<HashMap<String, (String, Instant)>>,
    lookups: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
    backoff: BackoffConfig,
}

impl BucketRegionCache {
    pub fn new(ttl: Duration, backoff: BackoffConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lookups: Mutex::new(HashMap::new()),
            ttl,
            backoff,
        }
    }

    /// Cached region of `bucket`, if still fresh
    pub fn cached(&self, bucket: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(bucket)
            .filter(|(_, expires)| Instant::now() < *expires)
            .map(|(region, _)| region.clone())
    }

    /// Region of `bucket`, asking S3 through `clients` on a cache miss
    pub async fn locate(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        clients: Vec<Arc<dyn ObjectClient>>,
    ) -> S3Result<String> {
        if let Some(region) = self.cached(bucket) {
            return Ok(region);
        }

        let gate = Arc::clone(
            self.lookups
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(bucket.to_string())
                .or_default(),
        );
        let turn = with_cancel(cancel, "locate bucket", async { Ok(gate.lock().await) }).await;
        let result = match turn {
            // Whoever held the gate may have stored the region meanwhile.
            Ok(_turn) => match self.cached(bucket) {
                Some(region) => Ok(region),
                None => self.lookup(cancel, bucket, clients).await,
            },
            Err(err) => Err(err),
        };

        let mut lookups = self.lookups.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this call still hold the gate: nobody is waiting.
        if Arc::strong_count(&gate) == 2 {
            lookups.remove(bucket);
        }
        result
    }

    async fn lookup(
        &self,
        cancel: &CancellationToken,
        bucket: &str,
        clients: Vec<Arc<dyn ObjectClient>>,
    ) -> S3Result<String> {
        let mut policy = RetryPolicy::new(clients, self.backoff.clone(), Opts::default())?;
        let region = loop {
            let client = policy.client();
            let result = with_cancel(cancel, "locate bucket", client.bucket_region(bucket)).await;
            if !policy.should_retry(cancel, &result, "locate bucket").await {
                break result.map_err(|e| {
                    policy.annotate(e, format!("s3file.bucket_region s3://{}", bucket))
                })?;
            }
        };

        debug!(bucket, region = %region, "cached bucket region");
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, (_, expires)| now < *expires);
        entries.insert(bucket.to_string(), (region.clone(), now + self.ttl));
        Ok(region)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
