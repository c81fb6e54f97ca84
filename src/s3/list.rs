//! Directory listings
//!
//! A [`Lister`] pages through ListObjectsV2 for one `s3://bucket/prefix`. In
//! non-recursive mode it lists with a `/` delimiter and reports each common
//! prefix once, as a directory without its trailing slash. Keys that extend
//! the prefix without a path boundary are dropped: listing `foo/bar` yields
//! `foo/bar` and `foo/bar/baz` but never `foo/barbaz`.
//!
//! Listing `s3://` reports the union of the buckets visible to every client.

use super::client::ObjectClient;
use super::provider::ClientProvider;
use super::recovery::{with_cancel, BackoffConfig, RetryPolicy};
use super::types::ListObjectsRequest;
use crate::error::{ErrorKind, S3Error, S3Result};
use crate::interface::{FileInfo, ListEntry, ListOptions, Opts};
use crate::uri::{parse_url, SCHEME};
use futures::future::join_all;
use futures::stream::{self, Stream, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PATH_SEPARATOR: &str = "/";

enum Progress {
    /// Clients not resolved yet
    Start,
    Objects {
        policy: RetryPolicy,
        token: Option<String>,
    },
    Done,
}

/// Paginated listing of one bucket prefix, or of all buckets
pub struct Lister {
    provider: Arc<dyn ClientProvider>,
    backoff: BackoffConfig,
    path: String,
    bucket: String,
    prefix: String,
    options: ListOptions,
    progress: Progress,
    consecutive_empty: u32,
}

impl Lister {
    /// Prepare a listing of `path`; nothing is requested until the first batch
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        backoff: BackoffConfig,
        path: &str,
        options: ListOptions,
    ) -> S3Result<Self> {
        let (bucket, prefix) = parse_url(path)?;
        if bucket.is_empty() && options.recurse {
            return Err(S3Error::Invalid(format!(
                "list {}: listing buckets cannot be combined with recurse",
                path
            )));
        }
        Ok(Self {
            provider,
            backoff,
            path: path.to_string(),
            bucket,
            prefix,
            options,
            progress: Progress::Start,
            consecutive_empty: 0,
        })
    }

    /// Next batch of entries, or `None` once the listing is exhausted
    ///
    /// A batch may be empty while more pages remain. After an error the
    /// listing is over.
    pub async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> S3Result<Option<Vec<ListEntry>>> {
        let result = self.scan(cancel).await;
        if result.is_err() {
            self.progress = Progress::Done;
        }
        result
    }

    async fn scan(&mut self, cancel: &CancellationToken) -> S3Result<Option<Vec<ListEntry>>> {
        if let Progress::Start = self.progress {
            let clients = self.provider.clients(cancel, &self.bucket).await?;
            if self.bucket.is_empty() {
                self.progress = Progress::Done;
                let buckets = list_all_buckets(cancel, &clients).await?;
                return Ok(Some(
                    buckets
                        .into_iter()
                        .map(|bucket| ListEntry {
                            path: format!("{}://{}", SCHEME, bucket),
                            is_dir: true,
                            info: None,
                        })
                        .collect(),
                ));
            }
            self.progress = Progress::Objects {
                policy: RetryPolicy::new(clients, self.backoff.clone(), Opts::default())?,
                token: None,
            };
        }

        let show_dirs = !self.options.recurse;
        let prefix = if show_dirs && !self.prefix.is_empty() && !self.prefix.ends_with(PATH_SEPARATOR)
        {
            format!("{}{}", self.prefix, PATH_SEPARATOR)
        } else {
            self.prefix.clone()
        };
        let start_after = self.options.start_after.as_ref().map(|after| {
            if prefix.is_empty() || prefix.ends_with(PATH_SEPARATOR) {
                format!("{}{}", prefix, after)
            } else {
                format!("{}{}{}", prefix, PATH_SEPARATOR, after)
            }
        });
        let max_keys = self
            .options
            .batch_size_hint
            .filter(|n| *n > 0)
            .map(|n| i32::try_from(n).unwrap_or(i32::MAX));

        let (policy, token) = match &mut self.progress {
            Progress::Objects { policy, token } => (policy, token),
            Progress::Start | Progress::Done => return Ok(None),
        };

        let request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            prefix,
            delimiter: show_dirs.then(|| PATH_SEPARATOR.to_string()),
            continuation_token: token.clone(),
            start_after,
            max_keys,
        };
        let page = loop {
            let client = policy.client();
            let result = with_cancel(cancel, "list", client.list_objects_v2(&request)).await;
            if !policy.should_retry(cancel, &result, &self.path).await {
                break result.map_err(|e| {
                    policy.annotate(
                        e,
                        format!("s3file.list {}://{}/{}", SCHEME, self.bucket, self.prefix),
                    )
                })?;
            }
        };
        *token = page.next_continuation_token.clone();
        let more = page.is_truncated && token.is_some();

        let records = page.objects.len() + page.common_prefixes.len();
        if records > 0 {
            self.consecutive_empty = 0;
        } else {
            self.consecutive_empty += 1;
            let n = self.consecutive_empty;
            if n > 7 && n.is_power_of_two() {
                warn!(
                    path = %self.path,
                    consecutive = n,
                    "S3 returned empty listing pages repeatedly"
                );
            }
        }

        let mut batch = Vec::with_capacity(records);
        for obj in page.objects {
            if !keep_obj(&self.prefix, &obj.key) {
                continue;
            }
            let path = format!("{}://{}/{}", SCHEME, self.bucket, obj.key);
            batch.push(ListEntry {
                info: Some(FileInfo {
                    name: path.clone(),
                    size: obj.size,
                    mod_time: obj.last_modified,
                    etag: obj.etag.unwrap_or_default(),
                }),
                path,
                is_dir: false,
            });
        }
        if show_dirs {
            for dir in page.common_prefixes {
                if !keep_obj(&self.prefix, &dir) {
                    continue;
                }
                let dir = dir.strip_suffix(PATH_SEPARATOR).unwrap_or(&dir);
                batch.push(ListEntry {
                    path: format!("{}://{}/{}", SCHEME, self.bucket, dir),
                    is_dir: true,
                    info: None,
                });
            }
        }

        if !more {
            self.progress = Progress::Done;
        }
        Ok(Some(batch))
    }

    /// All remaining entries
    pub async fn collect_all(mut self, cancel: &CancellationToken) -> S3Result<Vec<ListEntry>> {
        let mut entries = Vec::new();
        while let Some(batch) = self.next_batch(cancel).await? {
            entries.extend(batch);
        }
        Ok(entries)
    }

    /// Stream of entries; an error ends the stream
    pub fn into_stream(
        self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = S3Result<ListEntry>> + Send {
        stream::unfold(Some(self), move |lister| {
            let cancel = cancel.clone();
            async move {
                let mut lister = lister?;
                match lister.next_batch(&cancel).await {
                    Ok(Some(batch)) => Some((Ok(batch), Some(lister))),
                    Ok(None) => None,
                    Err(err) => Some((Err(err), None)),
                }
            }
        })
        .flat_map(|batch| {
            let items: Vec<S3Result<ListEntry>> = match batch {
                Ok(entries) => entries.into_iter().map(Ok).collect(),
                Err(err) => vec![Err(err)],
            };
            stream::iter(items)
        })
    }
}

/// Whether `key` lies at or below `prefix` on a path boundary
///
/// `foo/bar` keeps `foo/bar` and `foo/bar/baz` but not `foo/barbaz`; a
/// trailing slash on the prefix is ignored.
fn keep_obj(prefix: &str, key: &str) -> bool {
    if !key.starts_with(prefix) {
        return false;
    }
    let mut boundary = prefix.len();
    if boundary > 0 && key.len() > boundary {
        if prefix.ends_with(PATH_SEPARATOR) {
            boundary -= 1;
        }
        if key.as_bytes()[boundary] != b'/' {
            return false;
        }
    }
    true
}

/// Sorted union of the buckets each client can see
///
/// Clients without permission to list buckets are skipped.
pub async fn list_all_buckets(
    cancel: &CancellationToken,
    clients: &[Arc<dyn ObjectClient>],
) -> S3Result<Vec<String>> {
    let results = join_all(
        clients
            .iter()
            .map(|client| with_cancel(cancel, "list buckets", client.list_buckets())),
    )
    .await;

    let mut buckets = BTreeSet::new();
    for result in results {
        match result {
            Ok(names) => buckets.extend(names),
            Err(err) if err.kind() == ErrorKind::NotAllowed => {
                debug!(error = %err, "s3file.listbuckets: ignoring");
            }
            Err(err) => return Err(err.context("s3file.listbuckets")),
        }
    }
    Ok(buckets.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::mock::{MockObjectClient, MockOp};
    use crate::s3::provider::StaticClientProvider;
    use futures::TryStreamExt;
    use std::time::Duration;

    fn lister(mock: &MockObjectClient, path: &str, options: ListOptions) -> Lister {
        Lister::new(
            Arc::new(StaticClientProvider::single(Arc::new(mock.clone()))),
            BackoffConfig {
                initial: Duration::from_millis(1),
                jitter: 0.0,
                ..Default::default()
            },
            path,
            options,
        )
        .unwrap()
    }

    fn recursive() -> ListOptions {
        ListOptions {
            recurse: true,
            ..Default::default()
        }
    }

    fn paths(entries: &[ListEntry]) -> Vec<(String, bool)> {
        entries.iter().map(|e| (e.path.clone(), e.is_dir)).collect()
    }

    fn store() -> MockObjectClient {
        let mock = MockObjectClient::new();
        for key in ["foo/bar", "foo/bar/baz", "foo/barbaz", "foo/sub/a", "foo/sub/b", "foo/top"] {
            mock.put("b", key, key.as_bytes());
        }
        mock
    }

    #[test]
    fn test_keep_obj() {
        assert!(keep_obj("foo/bar", "foo/bar"));
        assert!(keep_obj("foo/bar", "foo/bar/baz"));
        assert!(!keep_obj("foo/bar", "foo/barbaz"));
        assert!(keep_obj("foo/bar/", "foo/bar/baz"));
        assert!(keep_obj("", "anything"));
    }

    #[tokio::test]
    async fn test_recursive_respects_path_boundary() {
        let mock = store();
        let entries = lister(&mock, "s3://b/foo/bar", recursive())
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            paths(&entries),
            vec![
                ("s3://b/foo/bar".to_string(), false),
                ("s3://b/foo/bar/baz".to_string(), false),
            ]
        );
        let info = entries[0].info.as_ref().unwrap();
        assert_eq!(info.size, "foo/bar".len() as u64);
        assert!(!info.etag.is_empty());
    }

    #[tokio::test]
    async fn test_non_recursive_reports_directories() {
        let mock = store();
        let mut entries = lister(&mock, "s3://b/foo/", ListOptions::default())
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(
            paths(&entries),
            vec![
                ("s3://b/foo/bar".to_string(), false),
                ("s3://b/foo/bar".to_string(), true),
                ("s3://b/foo/barbaz".to_string(), false),
                ("s3://b/foo/sub".to_string(), true),
                ("s3://b/foo/top".to_string(), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_pagination_and_start_after() {
        let mock = store();
        let options = ListOptions {
            recurse: true,
            batch_size_hint: Some(2),
            start_after: Some("bar/baz".to_string()),
        };
        let mut l = lister(&mock, "s3://b/foo", options);
        let cancel = CancellationToken::new();

        let mut batches = 0;
        let mut all = Vec::new();
        while let Some(batch) = l.next_batch(&cancel).await.unwrap() {
            assert!(batch.len() <= 2);
            batches += 1;
            all.extend(batch);
        }
        assert!(batches >= 2);
        assert_eq!(
            all.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
            vec!["s3://b/foo/barbaz", "s3://b/foo/sub/a", "s3://b/foo/sub/b", "s3://b/foo/top"]
        );
    }

    #[tokio::test]
    async fn test_sparse_pages_are_skipped() {
        let mock = store();
        mock.set_empty_list_pages(9);
        let entries = lister(&mock, "s3://b/foo/sub", recursive())
            .into_stream(CancellationToken::new())
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(mock.calls(MockOp::ListObjectsV2) >= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_list_error_retried() {
        let mock = store();
        mock.fail_next(
            MockOp::ListObjectsV2,
            2,
            S3Error::service("InternalError", "try again"),
        );
        let entries = lister(&mock, "s3://b/foo/sub", recursive())
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_bucket_ends_stream_with_error() {
        let mock = MockObjectClient::new();
        let results: Vec<_> = lister(&mock, "s3://nope/x", ListOptions::default())
            .into_stream(CancellationToken::new())
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn test_bucket_union_skips_denied() {
        let a = MockObjectClient::new();
        a.create_bucket("zeta");
        a.create_bucket("alpha");
        let b = MockObjectClient::new();
        b.create_bucket("beta");
        b.create_bucket("alpha");
        let clients: Vec<Arc<dyn ObjectClient>> = vec![
            Arc::new(a.clone()),
            Arc::new(b),
            Arc::new(a.denied_view()),
        ];

        let buckets = list_all_buckets(&CancellationToken::new(), &clients)
            .await
            .unwrap();
        assert_eq!(buckets, vec!["alpha", "beta", "zeta"]);
    }

    #[tokio::test]
    async fn test_root_listing() {
        let mock = MockObjectClient::new();
        mock.create_bucket("one");
        mock.create_bucket("two");
        let entries = lister(&mock, "s3://", ListOptions::default())
            .collect_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            paths(&entries),
            vec![("s3://one".to_string(), true), ("s3://two".to_string(), true)]
        );

        let provider = Arc::new(StaticClientProvider::single(Arc::new(mock)));
        assert!(Lister::new(provider, BackoffConfig::default(), "s3://", recursive()).is_err());
    }
}
