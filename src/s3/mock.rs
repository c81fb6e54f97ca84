//! In-memory S3 for testing
//!
//! [`MockObjectClient`] implements [`ObjectClient`] over an in-memory object
//! store so the file engine can be exercised without a network. Clones share
//! the same store. Failure injection covers the conditions the engine must
//! survive: queued per-operation errors, a seeded fraction of failing or
//! truncated GETs, slow GETs, permission-denied credentials, sparse listing
//! pages and objects overwritten in the middle of a read.
//!
//! # Example
//!
//! ```rust
//! use s3file::s3::mock::{MockObjectClient, MockOp};
//! use s3file::S3Error;
//!
//! let client = MockObjectClient::new();
//! client.put("bucket", "dir/file.txt", b"hello");
//! client.fail_next(MockOp::GetObject, 2, S3Error::service("SlowDown", "reduce rate"));
//! assert_eq!(client.object("bucket", "dir/file.txt").unwrap(), b"hello".to_vec());
//! ```

use super::client::ObjectClient;
use super::types::{
    GetObjectOutput, HeadObjectOutput, ListObjectsPage, ListObjectsRequest, ListedObject,
    PresignMethod, UploadPartInfo,
};
use crate::error::{RequestIds, S3Error, S3Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_MAX_KEYS: usize = 1000;
const DEFAULT_SEED: u64 = 0x5EED;

/// Operations of the mock, for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    HeadObject,
    GetObject,
    PutObject,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    DeleteObject,
    ListObjectsV2,
    ListBuckets,
    BucketRegion,
    Presign,
}

#[derive(Debug, Clone)]
struct MockObject {
    data: Bytes,
    etag: String,
    modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MockUpload {
    bucket: String,
    key: String,
    parts: HashMap<i32, (String, Bytes)>,
}

#[derive(Debug, Clone)]
struct PendingOverwrite {
    bucket: String,
    key: String,
    after_gets: usize,
    data: Bytes,
}

#[derive(Debug)]
struct State {
    buckets: BTreeSet<String>,
    bucket_regions: HashMap<String, String>,
    objects: BTreeMap<(String, String), MockObject>,
    uploads: HashMap<String, MockUpload>,
    next_id: u64,
    failures: HashMap<MockOp, VecDeque<S3Error>>,
    calls: HashMap<MockOp, usize>,
    rng: StdRng,
    get_failure_rate: f64,
    get_truncation_rate: f64,
    get_delay: Option<Duration>,
    empty_list_pages: usize,
    overwrite: Option<PendingOverwrite>,
    get_request_ids: RequestIds,
}

impl State {
    fn new(seed: u64) -> Self {
        Self {
            buckets: BTreeSet::new(),
            bucket_regions: HashMap::new(),
            objects: BTreeMap::new(),
            uploads: HashMap::new(),
            next_id: 1,
            failures: HashMap::new(),
            calls: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            get_failure_rate: 0.0,
            get_truncation_rate: 0.0,
            get_delay: None,
            empty_list_pages: 0,
            overwrite: None,
            get_request_ids: RequestIds::default(),
        }
    }

    fn next_etag(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        format!("\"{:032x}\"", id)
    }

    fn store(&mut self, bucket: &str, key: &str, data: Bytes) {
        let etag = self.next_etag();
        self.buckets.insert(bucket.to_string());
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            MockObject {
                data,
                etag,
                modified: Utc::now(),
            },
        );
    }

    fn require_bucket(&self, bucket: &str) -> S3Result<()> {
        if self.buckets.contains(bucket) {
            Ok(())
        } else {
            Err(service_error("NoSuchBucket", "The specified bucket does not exist", 404))
        }
    }
}

/// In-memory [`ObjectClient`] with failure injection
#[derive(Debug, Clone)]
pub struct MockObjectClient {
    state: Arc<Mutex<State>>,
    denied: bool,
}

impl Default for MockObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

fn service_error(code: &str, message: &str, status: u16) -> S3Error {
    S3Error::Service {
        code: code.to_string(),
        message: message.to_string(),
        status: Some(status),
        ids: RequestIds::new(Some("MOCKREQUESTID"), Some("MOCKHOSTID")),
    }
}

impl MockObjectClient {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Create a new empty store whose injected failures follow `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new(seed))),
            denied: false,
        }
    }

    /// A client over the same store whose every call is denied
    pub fn denied_view(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            denied: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty bucket
    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.insert(bucket.to_string());
    }

    /// Record the region HeadBucket reports for `bucket`
    pub fn set_bucket_region(&self, bucket: &str, region: &str) {
        let mut state = self.lock();
        state.buckets.insert(bucket.to_string());
        state
            .bucket_regions
            .insert(bucket.to_string(), region.to_string());
    }

    /// Store an object, creating the bucket if needed
    pub fn put(&self, bucket: &str, key: &str, data: &[u8]) {
        self.lock().store(bucket, key, Bytes::copy_from_slice(data));
    }

    /// Content of an object
    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.to_vec())
    }

    /// ETag of an object
    pub fn etag(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.etag.clone())
    }

    /// Number of multipart uploads neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Number of calls made for `op`, including failed ones
    pub fn calls(&self, op: MockOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Fail the next `count` calls of `op` with `err`
    pub fn fail_next(&self, op: MockOp, count: usize, err: S3Error) {
        let mut state = self.lock();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    /// Fail this fraction of GETs with a transient 500
    pub fn set_get_failure_rate(&self, rate: f64) {
        self.lock().get_failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Cut this fraction of GET bodies short of their declared length
    pub fn set_get_truncation_rate(&self, rate: f64) {
        self.lock().get_truncation_rate = rate.clamp(0.0, 1.0);
    }

    /// Delay every GET response
    pub fn set_get_delay(&self, delay: Option<Duration>) {
        self.lock().get_delay = delay;
    }

    /// Return `pages` empty truncated pages before each real listing page
    pub fn set_empty_list_pages(&self, pages: usize) {
        self.lock().empty_list_pages = pages;
    }

    /// Request ids attached to successful GETs
    pub fn set_get_request_ids(&self, ids: RequestIds) {
        self.lock().get_request_ids = ids;
    }

    /// Replace `bucket/key` with `data` right after its `after_gets`-th GET
    pub fn overwrite_after_gets(&self, bucket: &str, key: &str, after_gets: usize, data: &[u8]) {
        self.lock().overwrite = Some(PendingOverwrite {
            bucket: bucket.to_string(),
            key: key.to_string(),
            after_gets,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn begin(&self, op: MockOp) -> S3Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if self.denied {
            return Err(service_error("AccessDenied", "Access Denied", 403));
        }
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl ObjectClient for MockObjectClient {
    async fn head_object(&self, bucket: &str, key: &str) -> S3Result<HeadObjectOutput> {
        let state = self.begin(MockOp::HeadObject)?;
        state.require_bucket(bucket)?;
        let obj = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| service_error("NotFound", "Not Found", 404))?;
        Ok(HeadObjectOutput {
            content_length: obj.data.len() as u64,
            etag: Some(obj.etag.clone()),
            last_modified: Some(obj.modified),
            ids: RequestIds::default(),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range_start: u64,
        _version_id: Option<&str>,
    ) -> S3Result<GetObjectOutput> {
        let delay = {
            let mut state = self.begin(MockOp::GetObject)?;
            let rate = state.get_failure_rate;
            if rate > 0.0 && state.rng.random_bool(rate) {
                return Err(service_error(
                    "InternalError",
                    "We encountered an internal error. Please try again.",
                    500,
                ));
            }
            state.get_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.require_bucket(bucket)?;
        let id = (bucket.to_string(), key.to_string());
        let obj = state
            .objects
            .get(&id)
            .cloned()
            .ok_or_else(|| service_error("NoSuchKey", "The specified key does not exist.", 404))?;

        let len = obj.data.len() as u64;
        if range_start >= len {
            return Err(service_error(
                "InvalidRange",
                "The requested range is not satisfiable",
                416,
            ));
        }

        let remaining = obj.data.slice(range_start as usize..);
        let content_length = remaining.len() as u64;
        let rate = state.get_truncation_rate;
        let body = if rate > 0.0 && remaining.len() > 1 && state.rng.random_bool(rate) {
            let cut = state.rng.random_range(0..remaining.len());
            remaining.slice(..cut)
        } else {
            remaining
        };

        let mut overwrite_now = false;
        if let Some(pending) = state.overwrite.as_mut() {
            if pending.bucket == bucket && pending.key == key {
                pending.after_gets = pending.after_gets.saturating_sub(1);
                overwrite_now = pending.after_gets == 0;
            }
        }
        if overwrite_now {
            if let Some(pending) = state.overwrite.take() {
                state.store(&pending.bucket, &pending.key, pending.data);
            }
        }

        Ok(GetObjectOutput {
            body: Box::pin(Cursor::new(body)),
            content_length,
            etag: Some(obj.etag),
            last_modified: Some(obj.modified),
            ids: state.get_request_ids.clone(),
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        _server_side_encryption: Option<&str>,
    ) -> S3Result<()> {
        let mut state = self.begin(MockOp::PutObject)?;
        state.require_bucket(bucket)?;
        state.store(bucket, key, body);
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        _server_side_encryption: Option<&str>,
    ) -> S3Result<String> {
        let mut state = self.begin(MockOp::CreateMultipartUpload)?;
        state.require_bucket(bucket)?;
        let upload_id = format!("upload-{}", state.next_id);
        state.next_id += 1;
        state.uploads.insert(
            upload_id.clone(),
            MockUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> S3Result<UploadPartInfo> {
        let mut state = self.begin(MockOp::UploadPart)?;
        if !(1..=10_000).contains(&part_number) {
            return Err(service_error(
                "InvalidArgument",
                "Part number must be an integer between 1 and 10000",
                400,
            ));
        }
        let etag = state.next_etag();
        let upload = state.uploads.get_mut(upload_id).ok_or_else(|| {
            service_error("NoSuchUpload", "The specified upload does not exist.", 404)
        })?;
        upload.parts.insert(part_number, (etag.clone(), body));
        Ok(UploadPartInfo { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadPartInfo],
    ) -> S3Result<()> {
        let mut state = self.begin(MockOp::CompleteMultipartUpload)?;
        let upload = state.uploads.get(upload_id).cloned().ok_or_else(|| {
            service_error("NoSuchUpload", "The specified upload does not exist.", 404)
        })?;
        if upload.bucket != bucket || upload.key != key {
            return Err(service_error("NoSuchUpload", "upload belongs to another key", 404));
        }
        if parts.is_empty() {
            return Err(service_error(
                "MalformedXML",
                "The XML you provided was not well-formed",
                400,
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(service_error(
                "InvalidPartOrder",
                "The list of parts was not in ascending order",
                400,
            ));
        }

        let mut data = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, body)) if *etag == part.etag => data.extend_from_slice(body),
                _ => {
                    return Err(service_error(
                        "InvalidPart",
                        "One or more of the specified parts could not be found",
                        400,
                    ))
                }
            }
        }

        state.uploads.remove(upload_id);
        state.store(bucket, key, Bytes::from(data));
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> S3Result<()> {
        let mut state = self.begin(MockOp::AbortMultipartUpload)?;
        state.uploads.remove(upload_id).map(|_| ()).ok_or_else(|| {
            service_error("NoSuchUpload", "The specified upload does not exist.", 404)
        })
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> S3Result<()> {
        let mut state = self.begin(MockOp::DeleteObject)?;
        state.require_bucket(bucket)?;
        state.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_objects_v2(&self, request: &ListObjectsRequest) -> S3Result<ListObjectsPage> {
        let state = self.begin(MockOp::ListObjectsV2)?;
        state.require_bucket(&request.bucket)?;

        // Sparse pages carry the caller's token forward unchanged.
        let empty_marker = "empty-page:";
        let token = request.continuation_token.clone().unwrap_or_default();
        let served_empty = token
            .strip_prefix(empty_marker)
            .and_then(|rest| rest.split_once(':'))
            .and_then(|(n, _)| n.parse::<usize>().ok())
            .unwrap_or(0);
        let resume_after = match token.strip_prefix(empty_marker) {
            Some(rest) => rest.split_once(':').map(|(_, t)| t.to_string()).unwrap_or_default(),
            None => token.clone(),
        };
        if served_empty < state.empty_list_pages {
            return Ok(ListObjectsPage {
                objects: Vec::new(),
                common_prefixes: Vec::new(),
                next_continuation_token: Some(format!(
                    "{}{}:{}",
                    empty_marker,
                    served_empty + 1,
                    resume_after
                )),
                is_truncated: true,
            });
        }

        let max_keys = request
            .max_keys
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_KEYS);
        let delimiter = request.delimiter.as_deref().filter(|d| !d.is_empty());
        let start_after = request.start_after.clone().unwrap_or_default();

        let mut page = ListObjectsPage::default();
        let mut emitted = 0;
        let mut last_prefix: Option<String> = None;
        let mut last_entry: Option<String> = None;
        let mut truncated = false;

        for ((bucket, key), obj) in state.objects.iter() {
            if *bucket != request.bucket || !key.starts_with(&request.prefix) {
                continue;
            }
            if *key <= start_after {
                continue;
            }
            if !resume_after.is_empty() {
                if *key <= resume_after {
                    continue;
                }
                if delimiter.is_some_and(|d| resume_after.ends_with(d))
                    && key.starts_with(&resume_after)
                {
                    continue;
                }
            }

            let common = delimiter.and_then(|d| {
                key[request.prefix.len()..]
                    .find(d)
                    .map(|i| key[..request.prefix.len() + i + d.len()].to_string())
            });
            if let Some(common) = &common {
                if last_prefix.as_deref() == Some(common.as_str()) {
                    continue;
                }
            }

            if emitted == max_keys {
                truncated = true;
                break;
            }
            emitted += 1;

            match common {
                Some(common) => {
                    page.common_prefixes.push(common.clone());
                    last_entry = Some(common.clone());
                    last_prefix = Some(common);
                }
                None => {
                    page.objects.push(ListedObject {
                        key: key.clone(),
                        size: obj.data.len() as u64,
                        last_modified: Some(obj.modified),
                        etag: Some(obj.etag.clone()),
                    });
                    last_entry = Some(key.clone());
                }
            }
        }

        if truncated {
            page.is_truncated = true;
            page.next_continuation_token = last_entry;
        }
        Ok(page)
    }

    async fn list_buckets(&self) -> S3Result<Vec<String>> {
        let state = self.begin(MockOp::ListBuckets)?;
        Ok(state.buckets.iter().cloned().collect())
    }

    async fn bucket_region(&self, bucket: &str) -> S3Result<String> {
        // Lets concurrent lookups overlap like real round trips.
        tokio::task::yield_now().await;
        let state = self.begin(MockOp::BucketRegion)?;
        state.require_bucket(bucket)?;
        Ok(state
            .bucket_regions
            .get(bucket)
            .cloned()
            .unwrap_or_else(|| "us-east-1".to_string()))
    }

    async fn presign(
        &self,
        method: PresignMethod,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> S3Result<String> {
        let _state = self.begin(MockOp::Presign)?;
        Ok(format!(
            "https://{}.s3.mock.local/{}?X-Amz-Method={}&X-Amz-Expires={}",
            bucket,
            key,
            method,
            expires_in.as_secs()
        ))
    }
}
