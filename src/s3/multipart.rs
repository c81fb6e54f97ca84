//! Multipart upload pipeline
//!
//! [`Uploader`] buffers writes into part-sized buffers and hands full
//! buffers to a fixed pool of worker tasks over a bounded channel. Part
//! numbers start at 1 and are never reused, even for parts that failed.
//! [`Uploader::finish`] waits for the workers and completes the upload with
//! the parts sorted by number, or aborts it if any part failed.
//!
//! An empty file cannot be completed as a multipart upload (S3 rejects an
//! empty part list), so it is written with a single empty PutObject instead.

use super::recovery::{with_cancel, PolicyFactory};
use super::types::UploadPartInfo;
use crate::config::{S3FileConfig, MIN_UPLOAD_PART_SIZE};
use crate::error::{S3Error, S3Result};
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Recycles part buffers across the parts of one upload
#[derive(Debug, Clone)]
pub struct BufferPool {
    buffers: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Vec::new())),
            buffer_size,
        }
    }

    /// An empty buffer with room for one part
    pub fn get(&self) -> Vec<u8> {
        let recycled = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.buffer_size),
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(buf);
    }

    /// Buffers currently idle in the pool
    pub fn idle(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct PartJob {
    part_number: i32,
    body: Vec<u8>,
}

/// State shared between the uploader and its workers
struct Shared {
    name: String,
    bucket: String,
    key: String,
    upload_id: String,
    policies: PolicyFactory,
    /// Canceled on abort so workers stop retrying
    cancel: CancellationToken,
    pool: BufferPool,
    parts: Mutex<Vec<UploadPartInfo>>,
    error: Mutex<Option<S3Error>>,
}

impl Shared {
    fn failed(&self) -> Option<S3Error> {
        self.error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_error(&self, err: S3Error) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    async fn upload_part(&self, part_number: i32, body: Bytes) -> S3Result<UploadPartInfo> {
        let mut policy = self.policies.policy_for("write");
        policy.record_bytes(body.len());
        loop {
            let client = policy.client();
            let upload = client.upload_part(
                &self.bucket,
                &self.key,
                &self.upload_id,
                part_number,
                body.clone(),
            );
            let result = with_cancel(&self.cancel, "upload part", upload).await;
            if !policy.should_retry(&self.cancel, &result, &self.name).await {
                return result.map_err(|e| {
                    policy.annotate(e, format!("s3file.write {} part {}", self.name, part_number))
                });
            }
        }
    }

    async fn run_worker(self: Arc<Self>, jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<PartJob>>>) {
        loop {
            let job = jobs.lock().await.recv().await;
            let Some(PartJob { part_number, body }) = job else {
                break;
            };

            // After a failure the remaining parts are pointless; only recycle.
            if self.failed().is_some() {
                self.pool.put(body);
                continue;
            }

            let body = Bytes::from(body);
            match self.upload_part(part_number, body.clone()).await {
                Ok(part) => {
                    debug!(name = %self.name, part_number, "uploaded part");
                    self.parts
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(part);
                }
                Err(err) => self.record_error(err),
            }
            self.pool.put(Vec::from(body));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Open,
    Finished,
    Aborted,
}

/// Drives one multipart upload from a stream of writes
pub struct Uploader {
    shared: Arc<Shared>,
    part_size: usize,
    server_side_encryption: Option<String>,
    ignore_no_such_upload: bool,
    cur_buf: Vec<u8>,
    next_part: i32,
    jobs: Option<mpsc::Sender<PartJob>>,
    workers: JoinSet<()>,
    state: UploadState,
}

impl Uploader {
    /// Start a multipart upload for `bucket/key`
    pub async fn new(
        cancel: &CancellationToken,
        name: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        policies: PolicyFactory,
        config: &S3FileConfig,
    ) -> S3Result<Self> {
        let name = name.into();
        let bucket = bucket.into();
        let key = key.into();
        let part_size = config.upload_part_size.max(1);
        let parallelism = config.upload_parallelism.max(1);
        if part_size < MIN_UPLOAD_PART_SIZE {
            warn!(
                name = %name,
                part_size,
                "part size is below the S3 minimum; multi-part objects will be rejected"
            );
        }

        let mut policy = policies.policy();
        let upload_id = loop {
            let client = policy.client();
            let create = client.create_multipart_upload(
                &bucket,
                &key,
                config.server_side_encryption.as_deref(),
            );
            let result = with_cancel(cancel, "create upload", create).await;
            if !policy.should_retry(cancel, &result, &name).await {
                break result.map_err(|e| policy.annotate(e, format!("s3file.create {}", name)))?;
            }
        };
        debug!(name = %name, upload_id = %upload_id, "started multipart upload");
        // Upload ids are only known to the endpoint that created them.
        let policies = policies.pinned(policy.client());

        let ignore_no_such_upload = policies.opts().ignore_no_such_upload;
        let shared = Arc::new(Shared {
            name,
            bucket,
            key,
            upload_id,
            policies,
            cancel: CancellationToken::new(),
            pool: BufferPool::new(part_size),
            parts: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel(parallelism);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = JoinSet::new();
        for _ in 0..parallelism {
            workers.spawn(Arc::clone(&shared).run_worker(Arc::clone(&rx)));
        }

        Ok(Self {
            shared,
            part_size,
            server_side_encryption: config.server_side_encryption.clone(),
            ignore_no_such_upload,
            cur_buf: Vec::new(),
            next_part: 1,
            jobs: Some(tx),
            workers,
            state: UploadState::Open,
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.shared.upload_id
    }

    /// Buffer `data`, queueing every part that fills up
    ///
    /// Fails fast once any earlier part has failed.
    pub async fn write(&mut self, mut data: &[u8]) -> S3Result<()> {
        self.ensure_open()?;
        if let Some(err) = self.shared.failed() {
            return Err(err);
        }
        while !data.is_empty() {
            if self.cur_buf.capacity() == 0 {
                self.cur_buf = self.shared.pool.get();
            }
            let room = self.part_size - self.cur_buf.len();
            let n = room.min(data.len());
            self.cur_buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.cur_buf.len() == self.part_size {
                self.flush_part().await?;
            }
        }
        Ok(())
    }

    async fn flush_part(&mut self) -> S3Result<()> {
        let body = std::mem::take(&mut self.cur_buf);
        let part_number = self.next_part;
        self.next_part += 1;

        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| S3Error::Invalid(format!("{}: upload is closed", self.shared.name)))?;
        jobs.send(PartJob { part_number, body })
            .await
            .map_err(|_| S3Error::Closed(format!("{}: upload workers stopped", self.shared.name)))
    }

    /// Upload the final partial part and complete the upload
    ///
    /// On any failure the upload is aborted and the original error returned.
    pub async fn finish(&mut self, cancel: &CancellationToken) -> S3Result<()> {
        self.ensure_open()?;
        let result = self.finish_inner(cancel).await;
        match result {
            Ok(()) => {
                self.state = UploadState::Finished;
                Ok(())
            }
            Err(err) => {
                // The abort reports its own failure; the caller sees the original.
                // It runs even if `cancel` already fired.
                let _ = self.abort(&CancellationToken::new()).await;
                Err(err)
            }
        }
    }

    async fn finish_inner(&mut self, cancel: &CancellationToken) -> S3Result<()> {
        if !self.cur_buf.is_empty() {
            self.flush_part().await?;
        }
        self.drain_workers().await;
        if let Some(err) = self.shared.failed() {
            return Err(err);
        }

        let mut parts = std::mem::take(
            &mut *self
                .shared
                .parts
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        parts.sort_by_key(|p| p.part_number);

        if parts.is_empty() {
            return self.put_empty(cancel).await;
        }

        let shared = &self.shared;
        let mut policy = shared.policies.policy();
        loop {
            let client = policy.client();
            let complete = client.complete_multipart_upload(
                &shared.bucket,
                &shared.key,
                &shared.upload_id,
                &parts,
            );
            let result = with_cancel(cancel, "complete upload", complete).await;
            if let Err(err) = &result {
                if self.ignore_no_such_upload && err.code() == Some("NoSuchUpload") {
                    warn!(
                        name = %shared.name,
                        upload_id = %shared.upload_id,
                        "upload already gone on completion, assuming an earlier attempt succeeded"
                    );
                    return Ok(());
                }
            }
            if !policy.should_retry(cancel, &result, &shared.name).await {
                return result
                    .map_err(|e| policy.annotate(e, format!("s3file.close {}", shared.name)));
            }
        }
    }

    async fn put_empty(&mut self, cancel: &CancellationToken) -> S3Result<()> {
        self.abort_upload(cancel).await?;
        let shared = &self.shared;
        let mut policy = shared.policies.policy();
        loop {
            let client = policy.client();
            let put = client.put_object(
                &shared.bucket,
                &shared.key,
                Bytes::new(),
                self.server_side_encryption.as_deref(),
            );
            let result = with_cancel(cancel, "put empty object", put).await;
            if !policy.should_retry(cancel, &result, &shared.name).await {
                return result
                    .map_err(|e| policy.annotate(e, format!("s3file.close {}", shared.name)));
            }
        }
    }

    /// Abandon the upload; safe to call more than once
    pub async fn abort(&mut self, cancel: &CancellationToken) -> S3Result<()> {
        if self.state == UploadState::Aborted {
            return Ok(());
        }
        self.state = UploadState::Aborted;
        self.shared.cancel.cancel();
        self.jobs = None;
        self.workers.shutdown().await;

        let result = self.abort_upload(cancel).await;
        if let Err(err) = &result {
            error!(
                name = %self.shared.name,
                upload_id = %self.shared.upload_id,
                error = %err,
                "failed to abort multipart upload"
            );
        }
        result
    }

    async fn abort_upload(&self, cancel: &CancellationToken) -> S3Result<()> {
        let shared = &self.shared;
        let mut policy = shared.policies.policy();
        loop {
            let client = policy.client();
            let abort =
                client.abort_multipart_upload(&shared.bucket, &shared.key, &shared.upload_id);
            let result = match with_cancel(cancel, "abort upload", abort).await {
                Err(err) if err.code() == Some("NoSuchUpload") => Ok(()),
                other => other,
            };
            if !policy.should_retry(cancel, &result, &shared.name).await {
                return result
                    .map_err(|e| policy.annotate(e, format!("s3file.abort {}", shared.name)));
            }
        }
    }

    async fn drain_workers(&mut self) {
        self.jobs = None;
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                self.shared
                    .record_error(S3Error::Sdk(format!("upload worker failed: {}", err)));
            }
        }
    }

    fn ensure_open(&self) -> S3Result<()> {
        match self.state {
            UploadState::Open => Ok(()),
            UploadState::Finished => Err(S3Error::Invalid(format!(
                "{}: upload already completed",
                self.shared.name
            ))),
            UploadState::Aborted => Err(S3Error::Invalid(format!(
                "{}: upload was aborted",
                self.shared.name
            ))),
        }
    }
}
