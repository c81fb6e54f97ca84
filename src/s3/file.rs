//! Open S3 file handles
//!
//! Every [`S3File`] owns one actor task that holds the mutable state of the
//! handle (position, metadata, chunked reader, uploader) and executes
//! requests strictly in arrival order. Callers send a [`Request`] with a
//! one-shot reply channel and wait for the reply or their own cancellation,
//! whichever comes first. A canceled caller returns immediately; the actor
//! still drains the request, and the handle stays usable.

use super::chunk_read::ChunkedReader;
use super::multipart::Uploader;
use super::recovery::{with_cancel, PolicyFactory};
use crate::error::{S3Error, S3Result};
use crate::interface::{File, FileInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read size used by [`S3Reader::read_to_end`]
const READ_TO_END_CHUNK: usize = 8 * 1024 * 1024;

/// Access mode of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

/// Operation carried by a [`Request`], with its reply channel
pub enum Op {
    Seek {
        pos: SeekFrom,
        reply: oneshot::Sender<S3Result<u64>>,
    },
    /// Read up to `len` bytes at `at`, or at the handle position if `None`
    Read {
        len: usize,
        at: Option<u64>,
        reply: oneshot::Sender<S3Result<ReadReply>>,
    },
    Write {
        data: Bytes,
        reply: oneshot::Sender<S3Result<usize>>,
    },
    Stat {
        reply: oneshot::Sender<S3Result<FileInfo>>,
    },
    Close {
        reply: oneshot::Sender<S3Result<()>>,
    },
    Abort {
        reply: oneshot::Sender<S3Result<()>>,
    },
}

/// Bytes delivered by a read and the failure that cut it short, if any
#[derive(Debug, Default)]
pub struct ReadReply {
    pub data: Vec<u8>,
    pub error: Option<S3Error>,
}

impl ReadReply {
    fn failed(error: S3Error) -> Self {
        Self {
            data: Vec::new(),
            error: Some(error),
        }
    }
}

/// One call on a handle
pub struct Request {
    pub cancel: CancellationToken,
    pub op: Op,
}

/// HEAD an object and build its metadata
///
/// A missing or empty ETag, or a zero-length object whose key ends in `/`
/// (a directory marker), is reported as not existing.
pub(crate) async fn stat_object(
    cancel: &CancellationToken,
    policies: &PolicyFactory,
    name: &str,
    bucket: &str,
    key: &str,
) -> S3Result<FileInfo> {
    if key.is_empty() {
        return Err(S3Error::Invalid(format!("stat {}: empty key", name)));
    }

    let mut policy = policies.policy_for("stat");
    let output = loop {
        let client = policy.client();
        let result = with_cancel(cancel, "stat", client.head_object(bucket, key)).await;
        if !policy.should_retry(cancel, &result, name).await {
            break result.map_err(|e| policy.annotate(e, format!("s3file.stat {}", name)))?;
        }
    };

    let etag = match output.etag {
        Some(etag) if !etag.is_empty() => etag,
        _ => {
            return Err(S3Error::NotFound(format!(
                "stat {}: object has no ETag [{}]",
                name, output.ids
            )))
        }
    };
    if output.content_length == 0 && key.ends_with('/') {
        return Err(S3Error::NotFound(format!(
            "stat {}: directory marker",
            name
        )));
    }

    Ok(FileInfo {
        name: name.to_string(),
        size: output.content_length,
        mod_time: output.last_modified,
        etag,
    })
}

/// State owned by the actor task of one handle
pub(crate) struct FileState {
    name: String,
    bucket: String,
    key: String,
    mode: Mode,
    policies: PolicyFactory,
    chunk_size: usize,
    // Never negative; non-zero only once `info` is known.
    position: u64,
    info: Option<FileInfo>,
    reader: Option<ChunkedReader>,
    uploader: Option<Uploader>,
}

impl FileState {
    pub(crate) fn for_read(
        name: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        policies: PolicyFactory,
        chunk_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            key: key.into(),
            mode: Mode::Read,
            policies,
            chunk_size,
            position: 0,
            info: None,
            reader: None,
            uploader: None,
        }
    }

    pub(crate) fn for_write(
        name: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        policies: PolicyFactory,
        uploader: Uploader,
    ) -> Self {
        Self {
            name: name.into(),
            bucket: bucket.into(),
            key: key.into(),
            mode: Mode::Write,
            policies,
            chunk_size: 0,
            position: 0,
            info: None,
            reader: None,
            uploader: Some(uploader),
        }
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        while let Some(Request { cancel, op }) = requests.recv().await {
            // A send error means the caller gave up waiting; nothing to do.
            match op {
                Op::Seek { pos, reply } => {
                    let _ = reply.send(self.seek(pos));
                }
                Op::Read { len, at, reply } => {
                    let _ = reply.send(Ok(self.read(&cancel, len, at).await));
                }
                Op::Write { data, reply } => {
                    let _ = reply.send(self.write(data).await);
                }
                Op::Stat { reply } => {
                    let _ = reply.send(self.stat(&cancel).await);
                }
                Op::Close { reply } => {
                    let _ = reply.send(self.close(&cancel).await);
                    return;
                }
                Op::Abort { reply } => {
                    let _ = reply.send(self.abort(&cancel).await);
                    return;
                }
            }
        }

        if let Some(mut uploader) = self.uploader.take() {
            warn!(name = %self.name, "file dropped without close, aborting upload");
            let _ = uploader.abort(&CancellationToken::new()).await;
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> S3Result<u64> {
        if self.mode != Mode::Read {
            return Err(S3Error::NotSupported(format!(
                "seek {}: file is not opened in read mode",
                self.name
            )));
        }
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => {
                let info = self.info.as_ref().ok_or_else(|| {
                    S3Error::Invalid(format!("seek {}: size not known yet", self.name))
                })?;
                i128::from(info.size) + i128::from(delta)
            }
        };
        let target = u64::try_from(target).map_err(|_| {
            S3Error::Invalid(format!("seek {}: out-of-bounds seek to {}", self.name, target))
        })?;

        if target != self.position {
            self.position = target;
            if let Some(reader) = self.reader.as_mut() {
                reader.close();
            }
        }
        Ok(self.position)
    }

    /// Read at `at`, or at the position, which advances by the bytes
    /// delivered even when the read fails part way
    async fn read(&mut self, cancel: &CancellationToken, len: usize, at: Option<u64>) -> ReadReply {
        if self.mode != Mode::Read {
            return ReadReply::failed(S3Error::NotSupported(format!(
                "read {}: file is not opened in read mode",
                self.name
            )));
        }
        let info = match &self.info {
            Some(info) => info.clone(),
            None => match self.stat(cancel).await {
                Ok(info) => info,
                Err(err) => return ReadReply::failed(err),
            },
        };

        let offset = at.unwrap_or(self.position);
        if len == 0 || offset >= info.size {
            return ReadReply::default();
        }
        let want = usize::try_from(info.size - offset).map_or(len, |left| left.min(len));
        let mut buf = vec![0u8; want];

        let reader = self.reader.get_or_insert_with(|| {
            ChunkedReader::new(
                self.name.clone(),
                self.bucket.clone(),
                self.key.clone(),
                None,
                self.chunk_size,
                self.policies.clone(),
            )
        });
        let output = reader.read_at(cancel, &mut buf, offset).await;
        if let Some(seen) = &output.info {
            if seen.etag != info.etag {
                return ReadReply::failed(S3Error::Precondition(format!(
                    "read {}: ETag changed from {} to {}",
                    self.name, info.etag, seen.etag
                )));
            }
        }

        buf.truncate(output.n);
        if at.is_none() {
            self.position += output.n as u64;
        }
        ReadReply {
            data: buf,
            error: output.error,
        }
    }

    async fn write(&mut self, data: Bytes) -> S3Result<usize> {
        let uploader = self.uploader.as_mut().ok_or_else(|| {
            S3Error::NotSupported(format!(
                "write {}: file is not opened in write mode",
                self.name
            ))
        })?;
        uploader.write(&data).await?;
        Ok(data.len())
    }

    async fn stat(&mut self, cancel: &CancellationToken) -> S3Result<FileInfo> {
        if self.mode != Mode::Read {
            return Err(S3Error::NotSupported(format!(
                "stat {}: not supported for files opened for writing",
                self.name
            )));
        }
        if let Some(info) = &self.info {
            return Ok(info.clone());
        }
        let info = stat_object(cancel, &self.policies, &self.name, &self.bucket, &self.key).await?;
        self.info = Some(info.clone());
        Ok(info)
    }

    async fn close(&mut self, cancel: &CancellationToken) -> S3Result<()> {
        if let Some(reader) = self.reader.as_mut() {
            reader.close();
        }
        match self.uploader.take() {
            Some(mut uploader) => {
                let result = uploader.finish(cancel).await;
                debug!(name = %self.name, ok = result.is_ok(), "closed write handle");
                result
            }
            None => Ok(()),
        }
    }

    async fn abort(&mut self, cancel: &CancellationToken) -> S3Result<()> {
        match self.uploader.take() {
            Some(mut uploader) => uploader.abort(cancel).await,
            None => Ok(()),
        }
    }
}

/// Sending side of a handle, shared by the handle and its readers/writers
#[derive(Clone)]
struct Handle {
    name: Arc<str>,
    requests: mpsc::Sender<Request>,
}

impl Handle {
    async fn run_request<T>(
        &self,
        cancel: &CancellationToken,
        make: impl FnOnce(oneshot::Sender<S3Result<T>>) -> Op,
    ) -> S3Result<T> {
        let (tx, rx) = oneshot::channel();
        let request = Request {
            cancel: cancel.clone(),
            op: make(tx),
        };

        let sent = with_cancel(cancel, &self.name, async {
            self.requests
                .send(request)
                .await
                .map_err(|_| S3Error::Closed(format!("{}: file is closed", self.name)))
        })
        .await;
        sent.map_err(|e| canceled_request(&self.name, e))?;

        let reply = with_cancel(cancel, &self.name, async {
            rx.await
                .map_err(|_| S3Error::Closed(format!("{}: file actor stopped", self.name)))
        })
        .await;
        reply.map_err(|e| canceled_request(&self.name, e))?
    }
}

fn canceled_request(name: &str, err: S3Error) -> S3Error {
    if err.is_canceled() {
        S3Error::Canceled(format!("{}: request canceled", name))
    } else {
        err
    }
}

/// An open S3 object, for reading or for writing
pub struct S3File {
    handle: Handle,
    mode: Mode,
}

impl S3File {
    /// Start the actor task for `state`
    pub(crate) fn spawn(state: FileState, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let mode = state.mode;
        let handle = Handle {
            name: Arc::from(state.name.as_str()),
            requests: tx,
        };
        tokio::spawn(state.run(rx));
        Self { handle, mode }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Read up to `buf.len()` bytes at the handle position; 0 means end of file
    ///
    /// A read that fails after filling part of `buf` returns
    /// [`S3Error::PartialRead`] and still advances the position past those bytes.
    pub async fn read(&self, cancel: &CancellationToken, buf: &mut [u8]) -> S3Result<usize> {
        read_into(&self.handle, cancel, buf, None).await
    }

    /// Read up to `buf.len()` bytes at `offset` without moving the position
    pub async fn read_at(
        &self,
        cancel: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> S3Result<usize> {
        read_into(&self.handle, cancel, buf, Some(offset)).await
    }

    /// Queue `data` for upload
    pub async fn write(&self, cancel: &CancellationToken, data: &[u8]) -> S3Result<usize> {
        write_from(&self.handle, cancel, data).await
    }
}

async fn read_into(
    handle: &Handle,
    cancel: &CancellationToken,
    buf: &mut [u8],
    at: Option<u64>,
) -> S3Result<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let len = buf.len();
    let ReadReply { data, error } = handle
        .run_request(cancel, |reply| Op::Read { len, at, reply })
        .await?;
    buf[..data.len()].copy_from_slice(&data);
    match error {
        None => Ok(data.len()),
        Some(err) if data.is_empty() => Err(err),
        Some(err) => Err(S3Error::PartialRead {
            n: data.len(),
            source: Box::new(err),
        }),
    }
}

async fn write_from(handle: &Handle, cancel: &CancellationToken, data: &[u8]) -> S3Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let data = Bytes::copy_from_slice(data);
    handle
        .run_request(cancel, |reply| Op::Write { data, reply })
        .await
}

/// Sequential reader sharing the handle position
pub struct S3Reader {
    handle: Handle,
    cancel: CancellationToken,
}

impl S3Reader {
    /// Read into `buf`; returns 0 at end of file
    pub async fn read(&mut self, buf: &mut [u8]) -> S3Result<usize> {
        read_into(&self.handle, &self.cancel, buf, None).await
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> S3Result<u64> {
        self.handle
            .run_request(&self.cancel, |reply| Op::Seek { pos, reply })
            .await
    }

    /// Read until end of file, appending to `out`
    ///
    /// On failure `out` keeps every byte delivered before the error.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> S3Result<usize> {
        let start = out.len();
        loop {
            let ReadReply { data, error } = self
                .handle
                .run_request(&self.cancel, |reply| Op::Read {
                    len: READ_TO_END_CHUNK,
                    at: None,
                    reply,
                })
                .await?;
            out.extend_from_slice(&data);
            if let Some(err) = error {
                return Err(err);
            }
            if data.is_empty() {
                return Ok(out.len() - start);
            }
        }
    }
}

/// Writer feeding the handle's multipart upload
pub struct S3Writer {
    handle: Handle,
    cancel: CancellationToken,
}

impl S3Writer {
    pub async fn write(&mut self, data: &[u8]) -> S3Result<usize> {
        write_from(&self.handle, &self.cancel, data).await
    }

    pub async fn write_all(&mut self, data: &[u8]) -> S3Result<()> {
        let n = self.write(data).await?;
        if n != data.len() {
            return Err(S3Error::Io(format!(
                "{}: short write of {} of {} bytes",
                self.handle.name,
                n,
                data.len()
            )));
        }
        Ok(())
    }
}

/// Positional reader that leaves the handle position alone
pub struct S3OffsetReader {
    handle: Handle,
    cancel: CancellationToken,
}

impl S3OffsetReader {
    /// Read into `buf` from `offset`; returns 0 at or past end of file
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> S3Result<usize> {
        read_into(&self.handle, &self.cancel, buf, Some(offset)).await
    }
}

#[async_trait]
impl File for S3File {
    type Reader = S3Reader;
    type Writer = S3Writer;
    type OffsetReader = S3OffsetReader;

    fn name(&self) -> &str {
        &self.handle.name
    }

    fn reader(&self, cancel: CancellationToken) -> S3Reader {
        S3Reader {
            handle: self.handle.clone(),
            cancel,
        }
    }

    fn writer(&self, cancel: CancellationToken) -> S3Writer {
        S3Writer {
            handle: self.handle.clone(),
            cancel,
        }
    }

    fn offset_reader(&self, cancel: CancellationToken) -> S3OffsetReader {
        S3OffsetReader {
            handle: self.handle.clone(),
            cancel,
        }
    }

    async fn stat(&self, cancel: &CancellationToken) -> S3Result<FileInfo> {
        self.handle
            .run_request(cancel, |reply| Op::Stat { reply })
            .await
    }

    async fn seek(&self, cancel: &CancellationToken, pos: SeekFrom) -> S3Result<u64> {
        self.handle
            .run_request(cancel, |reply| Op::Seek { pos, reply })
            .await
    }

    async fn close(self, cancel: &CancellationToken) -> S3Result<()> {
        self.handle
            .run_request(cancel, |reply| Op::Close { reply })
            .await
    }

    async fn discard(self, cancel: &CancellationToken) -> S3Result<()> {
        if self.mode != Mode::Write {
            return Ok(());
        }
        self.handle
            .run_request(cancel, |reply| Op::Abort { reply })
            .await
    }
}
