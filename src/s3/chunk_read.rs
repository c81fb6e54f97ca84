//! Parallel ranged reads
//!
//! [`ChunkedReader::read_at`] splits the destination buffer into fixed-size
//! sub-ranges and reads them concurrently, one ranged GET each, retrying every
//! sub-range under its own [`RetryPolicy`](super::recovery::RetryPolicy).
//! All sub-ranges must observe the same ETag; otherwise the read fails with a
//! precondition error instead of returning a mix of two object versions.
//!
//! The body reader of the last sub-range stays open between calls so a
//! sequential caller continues on the same HTTP response.

use super::client::ObjectClient;
use super::recovery::{with_cancel, PolicyFactory};
use super::types::{ObjectBody, ObjectInfo};
use crate::error::{RequestIds, S3Error, S3Result};
use futures::future::join_all;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Short bodies tolerated in a row before the policy gets a say
const MAX_CONSECUTIVE_EOFS: u32 = 8;

/// Result of one [`ChunkedReader::read_at`] call
///
/// A failed call still reports how many bytes at the start of the buffer
/// were filled before the first gap.
#[derive(Debug, Clone)]
pub struct ReadAtOutput {
    /// Bytes filled contiguously from the start of the buffer
    pub n: usize,

    /// Metadata observed by the sub-range reads, if any GET succeeded
    pub info: Option<ObjectInfo>,

    /// The object ended before the buffer was filled
    pub eof: bool,

    /// First sub-range failure, if any
    pub error: Option<S3Error>,
}

impl ReadAtOutput {
    /// Drop the partial count and surface the failure, if there was one
    pub fn into_result(mut self) -> S3Result<Self> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// An open GET body and its position in the object
struct PosReader {
    body: ObjectBody,
    offset: u64,
    ids: RequestIds,
    info: ObjectInfo,
}

impl PosReader {
    /// Open a body at `offset`; `None` means `offset` is at or past the end.
    async fn open(
        client: Arc<dyn ObjectClient>,
        bucket: &str,
        key: &str,
        version_id: Option<&str>,
        offset: u64,
    ) -> S3Result<Option<PosReader>> {
        let output = match client.get_object(bucket, key, offset, version_id).await {
            Ok(output) => output,
            Err(err) if err.code() == Some("InvalidRange") => return Ok(None),
            Err(err) => return Err(err),
        };
        let etag = output.etag.ok_or_else(|| {
            S3Error::Sdk(format!("GET s3://{}/{} returned no ETag", bucket, key))
        })?;

        Ok(Some(PosReader {
            body: output.body,
            offset,
            ids: output.ids,
            info: ObjectInfo {
                size: offset + output.content_length,
                mod_time: output.last_modified,
                etag,
            },
        }))
    }
}

enum ReadEnd {
    Eof,
    Failed(S3Error),
}

async fn read_full(
    cancel: &CancellationToken,
    reader: &mut PosReader,
    buf: &mut [u8],
) -> (usize, Result<(), ReadEnd>) {
    let mut filled = 0;
    while filled < buf.len() {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return (filled, Err(ReadEnd::Failed(S3Error::Canceled("read body".to_string()))));
            }
            read = reader.body.read(&mut buf[filled..]) => read,
        };
        match read {
            Ok(0) => return (filled, Err(ReadEnd::Eof)),
            Ok(n) => {
                filled += n;
                reader.offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return (filled, Err(ReadEnd::Eof))
            }
            Err(e) => return (filled, Err(ReadEnd::Failed(S3Error::from(e)))),
        }
    }
    (filled, Ok(()))
}

struct Chunk<'a> {
    /// Position of `dst[0]` in the object
    s3_offset: u64,
    dst: &'a mut [u8],
    filled: usize,
    reader: Option<PosReader>,
}

struct ChunkOutcome {
    filled: usize,
    len: usize,
    reader: Option<PosReader>,
    result: S3Result<()>,
}

/// The object being read and how to reach it
struct Target {
    name: String,
    bucket: String,
    key: String,
    version_id: Option<String>,
    policies: PolicyFactory,
}

/// Positional reader over one object; not safe for concurrent use
pub struct ChunkedReader {
    target: Target,
    chunk_size: usize,
    previous: Option<PosReader>,
}

impl ChunkedReader {
    pub fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        version_id: Option<String>,
        chunk_size: usize,
        policies: PolicyFactory,
    ) -> Self {
        Self {
            target: Target {
                name: name.into(),
                bucket: bucket.into(),
                key: key.into(),
                version_id,
                policies,
            },
            chunk_size: chunk_size.max(1),
            previous: None,
        }
    }

    /// Whether a body from an earlier call is being kept for reuse
    pub fn has_open_reader(&self) -> bool {
        self.previous.is_some()
    }

    /// Drop the kept body, if any
    pub fn close(&mut self) {
        self.previous = None;
    }

    /// Fill `dst` with object bytes starting at `offset`
    pub async fn read_at(
        &mut self,
        cancel: &CancellationToken,
        dst: &mut [u8],
        offset: u64,
    ) -> ReadAtOutput {
        if dst.is_empty() {
            return ReadAtOutput {
                n: 0,
                info: None,
                eof: false,
                error: None,
            };
        }

        let mut chunks: Vec<Chunk<'_>> = Vec::new();
        let mut chunk_offset = offset;
        for dst in dst.chunks_mut(self.chunk_size) {
            let len = dst.len() as u64;
            chunks.push(Chunk {
                s3_offset: chunk_offset,
                dst,
                filled: 0,
                reader: None,
            });
            chunk_offset += len;
        }
        // The first chunk may continue where the previous call stopped.
        if let Some(first) = chunks.first_mut() {
            first.reader = self.previous.take();
        }

        let info: Mutex<Option<ObjectInfo>> = Mutex::new(None);
        let last = chunks.len() - 1;
        let target = &self.target;
        let outcomes = join_all(
            chunks
                .into_iter()
                .enumerate()
                .map(|(i, chunk)| target.read_chunk(cancel, &info, chunk, i == last)),
        )
        .await;

        let mut n = 0;
        let mut eof = false;
        let mut error = None;
        let mut previous = None;
        let mut short_seen = false;
        for (i, outcome) in outcomes.into_iter().enumerate() {
            if i == last {
                previous = outcome.reader;
            }
            if !short_seen {
                n += outcome.filled;
                if outcome.filled < outcome.len {
                    short_seen = true;
                    // A chunk cut short by an error is a gap, not the end.
                    eof = outcome.result.is_ok();
                }
            }
            if let Err(e) = outcome.result {
                if error.is_none() {
                    error = Some(e);
                }
            }
        }
        self.previous = previous;
        if error.is_some() {
            eof = false;
        }

        ReadAtOutput {
            n,
            info: info.into_inner().unwrap_or_else(PoisonError::into_inner),
            eof,
            error,
        }
    }
}

impl Target {
    async fn read_chunk(
        &self,
        cancel: &CancellationToken,
        info: &Mutex<Option<ObjectInfo>>,
        mut chunk: Chunk<'_>,
        keep_reader: bool,
    ) -> ChunkOutcome {
        let mut policy = self.policies.policy_for("read");
        let mut pending: Option<ReadEnd> = None;
        let mut eofs = 0u32;
        let mut last_ids = RequestIds::default();

        let result: S3Result<()> = loop {
            match pending.take() {
                None => {}
                Some(ReadEnd::Eof) if eofs < MAX_CONSECUTIVE_EOFS => {
                    // Bodies sometimes end early although the object has more bytes.
                    eofs += 1;
                    debug!(name = %self.name, offset = chunk.s3_offset, "short body, reopening");
                }
                Some(ReadEnd::Eof) => {
                    eofs = 0;
                    let result: S3Result<()> = Err(S3Error::Io(format!(
                        "body ended early {} times in a row",
                        MAX_CONSECUTIVE_EOFS
                    )));
                    if !policy.should_retry(cancel, &result, &self.name).await {
                        break result;
                    }
                }
                Some(ReadEnd::Failed(err)) => {
                    let result: S3Result<()> = Err(err);
                    if !policy.should_retry(cancel, &result, &self.name).await {
                        break result;
                    }
                }
            }

            if chunk.filled == chunk.dst.len() {
                break Ok(());
            }
            let range_start = chunk.s3_offset + chunk.filled as u64;

            if !matches!(&chunk.reader, Some(r) if r.offset == range_start) {
                chunk.reader = None;
                let open = PosReader::open(
                    policy.client(),
                    &self.bucket,
                    &self.key,
                    self.version_id.as_deref(),
                    range_start,
                );
                match with_cancel(cancel, "open range", open).await {
                    Ok(Some(reader)) => {
                        last_ids = reader.ids.clone();
                        chunk.reader = Some(reader);
                    }
                    // At or past the end of the object: this chunk is done.
                    Ok(None) => break Ok(()),
                    Err(err) => {
                        pending = Some(ReadEnd::Failed(err));
                        continue;
                    }
                }
            }
            let reader = match chunk.reader.as_mut() {
                Some(reader) => reader,
                None => continue,
            };

            let size = {
                let mut seen = info.lock().unwrap_or_else(PoisonError::into_inner);
                match seen.as_ref() {
                    None => {
                        *seen = Some(reader.info.clone());
                        Ok(reader.info.size)
                    }
                    Some(first) if first.etag != reader.info.etag => Err(S3Error::Precondition(
                        format!(
                            "read {}: ETag changed from {} to {}",
                            self.name, first.etag, reader.info.etag
                        ),
                    )),
                    Some(first) => Ok(first.size),
                }
            };
            let size = match size {
                Ok(size) => size,
                Err(err) => {
                    pending = Some(ReadEnd::Failed(err));
                    continue;
                }
            };

            let until_eof = size.saturating_sub(range_start);
            if until_eof == 0 {
                break Ok(());
            }
            let remaining = chunk.dst.len() - chunk.filled;
            let want = remaining.min(usize::try_from(until_eof).unwrap_or(usize::MAX));
            let start = chunk.filled;
            let (n, read) = read_full(cancel, reader, &mut chunk.dst[start..start + want]).await;
            chunk.filled += n;
            if n > 0 {
                eofs = 0;
            }
            match read {
                Ok(()) => break Ok(()),
                Err(end) => {
                    // Retry on a fresh request, which may reach another host.
                    chunk.reader = None;
                    pending = Some(end);
                }
            }
        };

        let result = result.map_err(|err| {
            let mut err = policy.annotate(err, format!("s3file.read {}", self.name));
            if let S3Error::Annotated { ids, .. } = &mut err {
                if ids.is_empty() {
                    *ids = last_ids;
                }
            }
            err
        });
        policy.record_bytes(chunk.filled);

        ChunkOutcome {
            filled: chunk.filled,
            len: chunk.dst.len(),
            reader: if keep_reader { chunk.reader } else { None },
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::interface::Opts;
    use crate::s3::mock::{MockObjectClient, MockOp};
    use crate::s3::recovery::BackoffConfig;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reader(mock: &MockObjectClient, chunk_size: usize) -> ChunkedReader {
        let factory = PolicyFactory::new(
            vec![Arc::new(mock.clone()) as Arc<dyn ObjectClient>],
            BackoffConfig::default(),
            Opts::default(),
        )
        .unwrap();
        ChunkedReader::new("s3://b/obj", "b", "obj", None, chunk_size, factory)
    }

    #[tokio::test]
    async fn test_read_whole_object_various_chunk_sizes() {
        let data = content(1000);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        let cancel = CancellationToken::new();

        for chunk_size in [1, 7, 100, 333, 1000, 4096] {
            let mut r = reader(&mock, chunk_size);
            let mut buf = vec![0u8; 1000];
            let out = r.read_at(&cancel, &mut buf, 0).await.into_result().unwrap();
            assert_eq!(out.n, 1000, "chunk size {}", chunk_size);
            assert!(!out.eof);
            assert_eq!(buf, data, "chunk size {}", chunk_size);
            assert_eq!(out.info.unwrap().size, 1000);
        }
    }

    #[tokio::test]
    async fn test_read_past_end_reports_eof() {
        let data = content(100);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 16);

        let mut buf = vec![0u8; 64];
        let out = r.read_at(&cancel, &mut buf, 60).await.into_result().unwrap();
        assert_eq!(out.n, 40);
        assert!(out.eof);
        assert_eq!(&buf[..40], &data[60..]);

        let out = r.read_at(&cancel, &mut buf, 100).await.into_result().unwrap();
        assert_eq!(out.n, 0);
        assert!(out.eof);

        let out = r.read_at(&cancel, &mut buf, 5000).await.into_result().unwrap();
        assert_eq!(out.n, 0);
        assert!(out.eof);
    }

    #[tokio::test]
    async fn test_sequential_reads_reuse_body() {
        let data = content(300);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 1024);

        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; 50];
            let res = r.read_at(&cancel, &mut buf, offset).await.into_result().unwrap();
            out.extend_from_slice(&buf[..res.n]);
            offset += res.n as u64;
            if res.eof {
                break;
            }
        }
        assert_eq!(out, data);
        assert_eq!(mock.calls(MockOp::GetObject), 1);
        assert!(r.has_open_reader());
    }

    #[tokio::test]
    async fn test_random_access_reopens() {
        let data = content(300);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 1024);

        let mut buf = vec![0u8; 10];
        r.read_at(&cancel, &mut buf, 200).await.into_result().unwrap();
        assert_eq!(buf, &data[200..210]);
        r.read_at(&cancel, &mut buf, 10).await.into_result().unwrap();
        assert_eq!(buf, &data[10..20]);
        assert_eq!(mock.calls(MockOp::GetObject), 2);

        r.close();
        assert!(!r.has_open_reader());
    }

    #[tokio::test]
    async fn test_etag_change_is_precondition_failure() {
        let data = content(100);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        let replacement: Vec<u8> = data.iter().map(|b| !b).collect();
        mock.overwrite_after_gets("b", "obj", 1, &replacement);
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 10);

        let mut buf = vec![0u8; 100];
        let err = r.read_at(&cancel, &mut buf, 0).await.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(err.to_string().contains("ETag changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let data = content(500);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        mock.fail_next(
            MockOp::GetObject,
            3,
            S3Error::service("SlowDown", "Please reduce your request rate."),
        );
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 128);

        let mut buf = vec![0u8; 500];
        let out = r.read_at(&cancel, &mut buf, 0).await.into_result().unwrap();
        assert_eq!(out.n, 500);
        assert_eq!(buf, data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_bodies_are_retried() {
        let data = content(2000);
        let mock = MockObjectClient::with_seed(7);
        mock.put("b", "obj", &data);
        mock.set_get_truncation_rate(0.5);
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 256);

        let mut buf = vec![0u8; 2000];
        let out = r.read_at(&cancel, &mut buf, 0).await.into_result().unwrap();
        assert_eq!(out.n, 2000);
        assert_eq!(buf, data);
    }

    #[tokio::test]
    async fn test_failed_read_reports_contiguous_prefix() {
        let data = content(12);
        let mock = MockObjectClient::new();
        mock.put("b", "obj", &data);
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 4);

        let mut head = vec![0u8; 4];
        r.read_at(&cancel, &mut head, 0).await.into_result().unwrap();
        assert!(r.has_open_reader());

        // The first chunk continues on the kept body; the second needs a GET.
        mock.fail_next(MockOp::GetObject, 1, S3Error::service("AccessDenied", "denied"));
        let mut buf = vec![0u8; 8];
        let out = r.read_at(&cancel, &mut buf, 4).await;
        assert_eq!(out.n, 4);
        assert!(!out.eof);
        assert_eq!(&buf[..4], &data[4..8]);
        assert_eq!(out.error.unwrap().kind(), ErrorKind::NotAllowed);
        assert_eq!(mock.calls(MockOp::GetObject), 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_retried() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 1024);

        let mut buf = vec![0u8; 10];
        let err = r.read_at(&cancel, &mut buf, 0).await.into_result().unwrap_err();
        assert!(err.is_not_exist());
        assert_eq!(mock.calls(MockOp::GetObject), 1);
        assert!(matches!(err, S3Error::Annotated { retries: 0, .. }));
    }

    #[tokio::test]
    async fn test_request_ids_on_error() {
        let mock = MockObjectClient::new();
        mock.create_bucket("b");
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 1024);

        let mut buf = vec![0u8; 10];
        let err = r.read_at(&cancel, &mut buf, 0).await.into_result().unwrap_err();
        let ids = err.request_ids().unwrap();
        assert_eq!(ids.request_id.as_deref(), Some("MOCKREQUESTID"));
    }

    #[tokio::test]
    async fn test_empty_buffer() {
        let mock = MockObjectClient::new();
        let cancel = CancellationToken::new();
        let mut r = reader(&mock, 1024);
        let out = r.read_at(&cancel, &mut [], 0).await;
        assert!(out.error.is_none());
        assert_eq!(out.n, 0);
        assert!(out.info.is_none());
        assert_eq!(mock.calls(MockOp::GetObject), 0);
    }
}
