//! End-to-end tests of the S3 file engine against the in-memory store

use s3file::interface::{File, Implementation, ListOptions, Opts};
use s3file::s3::mock::{MockObjectClient, MockOp};
use s3file::s3::{BackoffConfig, ObjectClient, RetryPolicy, S3Implementation, StaticClientProvider};
use s3file::{ErrorKind, RetryConfig, S3Error, S3FileConfig};
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> S3FileConfig {
    S3FileConfig {
        read_chunk_size: 1000,
        upload_part_size: 1024,
        upload_parallelism: 4,
        ..Default::default()
    }
}

fn implementation(clients: Vec<Arc<dyn ObjectClient>>) -> S3Implementation {
    S3Implementation::new(Arc::new(StaticClientProvider::new(clients)), config())
}

fn single(mock: &MockObjectClient) -> S3Implementation {
    implementation(vec![Arc::new(mock.clone())])
}

fn junk() -> Vec<u8> {
    (0..1000)
        .map(|i| format!("D{}", i))
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes()
}

async fn write_file(s3: &S3Implementation, path: &str, data: &[u8], piece: usize) {
    let cancel = CancellationToken::new();
    let file = s3.create(&cancel, path, Opts::default()).await.unwrap();
    let mut writer = file.writer(cancel.clone());
    for chunk in data.chunks(piece.max(1)) {
        writer.write_all(chunk).await.unwrap();
    }
    file.close(&cancel).await.unwrap();
}

async fn read_file(s3: &S3Implementation, path: &str) -> Vec<u8> {
    let cancel = CancellationToken::new();
    let file = s3.open(&cancel, path, Opts::default()).await.unwrap();
    let mut out = Vec::new();
    file.reader(cancel.clone())
        .read_to_end(&mut out)
        .await
        .unwrap();
    file.close(&cancel).await.unwrap();
    out
}

#[tokio::test]
async fn test_write_read_round_trip_sizes() {
    let mock = MockObjectClient::new();
    mock.create_bucket("b");
    let s3 = single(&mock);

    for (i, len) in [0usize, 700, 1024 * 3 + 17].into_iter().enumerate() {
        let data: Vec<u8> = (0..len).map(|n| (n * 7 % 256) as u8).collect();
        let path = format!("s3://b/round/{}", i);
        write_file(&s3, &path, &data, 97).await;

        assert_eq!(mock.object("b", &format!("round/{}", i)).unwrap(), data);
        assert_eq!(read_file(&s3, &path).await, data, "length {}", len);
    }
    assert_eq!(mock.pending_uploads(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_junk_read_twice_with_failing_gets() {
    let mock = MockObjectClient::with_seed(42);
    let content = junk();
    assert_ne!(content.len() % 1000, 0);
    mock.put("b", "junk.txt", &content);
    mock.set_get_failure_rate(0.3);

    let s3 = single(&mock);
    let cancel = CancellationToken::new();
    let file = s3.open(&cancel, "s3://b/junk.txt", Opts::default()).await.unwrap();
    let mut reader = file.reader(cancel.clone());

    let mut first = Vec::new();
    reader.read_to_end(&mut first).await.unwrap();
    assert_eq!(reader.seek(SeekFrom::Start(0)).await.unwrap(), 0);
    let mut second = Vec::new();
    reader.read_to_end(&mut second).await.unwrap();

    assert_eq!(first, content);
    assert_eq!(second, content);
    assert!(mock.calls(MockOp::GetObject) > 10);
    file.close(&cancel).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_offset_reads_reassemble_object() {
    let mock = MockObjectClient::with_seed(7);
    let content = junk();
    mock.put("b", "junk.txt", &content);
    mock.set_get_truncation_rate(0.2);

    let s3 = single(&mock);
    let cancel = CancellationToken::new();
    let file = s3.open(&cancel, "s3://b/junk.txt", Opts::default()).await.unwrap();
    let reader = file.offset_reader(cancel.clone());

    for window in [1usize, 333, 1000, 2500, 6000] {
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let mut buf = vec![0u8; window];
            let n = reader.read_at(&mut buf, offset).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        assert_eq!(out, content, "window {}", window);
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_and_counted() {
    let mock = MockObjectClient::new();
    mock.put("b", "k", b"value");
    mock.fail_next(MockOp::HeadObject, 3, S3Error::service("SlowDown", "reduce rate"));

    let clients: Vec<Arc<dyn ObjectClient>> = vec![Arc::new(mock.clone())];
    let mut policy = RetryPolicy::new(clients, BackoffConfig::default(), Opts::default()).unwrap();
    let cancel = CancellationToken::new();
    let head = loop {
        let result = policy.client().head_object("b", "k").await;
        if !policy.should_retry(&cancel, &result, "head").await {
            break result.unwrap();
        }
    };
    assert_eq!(head.content_length, 5);
    assert_eq!(policy.retries(), 3);
    assert_eq!(mock.calls(MockOp::HeadObject), 4);
}

#[tokio::test(start_paused = true)]
async fn test_missing_key_is_not_retried() {
    let mock = MockObjectClient::new();
    mock.create_bucket("b");
    mock.fail_next(
        MockOp::HeadObject,
        2,
        S3Error::service("InternalError", "try again"),
    );
    let s3 = single(&mock);

    let err = s3
        .stat(&CancellationToken::new(), "s3://b/missing", Opts::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExist);
    // Two transient failures, then one permanent answer.
    assert_eq!(mock.calls(MockOp::HeadObject), 3);
    let message = err.to_string();
    assert!(message.contains("s3file.stat s3://b/missing"), "{}", message);
    assert!(message.contains("retries=2"), "{}", message);
    assert!(message.contains("MOCKREQUESTID"), "{}", message);
}

#[tokio::test]
async fn test_cancel_returns_promptly_and_handle_survives() {
    let mock = MockObjectClient::new();
    mock.put("b", "slow", b"eventually");
    let s3 = single(&mock);
    let file = s3
        .open(&CancellationToken::new(), "s3://b/slow", Opts::default())
        .await
        .unwrap();

    mock.set_get_delay(Some(Duration::from_secs(60)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let mut buf = [0u8; 10];
    let err = file
        .reader(cancel)
        .read(&mut buf)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(started.elapsed() < Duration::from_secs(10));

    mock.set_get_delay(None);
    let cancel = CancellationToken::new();
    let mut reader = file.reader(cancel.clone());
    assert_eq!(reader.read(&mut buf).await.unwrap(), 10);
    assert_eq!(&buf, b"eventually");
    file.close(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_overwrite_during_read_is_precondition() {
    let mock = MockObjectClient::new();
    let content = junk();
    mock.put("b", "junk.txt", &content);
    let mut replacement = content.clone();
    replacement.reverse();
    mock.overwrite_after_gets("b", "junk.txt", 1, &replacement);

    let s3 = single(&mock);
    let cancel = CancellationToken::new();
    let file = s3.open(&cancel, "s3://b/junk.txt", Opts::default()).await.unwrap();
    let mut buf = vec![0u8; content.len()];
    let err = file.read(&cancel, &mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("ETag changed"));
}

#[tokio::test]
async fn test_listing_path_boundaries() {
    let mock = MockObjectClient::new();
    for key in ["foo/bar", "foo/bar/baz", "foo/barbaz", "foo/sub/x", "foo/sub/y/z"] {
        mock.put("b", key, b"-");
    }
    let s3 = single(&mock);
    let cancel = CancellationToken::new();

    let recursive = ListOptions {
        recurse: true,
        ..Default::default()
    };
    let entries = s3
        .list("s3://b/foo/bar", recursive)
        .unwrap()
        .collect_all(&cancel)
        .await
        .unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["s3://b/foo/bar", "s3://b/foo/bar/baz"]);

    let entries = s3
        .list("s3://b/foo/", ListOptions::default())
        .unwrap()
        .collect_all(&cancel)
        .await
        .unwrap();
    let sub = entries
        .iter()
        .find(|e| e.path == "s3://b/foo/sub")
        .unwrap();
    assert!(sub.is_dir);
    assert!(sub.info.is_none());
    assert!(entries.iter().all(|e| !e.path.starts_with("s3://b/foo/sub/")));
}

#[tokio::test]
async fn test_denied_credentials_fall_back_to_next_client() {
    let mock = MockObjectClient::new();
    mock.put("b", "shared", b"visible to one credential set");
    let s3 = implementation(vec![Arc::new(mock.denied_view()), Arc::new(mock.clone())]);

    assert_eq!(
        read_file(&s3, "s3://b/shared").await,
        b"visible to one credential set".to_vec()
    );
    // Three parts of the 1024 byte part size; once created, the upload
    // sticks to the client that accepted it.
    let data: Vec<u8> = (0..3000).map(|i| (i % 256) as u8).collect();
    write_file(&s3, "s3://b/new", &data, 500).await;
    assert_eq!(mock.object("b", "new").unwrap(), data);
    assert_eq!(mock.calls(MockOp::UploadPart), 3);
    assert_eq!(mock.calls(MockOp::CompleteMultipartUpload), 1);
}

#[tokio::test]
async fn test_bucket_listing_unions_clients() {
    let first = MockObjectClient::new();
    first.create_bucket("logs");
    first.create_bucket("data");
    let second = MockObjectClient::new();
    second.create_bucket("archive");
    second.create_bucket("data");
    let s3 = implementation(vec![
        Arc::new(first.denied_view()),
        Arc::new(first),
        Arc::new(second),
    ]);

    let entries = s3
        .list("s3://", ListOptions::default())
        .unwrap()
        .collect_all(&CancellationToken::new())
        .await
        .unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["s3://archive", "s3://data", "s3://logs"]);
    assert!(entries.iter().all(|e| e.is_dir));
}

#[tokio::test]
async fn test_discard_leaves_no_object() {
    let mock = MockObjectClient::new();
    mock.create_bucket("b");
    let s3 = single(&mock);
    let cancel = CancellationToken::new();

    let file = s3.create(&cancel, "s3://b/tmp", Opts::default()).await.unwrap();
    file.writer(cancel.clone())
        .write_all(&[1u8; 5000])
        .await
        .unwrap();
    file.discard(&cancel).await.unwrap();

    assert!(mock.object("b", "tmp").is_none());
    assert_eq!(mock.pending_uploads(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_read_error_carries_retry_count() {
    let mock = MockObjectClient::new();
    mock.put("b", "k", b"small object");
    let s3 = single(&mock);
    let cancel = CancellationToken::new();
    let file = s3.open(&cancel, "s3://b/k", Opts::default()).await.unwrap();

    mock.fail_next(MockOp::GetObject, 2, S3Error::service("SlowDown", "reduce your request rate"));
    mock.fail_next(MockOp::GetObject, 1, S3Error::service("AccessDenied", "Access Denied"));
    let mut reader = file.reader(cancel.clone());
    let mut out = Vec::new();
    let err = reader.read_to_end(&mut out).await.unwrap_err();

    assert!(out.is_empty());
    assert_eq!(err.code(), Some("AccessDenied"));
    let msg = err.to_string();
    assert!(msg.contains("s3file.read s3://b/k"), "{}", msg);
    assert!(msg.contains("retries=2"), "{}", msg);
    assert_eq!(mock.calls(MockOp::GetObject), 3);
    assert_eq!(s3.metrics().snapshot()["read"].retries, [0, 1, 0, 0]);

    // Nothing was read, so the position is still 0.
    let err = reader.seek(SeekFrom::Current(-1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Invalid);
    assert_eq!(reader.seek(SeekFrom::End(-5)).await.unwrap(), 7);
    let mut tail = Vec::new();
    reader.read_to_end(&mut tail).await.unwrap();
    assert_eq!(tail, b"bject".to_vec());
    file.close(&cancel).await.unwrap();
}

#[tokio::test]
async fn test_permanent_part_failure_fails_close_and_aborts() {
    let mock = MockObjectClient::new();
    mock.create_bucket("b");
    mock.fail_next(MockOp::UploadPart, 1, S3Error::service("AccessDenied", "Access Denied"));
    let s3 = single(&mock);
    let cancel = CancellationToken::new();

    let file = s3.create(&cancel, "s3://b/out", Opts::default()).await.unwrap();
    let mut writer = file.writer(cancel.clone());
    for chunk in vec![7u8; 3000].chunks(500) {
        // Later writes may already see the failed part.
        if writer.write_all(chunk).await.is_err() {
            break;
        }
    }
    let err = file.close(&cancel).await.unwrap_err();

    assert_eq!(err.code(), Some("AccessDenied"));
    assert!(err.to_string().contains("retries=0"), "{}", err);
    assert!(mock.object("b", "out").is_none());
    assert_eq!(mock.pending_uploads(), 0);
    assert_eq!(mock.calls(MockOp::CompleteMultipartUpload), 0);
    assert_eq!(mock.calls(MockOp::AbortMultipartUpload), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_deadline_ends_stat() {
    let mock = MockObjectClient::new();
    mock.put("b", "k", b"x");
    mock.fail_next(MockOp::HeadObject, 10, S3Error::service("SlowDown", "reduce your request rate"));
    let config = S3FileConfig {
        retry: RetryConfig {
            initial_backoff_ms: 500,
            max_backoff_ms: 1000,
            backoff_factor: 2.0,
            jitter: 0.0,
            max_retry_duration_secs: 2,
        },
        ..config()
    };
    let s3 = S3Implementation::new(
        Arc::new(StaticClientProvider::single(Arc::new(mock.clone()))),
        config,
    );

    let err = s3
        .stat(&CancellationToken::new(), "s3://b/k", Opts::default())
        .await
        .unwrap_err();

    // Waits of 500ms and 1s fit in two seconds; a third 1s wait does not.
    assert_eq!(mock.calls(MockOp::HeadObject), 3);
    assert!(err.is_transient());
    let msg = err.to_string();
    assert!(msg.contains("retry deadline"), "{}", msg);
    assert!(msg.contains("retries=2"), "{}", msg);
}
