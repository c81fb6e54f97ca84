//! Generic file interface implemented by the S3 engine
//!
//! A file layer that dispatches by URL scheme talks to storage through
//! [`Implementation`] (open/create/stat/list/remove/presign) and to open
//! handles through [`File`]. Every call takes a
//! [`CancellationToken`](tokio_util::sync::CancellationToken); canceling it
//! abandons that one call without invalidating the handle.

use crate::error::S3Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-call options for open/create/close
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Opts {
    /// Keep retrying while the object does not exist yet (eventual consistency)
    pub retry_when_not_found: bool,

    /// Treat `NoSuchUpload` on completion as success (a retried complete already succeeded)
    pub ignore_no_such_upload: bool,
}

/// Metadata of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Full `s3://bucket/key` path
    pub name: String,

    pub size: u64,

    pub mod_time: Option<DateTime<Utc>>,

    /// ETag of the object version this info describes
    pub etag: String,
}

/// One listing result: a file or a pseudo-directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Full path, without a trailing `/` for directories
    pub path: String,

    pub is_dir: bool,

    /// Present for files only
    pub info: Option<FileInfo>,
}

/// Options for [`Implementation::list`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Descend into subdirectories instead of reporting them
    pub recurse: bool,

    /// Only return keys after this one (relative to the listed prefix)
    pub start_after: Option<String>,

    /// Requested page size
    pub batch_size_hint: Option<usize>,
}

/// An open file handle
#[async_trait]
pub trait File: Send + Sync + Sized {
    type Reader: Send;
    type Writer: Send;
    type OffsetReader: Send;

    /// Path given to open/create
    fn name(&self) -> &str;

    /// Sequential reader sharing the handle position
    fn reader(&self, cancel: CancellationToken) -> Self::Reader;

    /// Sequential writer (write handles only)
    fn writer(&self, cancel: CancellationToken) -> Self::Writer;

    /// Positional reader that ignores the handle position
    fn offset_reader(&self, cancel: CancellationToken) -> Self::OffsetReader;

    async fn stat(&self, cancel: &CancellationToken) -> S3Result<FileInfo>;

    async fn seek(&self, cancel: &CancellationToken, pos: SeekFrom) -> S3Result<u64>;

    /// Commit the file (finishes uploads) and release the handle
    async fn close(self, cancel: &CancellationToken) -> S3Result<()>;

    /// Abandon a write handle without creating the object
    async fn discard(self, cancel: &CancellationToken) -> S3Result<()>;
}

/// Storage operations for one URL scheme
#[async_trait]
pub trait Implementation: Send + Sync {
    type File: File;
    type Lister: Send;

    async fn open(
        &self,
        cancel: &CancellationToken,
        path: &str,
        opts: Opts,
    ) -> S3Result<Self::File>;

    async fn create(
        &self,
        cancel: &CancellationToken,
        path: &str,
        opts: Opts,
    ) -> S3Result<Self::File>;

    async fn stat(&self, cancel: &CancellationToken, path: &str, opts: Opts)
        -> S3Result<FileInfo>;

    fn list(&self, path: &str, options: ListOptions) -> S3Result<Self::Lister>;

    async fn remove(&self, cancel: &CancellationToken, path: &str) -> S3Result<()>;

    async fn presign(
        &self,
        cancel: &CancellationToken,
        path: &str,
        method: &str,
        expiry: Duration,
    ) -> S3Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opts_default() {
        let opts = Opts::default();
        assert!(!opts.retry_when_not_found);
        assert!(!opts.ignore_no_such_upload);
    }

    #[test]
    fn test_list_options_default() {
        let options = ListOptions::default();
        assert!(!options.recurse);
        assert!(options.start_after.is_none());
        assert!(options.batch_size_hint.is_none());
    }
}
