//! Type definitions for S3 operations

use crate::error::{RequestIds, S3Error, S3Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use tokio::io::AsyncRead;

/// Metadata snapshot of one object version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Object size in bytes
    pub size: u64,

    /// Last modified timestamp
    pub mod_time: Option<DateTime<Utc>>,

    /// ETag, used only as a version token
    pub etag: String,
}

/// Result of a HeadObject call
#[derive(Debug, Clone, Default)]
pub struct HeadObjectOutput {
    pub content_length: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub ids: RequestIds,
}

/// Body stream of a GetObject call
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// Result of a ranged GetObject call
pub struct GetObjectOutput {
    pub body: ObjectBody,

    /// Bytes remaining in the body (not the whole object size)
    pub content_length: u64,

    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub ids: RequestIds,
}

impl fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("content_length", &self.content_length)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

/// Parameters of one ListObjectsV2 page request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: Option<i32>,
}

/// One object returned by ListObjectsV2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// One page of ListObjectsV2 results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsPage {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub next_continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// A completed multipart part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPartInfo {
    /// 1-based part number
    pub part_number: i32,
    pub etag: String,
}

/// HTTP methods that can be presigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresignMethod {
    Get,
    Put,
    Delete,
}

impl FromStr for PresignMethod {
    type Err = S3Error;

    fn from_str(s: &str) -> S3Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(PresignMethod::Get),
            "PUT" => Ok(PresignMethod::Put),
            "DELETE" => Ok(PresignMethod::Delete),
            other => Err(S3Error::NotSupported(format!(
                "presign for method {} is not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for PresignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
            PresignMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Convert an SDK timestamp
pub(crate) fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    std::time::SystemTime::try_from(*dt).ok().map(DateTime::<Utc>::from)
}
