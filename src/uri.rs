/*!
 * S3 URL parsing
 */

use crate::error::{S3Error, S3Result};
use std::fmt;

/// URL scheme handled by this crate
pub const SCHEME: &str = "s3";

/// A parsed `s3://bucket/key` path
///
/// The bucket is everything up to the first `/` after the scheme and the key
/// is everything after it, verbatim. `s3://bucket` has an empty key and
/// `s3://` has an empty bucket (the listing root).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S3Path {
    pub bucket: String,
    pub key: String,
}

impl S3Path {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse an `s3://` URL
    pub fn parse(url: &str) -> S3Result<Self> {
        let (bucket, key) = parse_url(url)?;
        Ok(Self { bucket, key })
    }

    /// Whether this path names no bucket at all
    pub fn is_root(&self) -> bool {
        self.bucket.is_empty()
    }
}

impl fmt::Display for S3Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", SCHEME, self.bucket)
        } else {
            write!(f, "{}://{}/{}", SCHEME, self.bucket, self.key)
        }
    }
}

/// Split an `s3://bucket/key` URL into bucket and key
pub fn parse_url(url: &str) -> S3Result<(String, String)> {
    let parts: Vec<&str> = url.splitn(2, "://").collect();
    if parts.len() != 2 {
        return Err(S3Error::Invalid(format!("{}: not an s3 URL", url)));
    }
    if parts[0] != SCHEME {
        return Err(S3Error::Invalid(format!(
            "{}: scheme must be {}, found {}",
            url, SCHEME, parts[0]
        )));
    }

    let rest = parts[1];
    match rest.split_once('/') {
        Some((bucket, key)) => Ok((bucket.to_string(), key.to_string())),
        None => Ok((rest.to_string(), String::new())),
    }
}
