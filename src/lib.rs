/*!
 * s3file - S3 objects as files
 *
 * An async file abstraction over S3-compatible object stores with:
 * - Positional and sequential reads over parallel ranged GETs
 * - Writes through concurrent multipart uploads
 * - ETag checks that reject reads torn by concurrent overwrites
 * - Retry with jittered exponential backoff and credential fallback
 * - Per-handle request actors with per-call cancellation
 * - Directory-style listings synthesized from common prefixes
 */

pub mod config;
pub mod error;
pub mod interface;
pub mod logging;
pub mod s3;
pub mod uri;

// Re-export commonly used types
pub use config::{LogLevel, RetryConfig, S3FileConfig, S3FileConfigBuilder};
pub use error::{ErrorKind, RequestIds, S3Error, S3Result};
pub use interface::{File, FileInfo, Implementation, ListEntry, ListOptions, Opts};
pub use s3::S3Implementation;
pub use uri::{parse_url, S3Path};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
