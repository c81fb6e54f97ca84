//! S3-backed file engine
//!
//! Files are opened through [`S3Implementation`], which resolves clients per
//! bucket region, starts one actor task per open handle and maps reads, writes
//! and listings onto ranged GETs, multipart uploads and ListObjectsV2 calls.
//! Every call goes through a [`RetryPolicy`] that absorbs transient failures.
//!
//! # Examples
//!
//! ## Read an object
//!
//! ```ignore
//! use s3file::interface::{File, Implementation, Opts};
//! use s3file::s3::S3Implementation;
//! use s3file::S3FileConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let s3 = S3Implementation::from_config(S3FileConfig::default())?;
//!     let cancel = CancellationToken::new();
//!
//!     let file = s3.open(&cancel, "s3://my-bucket/data/input.csv", Opts::default()).await?;
//!     let mut content = Vec::new();
//!     file.reader(cancel.clone()).read_to_end(&mut content).await?;
//!     file.close(&cancel).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Write an object against MinIO
//!
//! ```ignore
//! use s3file::interface::{File, Implementation, Opts};
//! use s3file::s3::S3Implementation;
//! use s3file::S3FileConfigBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = S3FileConfigBuilder::new()
//!         .endpoint("http://localhost:9000")
//!         .region("us-east-1")
//!         .force_path_style(true)
//!         .credentials("minioadmin", "minioadmin")
//!         .build()?;
//!     let s3 = S3Implementation::from_config(config)?;
//!     let cancel = CancellationToken::new();
//!
//!     let file = s3.create(&cancel, "s3://my-bucket/out.bin", Opts::default()).await?;
//!     file.writer(cancel.clone()).write_all(b"hello").await?;
//!     file.close(&cancel).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod chunk_read;
pub mod client;
pub mod file;
pub mod implementation;
pub mod list;
pub mod metrics;
pub mod mock;
pub mod multipart;
pub mod provider;
pub mod recovery;
pub mod types;

pub use cache::{BucketRegionCache, ClientCache, ClientFactory};
pub use chunk_read::{ChunkedReader, ReadAtOutput};
pub use client::{AwsObjectClient, ObjectClient};
pub use file::{Mode, ReadReply, S3File, S3OffsetReader, S3Reader, S3Writer};
pub use implementation::S3Implementation;
pub use list::{list_all_buckets, Lister};
pub use metrics::{Metrics, OpSnapshot};
pub use multipart::{BufferPool, Uploader};
pub use provider::{
    ClientProvider, DefaultClientProvider, DefaultSessionProvider, Session, SessionProvider,
    StaticClientProvider, StaticSessionProvider,
};
pub use recovery::{BackoffConfig, PolicyFactory, RetryPolicy};
pub use types::{ObjectInfo, PresignMethod, UploadPartInfo};
