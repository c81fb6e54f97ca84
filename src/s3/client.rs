//! S3 client seam
//!
//! [`ObjectClient`] is the narrow set of S3 REST calls the file engine needs.
//! [`AwsObjectClient`] implements it over `aws-sdk-s3`; tests substitute
//! [`MockObjectClient`](super::mock::MockObjectClient).

use super::types::{
    to_chrono, GetObjectOutput, HeadObjectOutput, ListObjectsPage, ListObjectsRequest,
    ListedObject, PresignMethod, UploadPartInfo,
};
use crate::config::S3FileConfig;
use crate::error::{RequestIds, S3Error, S3Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::operation::{RequestId, RequestIdExt};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use aws_sdk_s3::Client as AwsS3Client;
use bytes::Bytes;
use std::time::Duration;

/// Response header carrying a bucket's home region
const BUCKET_REGION_HEADER: &str = "x-amz-bucket-region";

/// The S3 REST operations used by the file engine
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> S3Result<HeadObjectOutput>;

    /// GET with `Range: bytes=<range_start>-`
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range_start: u64,
        version_id: Option<&str>,
    ) -> S3Result<GetObjectOutput>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        server_side_encryption: Option<&str>,
    ) -> S3Result<()>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        server_side_encryption: Option<&str>,
    ) -> S3Result<String>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> S3Result<UploadPartInfo>;

    /// Finish a multipart upload. `parts` must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadPartInfo],
    ) -> S3Result<()>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
        -> S3Result<()>;

    async fn delete_object(&self, bucket: &str, key: &str) -> S3Result<()>;

    async fn list_objects_v2(&self, request: &ListObjectsRequest) -> S3Result<ListObjectsPage>;

    /// Names of all buckets visible to this client's credentials
    async fn list_buckets(&self) -> S3Result<Vec<String>>;

    /// Home region of a bucket
    async fn bucket_region(&self, bucket: &str) -> S3Result<String>;

    /// Presigned URL for `method` on `bucket/key`
    async fn presign(
        &self,
        method: PresignMethod,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> S3Result<String>;
}

/// Load the shared AWS configuration (credentials chain, profile, default region)
///
/// # Example
///
/// ```no_run
/// use s3file::config::S3FileConfig;
/// use s3file::s3::client::load_sdk_config;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = S3FileConfig::default();
///     let sdk_config = load_sdk_config(&config).await;
///     println!("region: {:?}", sdk_config.region());
///     Ok(())
/// }
/// ```
pub async fn load_sdk_config(config: &S3FileConfig) -> SdkConfig {
    let mut aws_config_loader = aws_config::defaults(BehaviorVersion::latest());

    let region_provider = match &config.region {
        Some(region) => RegionProviderChain::first_try(Region::new(region.clone())),
        None => RegionProviderChain::default_provider()
            .or_else(Region::new(config.default_region.clone())),
    };
    aws_config_loader = aws_config_loader.region(region_provider);

    if let Some(profile) = &config.profile {
        aws_config_loader = aws_config_loader.profile_name(profile);
    }

    // Set explicit credentials if provided
    if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
        let credentials = Credentials::new(
            access_key,
            secret_key,
            config.session_token.clone(),
            None,
            "s3file-explicit",
        );
        aws_config_loader = aws_config_loader.credentials_provider(credentials);
    }

    aws_config_loader.load().await
}

/// [`ObjectClient`] backed by `aws-sdk-s3`
#[derive(Clone, Debug)]
pub struct AwsObjectClient {
    client: AwsS3Client,
    region: String,
}

impl AwsObjectClient {
    /// Build a client for `region` from a shared SDK configuration
    pub fn new(sdk_config: &SdkConfig, config: &S3FileConfig, region: &str) -> Self {
        let mut s3_config_builder =
            aws_sdk_s3::config::Builder::from(sdk_config).region(Region::new(region.to_string()));

        // Set custom endpoint if provided
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        // Force path-style addressing if configured (required for MinIO, LocalStack)
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let timeout_config = aws_sdk_s3::config::timeout::TimeoutConfig::builder()
            .operation_timeout(config.timeout())
            .build();
        s3_config_builder = s3_config_builder.timeout_config(timeout_config);

        Self {
            client: AwsS3Client::from_conf(s3_config_builder.build()),
            region: region.to_string(),
        }
    }

    /// Get a reference to the underlying AWS S3 client
    pub fn aws_client(&self) -> &AwsS3Client {
        &self.client
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl ObjectClient for AwsObjectClient {
    async fn head_object(&self, bucket: &str, key: &str) -> S3Result<HeadObjectOutput> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(S3Error::from)?;

        Ok(HeadObjectOutput {
            content_length: output.content_length().unwrap_or(0).max(0) as u64,
            etag: output.e_tag().map(str::to_string),
            last_modified: output.last_modified().and_then(to_chrono),
            ids: RequestIds::new(output.request_id(), output.extended_request_id()),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range_start: u64,
        version_id: Option<&str>,
    ) -> S3Result<GetObjectOutput> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={}-", range_start))
            .set_version_id(version_id.map(str::to_string))
            .send()
            .await
            .map_err(S3Error::from)?;

        let content_length = output.content_length().unwrap_or(0).max(0) as u64;
        let etag = output.e_tag().map(str::to_string);
        let last_modified = output.last_modified().and_then(to_chrono);
        let ids = RequestIds::new(output.request_id(), output.extended_request_id());

        Ok(GetObjectOutput {
            body: Box::pin(output.body.into_async_read()),
            content_length,
            etag,
            last_modified,
            ids,
        })
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        server_side_encryption: Option<&str>,
    ) -> S3Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .set_server_side_encryption(server_side_encryption.map(ServerSideEncryption::from))
            .send()
            .await
            .map_err(S3Error::from)?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        server_side_encryption: Option<&str>,
    ) -> S3Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_server_side_encryption(server_side_encryption.map(ServerSideEncryption::from))
            .send()
            .await
            .map_err(S3Error::from)?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| S3Error::Sdk("CreateMultipartUpload returned no upload id".to_string()))
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> S3Result<UploadPartInfo> {
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(S3Error::from)?;

        Ok(UploadPartInfo {
            part_number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[UploadPartInfo],
    ) -> S3Result<()> {
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(S3Error::from)?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> S3Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(S3Error::from)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> S3Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(S3Error::from)?;
        Ok(())
    }

    async fn list_objects_v2(&self, request: &ListObjectsRequest) -> S3Result<ListObjectsPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.continuation_token.clone())
            .set_start_after(request.start_after.clone())
            .set_max_keys(request.max_keys)
            .send()
            .await
            .map_err(S3Error::from)?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ListedObject {
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().and_then(to_chrono),
                    etag: obj.e_tag().map(str::to_string),
                })
            })
            .collect();

        let common_prefixes = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        Ok(ListObjectsPage {
            objects,
            common_prefixes,
            next_continuation_token: output.next_continuation_token().map(str::to_string),
            is_truncated: output.is_truncated().unwrap_or(false),
        })
    }

    async fn list_buckets(&self) -> S3Result<Vec<String>> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(S3Error::from)?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn bucket_region(&self, bucket: &str) -> S3Result<String> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(output) => output.bucket_region().map(str::to_string).ok_or_else(|| {
                S3Error::Sdk(format!("HeadBucket {} returned no region", bucket))
            }),
            Err(e) => {
                // Redirects and 403s still name the bucket's region.
                let region = e
                    .raw_response()
                    .and_then(|raw| raw.headers().get(BUCKET_REGION_HEADER))
                    .map(str::to_string);
                match region {
                    Some(region) if !region.is_empty() => Ok(region),
                    _ => Err(S3Error::from(e)),
                }
            }
        }
    }

    async fn presign(
        &self,
        method: PresignMethod,
        bucket: &str,
        key: &str,
        expires_in: Duration,
    ) -> S3Result<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| S3Error::Invalid(format!("presign expiry {:?}: {}", expires_in, e)))?;

        let request = match method {
            PresignMethod::Get => self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .presigned(presigning)
                .await
                .map_err(S3Error::from)?,
            PresignMethod::Put => self
                .client
                .put_object()
                .bucket(bucket)
                .key(key)
                .presigned(presigning)
                .await
                .map_err(S3Error::from)?,
            PresignMethod::Delete => self
                .client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .presigned(presigning)
                .await
                .map_err(S3Error::from)?,
        };

        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_sdk_config() -> SdkConfig {
        SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-west-2"))
            .credentials_provider(aws_sdk_s3::config::SharedCredentialsProvider::new(
                Credentials::new("AKIDEXAMPLE", "secret", None, None, "test"),
            ))
            .build()
    }

    #[tokio::test]
    async fn test_client_creation() {
        let config = S3FileConfig::default();
        let client = AwsObjectClient::new(&static_sdk_config(), &config, "eu-central-1");
        assert_eq!(client.region(), "eu-central-1");
        assert_eq!(
            client.aws_client().config().region().map(|r| r.as_ref()),
            Some("eu-central-1")
        );
    }

    #[tokio::test]
    async fn test_presign_get_is_offline() {
        let config = S3FileConfig::default();
        let client = AwsObjectClient::new(&static_sdk_config(), &config, "us-west-2");

        let url = client
            .presign(
                PresignMethod::Get,
                "my-bucket",
                "dir/file.txt",
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        assert!(url.contains("my-bucket"));
        assert!(url.contains("dir/file.txt"));
        assert!(url.contains("X-Amz-Expires=600"));
    }

    #[tokio::test]
    async fn test_presign_rejects_huge_expiry() {
        let config = S3FileConfig::default();
        let client = AwsObjectClient::new(&static_sdk_config(), &config, "us-west-2");

        let err = client
            .presign(
                PresignMethod::Put,
                "b",
                "k",
                Duration::from_secs(30 * 24 * 3600),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }
}
