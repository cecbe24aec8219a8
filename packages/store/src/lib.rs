#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! S3-compatible object store access for the model cache loader.
//!
//! The loader only needs two operations from the store:
//!
//! * a bounded existence check ("is there at least one object under this
//!   prefix?"), issued as `ListObjectsV2` with `max-keys=1`, and
//! * uploading a single local file to a key, switching to a multipart
//!   upload for large model shards.
//!
//! Both are exposed through the [`ObjectStore`] trait so the orchestration
//! logic can run against an in-memory store in tests. [`S3Store`] is the
//! production implementation over `aws-sdk-s3`, configured for a custom
//! endpoint (Ceph RGW, `MinIO`, R2, ...) with static credentials.
//!
//! SDK failures are classified into [`StoreErrorKind`]: credential and
//! permission problems are [`StoreErrorKind::Access`] (never worth
//! retrying), timeouts, dispatch failures and throttling are
//! [`StoreErrorKind::Transient`], and everything else is
//! [`StoreErrorKind::Other`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use model_cache_models::{BucketName, Secret};
use strum_macros::Display;

/// Files at or above this size are uploaded in parts.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Size of each part of a multipart upload (the last part may be smaller).
pub const MULTIPART_PART_SIZE: u64 = 64 * 1024 * 1024;

/// Connection establishment timeout for every store request.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts the SDK makes per request before surfacing an error.
const SDK_MAX_ATTEMPTS: u32 = 3;

/// Error codes that mean the credentials or permissions are wrong.
const ACCESS_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "AllAccessDisabled",
    "InvalidAccessKeyId",
    "InvalidToken",
    "NoSuchBucket",
    "SignatureDoesNotMatch",
];

/// Error codes that mean "try again later".
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "InternalError",
    "RequestTimeout",
    "ServiceUnavailable",
    "SlowDown",
    "Throttling",
];

/// Coarse classification of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum StoreErrorKind {
    /// Authentication or authorization failure.
    Access,
    /// Network failure, timeout or throttling.
    Transient,
    /// Anything else.
    Other,
}

/// Errors that can occur during object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store rejected the credentials or denied the operation.
    #[error("Access denied for s3://{bucket}/{key}: {message}")]
    Access {
        /// Bucket name.
        bucket: String,
        /// Object key or prefix.
        key: String,
        /// Error code and message reported by the store.
        message: String,
    },

    /// A retryable failure (timeout, connection error, throttling, 5xx).
    #[error("Transient failure for s3://{bucket}/{key}: {source}")]
    Transient {
        /// Bucket name.
        bucket: String,
        /// Object key or prefix.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Any other store failure.
    #[error("Object store request for s3://{bucket}/{key} failed: {source}")]
    Other {
        /// Bucket name.
        bucket: String,
        /// Object key or prefix.
        key: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// I/O error reading a local file.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Local path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

impl StoreError {
    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> StoreErrorKind {
        match self {
            Self::Access { .. } => StoreErrorKind::Access,
            Self::Transient { .. } => StoreErrorKind::Transient,
            Self::Other { .. } | Self::Io { .. } => StoreErrorKind::Other,
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind(), StoreErrorKind::Transient)
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// The object store operations the loader depends on.
///
/// Implementations must be safe to share across concurrent upload workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns `true` if at least one object exists under `prefix`.
    ///
    /// Must not enumerate more than one object or download any body.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the listing request fails.
    async fn exists_under(&self, bucket: &BucketName, prefix: &str) -> Result<bool, StoreError>;

    /// Uploads the file at `local_path` to `key`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or the upload fails.
    async fn put_file(
        &self,
        bucket: &BucketName,
        key: &str,
        local_path: &Path,
    ) -> Result<u64, StoreError>;
}

/// Connection settings for [`S3Store`].
#[derive(Debug, Clone)]
pub struct S3Settings {
    /// Absolute `http`/`https` endpoint URL.
    pub endpoint_url: String,
    /// Signing region (`us-east-1` works for most S3-compatible stores).
    pub region: String,
    /// Access key id.
    pub access_key_id: Secret,
    /// Secret access key.
    pub secret_access_key: Secret,
}

/// [`ObjectStore`] over an S3-compatible endpoint.
///
/// The underlying SDK client pools connections and is safe to use from
/// many tasks at once.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    multipart_threshold: u64,
    part_size: u64,
}

impl S3Store {
    /// Creates a new store client for the given endpoint and credentials.
    #[must_use]
    pub fn new(settings: &S3Settings) -> Self {
        log::info!(
            "Creating S3 client with endpoint: {} (region {}, access key {})",
            settings.endpoint_url,
            settings.region,
            settings.access_key_id
        );

        let creds = Credentials::new(
            settings.access_key_id.expose(),
            settings.secret_access_key.expose(),
            None,
            None,
            "model-cache-static",
        );

        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(&settings.endpoint_url)
            .region(Region::new(settings.region.clone()))
            .credentials_provider(creds)
            .force_path_style(true)
            .retry_config(RetryConfig::standard().with_max_attempts(SDK_MAX_ATTEMPTS))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(CONNECT_TIMEOUT)
                    .build(),
            )
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            multipart_threshold: MULTIPART_THRESHOLD,
            part_size: MULTIPART_PART_SIZE,
        }
    }

    /// Single `PutObject` streaming the whole file.
    async fn put_single(
        &self,
        bucket: &BucketName,
        key: &str,
        local_path: &Path,
        size: u64,
    ) -> Result<u64, StoreError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StoreError::Other {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: Box::new(e),
            })?;

        self.client
            .put_object()
            .bucket(bucket.as_str())
            .key(key)
            .body(body)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        Ok(size)
    }

    /// Multipart upload in [`MULTIPART_PART_SIZE`] parts. The upload is
    /// aborted if any part fails so no orphaned parts are left billed.
    async fn put_multipart(
        &self,
        bucket: &BucketName,
        key: &str,
        local_path: &Path,
        size: u64,
    ) -> Result<u64, StoreError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket.as_str())
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| classify(e, bucket, key))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::Other {
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: "CreateMultipartUpload returned no upload id".into(),
            })?
            .to_string();

        let parts = match self
            .upload_parts(bucket, key, local_path, size, &upload_id)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart(bucket, key, &upload_id).await;
                return Err(e);
            }
        };

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(bucket.as_str())
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;

        if let Err(e) = completed {
            self.abort_multipart(bucket, key, &upload_id).await;
            return Err(classify(e, bucket, key));
        }

        Ok(size)
    }

    async fn upload_parts(
        &self,
        bucket: &BucketName,
        key: &str,
        local_path: &Path,
        size: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let plan = plan_parts(size, self.part_size);
        let mut completed = Vec::with_capacity(plan.len());

        for part in plan {
            let body = ByteStream::read_from()
                .path(local_path)
                .offset(part.offset)
                .length(Length::Exact(part.length))
                .build()
                .await
                .map_err(|e| StoreError::Other {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source: Box::new(e),
                })?;

            let output = self
                .client
                .upload_part()
                .bucket(bucket.as_str())
                .key(key)
                .upload_id(upload_id)
                .part_number(part.number)
                .body(body)
                .send()
                .await
                .map_err(|e| classify(e, bucket, key))?;

            log::debug!("  part {} of s3://{bucket}/{key} uploaded", part.number);

            completed.push(
                CompletedPart::builder()
                    .part_number(part.number)
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .build(),
            );
        }

        Ok(completed)
    }

    async fn abort_multipart(&self, bucket: &BucketName, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket.as_str())
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            log::warn!("Failed to abort multipart upload of s3://{bucket}/{key}: {e}");
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn exists_under(&self, bucket: &BucketName, prefix: &str) -> Result<bool, StoreError> {
        log::debug!("Listing s3://{bucket}/{prefix} (max 1 key)");

        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket.as_str())
            .prefix(prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| classify(e, bucket, prefix))?;

        Ok(output.key_count().unwrap_or(0) > 0 || !output.contents().is_empty())
    }

    async fn put_file(
        &self,
        bucket: &BucketName,
        key: &str,
        local_path: &Path,
    ) -> Result<u64, StoreError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| StoreError::io(local_path, e))?
            .len();

        if size >= self.multipart_threshold {
            #[allow(clippy::cast_precision_loss)] // display-only MB value
            let mb = size as f64 / 1_048_576.0;
            log::debug!("Multipart upload {} -> s3://{bucket}/{key} ({mb:.1} MB)", local_path.display());
            self.put_multipart(bucket, key, local_path, size).await
        } else {
            self.put_single(bucket, key, local_path, size).await
        }
    }
}

/// One part of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartPlan {
    /// 1-based part number.
    number: i32,
    /// Byte offset into the file.
    offset: u64,
    /// Part length in bytes.
    length: u64,
}

/// Splits `size` bytes into consecutive parts of at most `part_size` bytes.
fn plan_parts(size: u64, part_size: u64) -> Vec<PartPlan> {
    let part_size = part_size.max(1);
    let mut parts = Vec::new();
    let mut offset = 0u64;
    let mut number = 1i32;
    while offset < size {
        let length = part_size.min(size - offset);
        parts.push(PartPlan {
            number,
            offset,
            length,
        });
        offset += length;
        number = number.saturating_add(1);
    }
    parts
}

/// Maps an SDK error to a [`StoreError`] of the right kind.
fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &BucketName, key: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err
        .as_service_error()
        .and_then(ProvideErrorMetadata::code)
        .map(str::to_string);

    let kind = classify_parts(
        matches!(
            err,
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
        ),
        status,
        code.as_deref(),
    );

    match kind {
        StoreErrorKind::Access => {
            let message = err
                .as_service_error()
                .and_then(ProvideErrorMetadata::message)
                .map(str::to_string);
            StoreError::Access {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: format!(
                    "{} (HTTP {})",
                    code.or(message).unwrap_or_else(|| "access denied".to_string()),
                    status.map_or_else(|| "?".to_string(), |s| s.to_string())
                ),
            }
        }
        StoreErrorKind::Transient => StoreError::Transient {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: Box::new(err),
        },
        StoreErrorKind::Other => StoreError::Other {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source: Box::new(err),
        },
    }
}

/// Classification rules, separated from the SDK types so they can be tested.
fn classify_parts(
    network_failure: bool,
    status: Option<u16>,
    code: Option<&str>,
) -> StoreErrorKind {
    if matches!(status, Some(401 | 403)) || code.is_some_and(|c| ACCESS_ERROR_CODES.contains(&c)) {
        return StoreErrorKind::Access;
    }
    if network_failure
        || matches!(status, Some(429 | 500..=599))
        || code.is_some_and(|c| TRANSIENT_ERROR_CODES.contains(&c))
    {
        return StoreErrorKind::Transient;
    }
    StoreErrorKind::Other
}
