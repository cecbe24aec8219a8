//! Input validation.
//!
//! [`RawConfig`] holds the values exactly as received from the command line
//! or environment. [`RawConfig::validate`] turns them into an immutable
//! [`CacheConfig`] or fails with the first [`ValidationError`]. Validation
//! performs no I/O and must complete before any network or filesystem
//! mutation happens.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use model_cache_models::{
    ArtifactId, BucketName, Field, KeyPrefix, Revision, Secret, ValidationError,
};
use model_cache_store::S3Settings;
use reqwest::Url;

use crate::retry::RetryPolicy;

/// Default key prefix under which artifacts are stored.
pub const DEFAULT_KEY_PREFIX: &str = "models/";

/// Default signing region.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default number of concurrent upload workers.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 10;

/// Upper bound for upload workers.
pub const MAX_UPLOAD_CONCURRENCY: usize = 64;

/// Upper bound for concurrent hub downloads.
pub const MAX_DOWNLOAD_CONCURRENCY: usize = 32;

/// Per-attempt timeout of the existence probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for uploading one file.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// System directories that may never be used as the staging base.
const DISALLOWED_BASE_DIRS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/run", "/sbin", "/sys",
    "/usr", "/var",
];

/// Unvalidated inputs, as received.
#[derive(Debug, Clone)]
pub struct RawConfig {
    /// Model repository identifier (`MODEL_NAME`).
    pub model_name: String,
    /// Revision to fetch (`MODEL_REVISION`).
    pub revision: String,
    /// Target bucket (`S3_BUCKET`).
    pub s3_bucket: String,
    /// Key prefix (`S3_PREFIX`).
    pub s3_prefix: String,
    /// Object store endpoint (`S3_ENDPOINT_URL`).
    pub s3_endpoint_url: String,
    /// Signing region (`S3_REGION`).
    pub s3_region: String,
    /// Access key id (`AWS_ACCESS_KEY_ID`).
    pub aws_access_key_id: String,
    /// Secret access key (`AWS_SECRET_ACCESS_KEY`).
    pub aws_secret_access_key: String,
    /// Optional registry token (`HF_TOKEN`).
    pub hf_token: Option<String>,
    /// Registry endpoint (`HF_ENDPOINT`).
    pub hf_endpoint: String,
    /// Staging base directory (`DOWNLOAD_DIR`).
    pub download_dir: PathBuf,
    /// Upload workers (`UPLOAD_CONCURRENCY`).
    pub upload_concurrency: usize,
    /// Concurrent hub downloads (`DOWNLOAD_CONCURRENCY`).
    pub download_concurrency: usize,
    /// Disable progress bars (`DISABLE_PROGRESS`).
    pub disable_progress: bool,
}

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Model repository to cache.
    pub artifact: ArtifactId,
    /// Revision to fetch.
    pub revision: Revision,
    /// Target bucket.
    pub bucket: BucketName,
    /// Key prefix.
    pub prefix: KeyPrefix,
    /// Object store endpoint.
    pub store_endpoint: Url,
    /// Signing region.
    pub region: String,
    /// Access key id.
    pub access_key_id: Secret,
    /// Secret access key.
    pub secret_access_key: Secret,
    /// Registry token, if any.
    pub hub_token: Option<Secret>,
    /// Registry endpoint.
    pub hub_endpoint: Url,
    /// Lexically normalised staging base directory.
    pub base_dir: PathBuf,
    /// Upload workers.
    pub upload_concurrency: usize,
    /// Concurrent hub downloads.
    pub download_concurrency: usize,
    /// Whether to render progress bars.
    pub show_progress: bool,
    /// Retry policy for the existence probe.
    pub probe_retry: RetryPolicy,
    /// Per-attempt probe timeout.
    pub probe_timeout: Duration,
    /// Per-file upload timeout.
    pub upload_timeout: Duration,
}

impl RawConfig {
    /// Validates every field and produces a [`CacheConfig`].
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self) -> Result<CacheConfig, ValidationError> {
        let artifact = ArtifactId::parse(&self.model_name)?;
        let revision = Revision::parse(&self.revision)?;
        let bucket = BucketName::parse(&self.s3_bucket)?;
        let prefix = KeyPrefix::parse(&self.s3_prefix)?;
        let store_endpoint = parse_endpoint(Field::StoreEndpoint, &self.s3_endpoint_url)?;
        let hub_endpoint = parse_endpoint(Field::HubEndpoint, &self.hf_endpoint)?;
        let region = parse_region(&self.s3_region)?;
        let access_key_id = require_secret(Field::AccessKeyId, &self.aws_access_key_id)?;
        let secret_access_key =
            require_secret(Field::SecretAccessKey, &self.aws_secret_access_key)?;
        let hub_token = self
            .hf_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| Secret::new(t.to_string()));
        let base_dir = normalize_base_dir(&self.download_dir)?;
        let upload_concurrency = check_range(
            Field::UploadConcurrency,
            self.upload_concurrency,
            MAX_UPLOAD_CONCURRENCY,
        )?;
        let download_concurrency = check_range(
            Field::DownloadConcurrency,
            self.download_concurrency,
            MAX_DOWNLOAD_CONCURRENCY,
        )?;

        Ok(CacheConfig {
            artifact,
            revision,
            bucket,
            prefix,
            store_endpoint,
            region,
            access_key_id,
            secret_access_key,
            hub_token,
            hub_endpoint,
            base_dir,
            upload_concurrency,
            download_concurrency,
            show_progress: !self.disable_progress,
            probe_retry: RetryPolicy::default(),
            probe_timeout: PROBE_TIMEOUT,
            upload_timeout: UPLOAD_TIMEOUT,
        })
    }
}

impl CacheConfig {
    /// Logs the configuration with every secret masked.
    pub fn log_summary(&self) {
        log::info!("Configuration loaded:");
        log::info!("  MODEL_NAME: {}", self.artifact);
        log::info!("  MODEL_REVISION: {}", self.revision);
        log::info!("  S3_BUCKET: {}", self.bucket);
        log::info!("  S3_ENDPOINT_URL: {}", self.store_endpoint);
        log::info!("  S3_REGION: {}", self.region);
        log::info!("  S3_PREFIX: {}", self.prefix);
        log::info!("  AWS_ACCESS_KEY_ID: {}", self.access_key_id);
        log::info!("  AWS_SECRET_ACCESS_KEY: {}", self.secret_access_key);
        match &self.hub_token {
            Some(token) => log::info!("  HF_TOKEN: {token}"),
            None => log::info!("  HF_TOKEN: not set"),
        }
        log::info!("  HF_ENDPOINT: {}", self.hub_endpoint);
        log::info!("  DOWNLOAD_DIR: {}", self.base_dir.display());
        log::info!("  UPLOAD_CONCURRENCY: {}", self.upload_concurrency);
        log::info!("  DOWNLOAD_CONCURRENCY: {}", self.download_concurrency);
    }

    /// Connection settings for the S3 client.
    #[must_use]
    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            endpoint_url: self.store_endpoint.as_str().trim_end_matches('/').to_string(),
            region: self.region.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
        }
    }
}

/// Parses an absolute `http`/`https` URL without embedded credentials.
fn parse_endpoint(field: Field, raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ValidationError::new(field, format!("'{raw}' is not an absolute URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::new(
            field,
            format!("'{raw}' must use the http or https scheme"),
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::new(field, format!("'{raw}' has no host")));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(ValidationError::new(
            field,
            "must not embed credentials; use the dedicated credential settings",
        ));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ValidationError::new(
            field,
            format!("'{raw}' must not have a query string or fragment"),
        ));
    }
    Ok(url)
}

fn parse_region(raw: &str) -> Result<String, ValidationError> {
    let valid = !raw.is_empty()
        && raw.len() <= 64
        && raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(raw.to_string())
    } else {
        Err(ValidationError::new(
            Field::Region,
            format!("'{raw}' must be lowercase letters, digits and hyphens"),
        ))
    }
}

fn require_secret(field: Field, raw: &str) -> Result<Secret, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(Secret::new(trimmed.to_string()))
}

fn check_range(field: Field, value: usize, max: usize) -> Result<usize, ValidationError> {
    if (1..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::new(
            field,
            format!("{value} must be between 1 and {max}"),
        ))
    }
}

/// Normalises `raw` lexically (drops `.`, resolves `..` against earlier
/// components) and rejects relative paths and system directories.
///
/// Symlinks are resolved later, when the staging directory is created,
/// since that requires touching the filesystem.
///
/// # Errors
///
/// Returns [`ValidationError`] if the path is relative, climbs above the
/// root, or normalises to a disallowed system directory.
pub fn normalize_base_dir(raw: &Path) -> Result<PathBuf, ValidationError> {
    let field = Field::DownloadDir;
    if !raw.is_absolute() {
        return Err(ValidationError::new(
            field,
            format!("'{}' must be an absolute path", raw.display()),
        ));
    }

    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => normalized.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                if normalized.parent().is_none() {
                    return Err(ValidationError::new(
                        field,
                        format!("'{}' escapes the filesystem root", raw.display()),
                    ));
                }
                normalized.pop();
            }
            Component::Normal(segment) => normalized.push(segment),
        }
    }

    if is_disallowed_base_dir(&normalized) {
        return Err(ValidationError::new(
            field,
            format!(
                "'{}' resolves to the system directory '{}'",
                raw.display(),
                normalized.display()
            ),
        ));
    }

    Ok(normalized)
}

/// Whether `path` is one of the system directories that may never hold
/// the staging directory.
///
/// Applied to the lexical path during validation and again to the
/// symlink-resolved path when staging is created.
#[must_use]
pub fn is_disallowed_base_dir(path: &Path) -> bool {
    DISALLOWED_BASE_DIRS.iter().any(|dir| path == Path::new(dir))
}
