#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Validated value types shared by the model cache loader crates.
//!
//! Every externally supplied identifier (model repository name, bucket,
//! key prefix, revision, remote file names) is parsed into a newtype here
//! before anything builds a filesystem path or an object key from it. The
//! constructors perform no I/O; they only check the allow-lists below.

pub mod outcome;
pub mod secret;

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use strum_macros::Display;

pub use outcome::{FailureStage, RunResult};
pub use secret::{Secret, mask};

/// Maximum length of an artifact identifier or key prefix.
pub const MAX_NAME_LEN: usize = 512;

/// Maximum length of a revision (branch, tag or commit).
pub const MAX_REVISION_LEN: usize = 256;

/// Maximum length of a single file path inside an artifact.
pub const MAX_FILE_PATH_LEN: usize = 1024;

/// `org/name` or `name`: each segment starts alphanumeric, at most one `/`.
static ARTIFACT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*(/[A-Za-z0-9][A-Za-z0-9._-]*)?$")
        .expect("artifact pattern is a valid regex")
});

/// 3-63 chars, lowercase alphanumerics, dots and hyphens, alphanumeric ends.
static BUCKET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9.-]{1,61}[a-z0-9]$")
        .expect("bucket pattern is a valid regex")
});

/// Characters allowed in key prefixes and revisions.
static PATH_CHARS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._/-]+$")
        .expect("path character pattern is a valid regex")
});

/// The externally supplied input a [`ValidationError`] refers to.
///
/// Displays as the environment variable the value is read from, so the
/// diagnostic points the operator at the setting to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Field {
    #[strum(serialize = "MODEL_NAME")]
    ModelName,
    #[strum(serialize = "MODEL_REVISION")]
    Revision,
    #[strum(serialize = "S3_BUCKET")]
    Bucket,
    #[strum(serialize = "S3_PREFIX")]
    KeyPrefix,
    #[strum(serialize = "S3_ENDPOINT_URL")]
    StoreEndpoint,
    #[strum(serialize = "S3_REGION")]
    Region,
    #[strum(serialize = "AWS_ACCESS_KEY_ID")]
    AccessKeyId,
    #[strum(serialize = "AWS_SECRET_ACCESS_KEY")]
    SecretAccessKey,
    #[strum(serialize = "HF_TOKEN")]
    HubToken,
    #[strum(serialize = "HF_ENDPOINT")]
    HubEndpoint,
    #[strum(serialize = "DOWNLOAD_DIR")]
    DownloadDir,
    #[strum(serialize = "UPLOAD_CONCURRENCY")]
    UploadConcurrency,
    #[strum(serialize = "DOWNLOAD_CONCURRENCY")]
    DownloadConcurrency,
    /// A file name reported by the source registry.
    #[strum(serialize = "remote file name")]
    RemoteFileName,
}

/// An input failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {field}: {reason}")]
pub struct ValidationError {
    /// Which input was rejected.
    pub field: Field,
    /// Human-readable reason. Never contains secret values.
    pub reason: String,
}

impl ValidationError {
    /// Creates a new validation error for `field`.
    #[must_use]
    pub fn new(field: Field, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// A validated model repository identifier such as `openai-community/gpt2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Validates `raw` as an artifact identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `raw` is empty, too long, contains a
    /// `..` sequence, starts with `/`, has more than one `/`, or contains
    /// characters outside `[A-Za-z0-9._-]`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let field = Field::ModelName;
        if raw.is_empty() {
            return Err(ValidationError::new(field, "must not be empty"));
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(ValidationError::new(
                field,
                format!("must be at most {MAX_NAME_LEN} characters"),
            ));
        }
        if raw.contains("..") {
            return Err(ValidationError::new(
                field,
                format!("'{raw}' cannot contain '..' (path traversal)"),
            ));
        }
        if !ARTIFACT_PATTERN.is_match(raw) {
            return Err(ValidationError::new(
                field,
                format!(
                    "'{raw}' must start with an alphanumeric character, contain only \
                     alphanumerics, dots, hyphens and underscores, and use at most one \
                     '/' separator (owner/name)"
                ),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the identifier as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the path segments (`owner`, `name`) or just (`name`).
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated S3 bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketName(String);

impl BucketName {
    /// Validates `raw` against S3 bucket naming rules.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `raw` is not 3-63 characters of
    /// lowercase alphanumerics, dots and hyphens with alphanumeric ends, or
    /// contains adjacent dots.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        if !BUCKET_PATTERN.is_match(raw) || raw.contains("..") {
            return Err(ValidationError::new(
                Field::Bucket,
                format!(
                    "'{raw}' must be 3-63 characters of lowercase letters, numbers, \
                     dots and hyphens, starting and ending with a letter or number"
                ),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated object key prefix (e.g. `models/`).
///
/// Stored as given; separator normalisation happens when the remote
/// location is composed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    /// Validates `raw` as a key prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `raw` is empty, too long, starts with
    /// `/`, contains `..`, or has characters outside `[A-Za-z0-9._/-]`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        validate_path_like(Field::KeyPrefix, raw, MAX_NAME_LEN)?;
        Ok(Self(raw.to_string()))
    }

    /// Returns the prefix as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the non-empty `/`-separated segments of the prefix.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated source-registry revision (branch, tag or commit hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Default revision fetched when none is configured.
    pub const DEFAULT: &'static str = "main";

    /// Validates `raw` as a revision.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] under the same rules as [`KeyPrefix`],
    /// with a shorter length bound.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        validate_path_like(Field::Revision, raw, MAX_REVISION_LEN)?;
        Ok(Self(raw.to_string()))
    }

    /// Returns the revision.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_path_like(field: Field, raw: &str, max_len: usize) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if raw.len() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {max_len} characters"),
        ));
    }
    if raw.contains("..") {
        return Err(ValidationError::new(
            field,
            format!("'{raw}' cannot contain '..' (path traversal)"),
        ));
    }
    if raw.starts_with('/') {
        return Err(ValidationError::new(
            field,
            format!("'{raw}' cannot start with '/' (absolute path)"),
        ));
    }
    if !PATH_CHARS_PATTERN.is_match(raw) {
        return Err(ValidationError::new(
            field,
            format!("'{raw}' may only contain alphanumerics, '.', '_', '-' and '/'"),
        ));
    }
    if raw.split('/').any(|segment| segment == ".") {
        return Err(ValidationError::new(
            field,
            format!("'{raw}' cannot contain '.' path segments"),
        ));
    }
    Ok(())
}

/// A file path inside an artifact, relative to the artifact root.
///
/// Always stored with `/` separators regardless of the local platform, so
/// it can be appended to an object key as-is and turned into a local path
/// with [`Self::to_path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativeFilePath(String);

impl RelativeFilePath {
    /// Validates a `/`-separated file name reported by a remote registry.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the name is empty, too long, absolute,
    /// contains backslashes or control characters, or has empty, `.` or
    /// `..` segments.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let field = Field::RemoteFileName;
        if raw.is_empty() {
            return Err(ValidationError::new(field, "must not be empty"));
        }
        if raw.len() > MAX_FILE_PATH_LEN {
            return Err(ValidationError::new(
                field,
                format!("must be at most {MAX_FILE_PATH_LEN} characters"),
            ));
        }
        if raw.starts_with('/') {
            return Err(ValidationError::new(
                field,
                format!("'{raw}' cannot be an absolute path"),
            ));
        }
        if raw.contains('\\') || raw.chars().any(char::is_control) {
            return Err(ValidationError::new(
                field,
                format!("'{}' contains a backslash or control character", raw.escape_debug()),
            ));
        }
        if raw
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(ValidationError::new(
                field,
                format!("'{raw}' has an empty, '.' or '..' segment"),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Builds a relative file path from a local path relative to some root.
    ///
    /// Only plain components are accepted; the result joins them with `/`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the path has root, prefix, `.` or `..`
    /// components, a component that is not valid UTF-8, or fails
    /// [`Self::parse`].
    pub fn from_relative_path(path: &Path) -> Result<Self, ValidationError> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(segment) => {
                    let segment = segment.to_str().ok_or_else(|| {
                        ValidationError::new(
                            Field::RemoteFileName,
                            format!("'{}' is not valid UTF-8", path.display()),
                        )
                    })?;
                    segments.push(segment);
                }
                _ => {
                    return Err(ValidationError::new(
                        Field::RemoteFileName,
                        format!("'{}' is not a plain relative path", path.display()),
                    ));
                }
            }
        }
        Self::parse(&segments.join("/"))
    }

    /// Returns the `/`-separated path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Converts to a platform path relative to the artifact root.
    #[must_use]
    pub fn to_path(&self) -> PathBuf {
        self.0.split('/').collect()
    }
}

impl fmt::Display for RelativeFilePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
