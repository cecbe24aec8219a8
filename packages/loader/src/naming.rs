//! Remote key and local staging path construction.
//!
//! This is the only place that turns validated names into object keys or
//! filesystem paths. Everything here is pure: identical inputs always give
//! identical outputs.

use std::fmt;
use std::path::{Path, PathBuf};

use model_cache_models::{ArtifactId, BucketName, KeyPrefix, RelativeFilePath};

/// Separator between the owner and name in staging directory names.
const STAGING_SEPARATOR: &str = "--";

/// Leading component of every staging directory name.
const STAGING_KIND: &str = "models";

/// Bucket plus the canonical key prefix of one artifact.
///
/// The prefix is `<prefix segments>/<artifact>/`: redundant separators are
/// collapsed and it always ends in exactly one `/`, so listing it cannot
/// match a different artifact that shares a string prefix (`gpt2` vs
/// `gpt2-large`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    bucket: BucketName,
    prefix: String,
}

impl RemoteLocation {
    /// Composes the canonical location for `artifact`.
    #[must_use]
    pub fn new(bucket: &BucketName, prefix: &KeyPrefix, artifact: &ArtifactId) -> Self {
        let mut composed = String::new();
        for segment in prefix.segments().chain(artifact.segments()) {
            composed.push_str(segment);
            composed.push('/');
        }
        Self {
            bucket: bucket.clone(),
            prefix: composed,
        }
    }

    /// Target bucket.
    #[must_use]
    pub const fn bucket(&self) -> &BucketName {
        &self.bucket
    }

    /// Canonical key prefix, always ending in a single `/`.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Object key for a file inside the artifact.
    #[must_use]
    pub fn object_key(&self, file: &RelativeFilePath) -> String {
        format!("{}{}", self.prefix, file.as_str())
    }
}

impl fmt::Display for RemoteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Directory name used to stage `artifact` locally, e.g.
/// `models--openai-community--gpt2`.
#[must_use]
pub fn staging_dir_name(artifact: &ArtifactId) -> String {
    std::iter::once(STAGING_KIND)
        .chain(artifact.segments())
        .collect::<Vec<_>>()
        .join(STAGING_SEPARATOR)
}

/// Staging directory path for `artifact` under `base`.
#[must_use]
pub fn staging_dir(base: &Path, artifact: &ArtifactId) -> PathBuf {
    base.join(staging_dir_name(artifact))
}
