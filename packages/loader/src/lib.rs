#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Cache population for model repositories.
//!
//! One run validates its inputs, checks whether the object store already
//! holds the artifact, and on a miss fetches it into a private staging
//! directory and uploads every file through a bounded worker pool. The
//! staging directory is removed on every path that created it.
//!
//! The object store and the registry are reached only through the
//! [`ObjectStore`] and [`ArtifactFetcher`] traits, so the whole flow can run
//! against in-memory fakes.

pub mod config;
pub mod fetch;
pub mod naming;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod staging;
pub mod upload;

pub use config::{CacheConfig, RawConfig};
pub use model_cache_hub::{ArtifactFetcher, FetchError, FetchSummary};
pub use model_cache_models::{FailureStage, RunResult, ValidationError};
pub use model_cache_store::{ObjectStore, StoreError};
pub use orchestrator::Loader;
pub use staging::StagingError;

/// Every way a run can fail.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Bad input; nothing remote was touched.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The store rejected the credentials during the existence check.
    #[error("Access denied while checking {location}: {source}")]
    Access {
        /// Location being probed.
        location: String,
        /// Store error.
        source: StoreError,
    },

    /// The existence check kept failing transiently.
    #[error("Checking {location} failed after {attempts} attempts: {source}")]
    Transient {
        /// Location being probed.
        location: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the last attempt.
        source: StoreError,
    },

    /// The existence check failed for another reason.
    #[error("Checking {location} failed: {source}")]
    Probe {
        /// Location being probed.
        location: String,
        /// Store error.
        source: StoreError,
    },

    /// The staging directory could not be prepared.
    #[error(transparent)]
    Staging(#[from] StagingError),

    /// The registry fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The staging directory does not hold what the fetch reported.
    #[error("Incomplete fetch: registry reported {expected} files but {found} were staged")]
    IncompleteFetch {
        /// File count reported by the fetcher.
        expected: u64,
        /// Regular files found in the staging directory.
        found: u64,
    },

    /// Walking the staging directory failed.
    #[error("Failed to enumerate staged files at {path}: {reason}")]
    Enumerate {
        /// Path being walked.
        path: String,
        /// Why it failed.
        reason: String,
    },

    /// One or more uploads failed.
    #[error("{failed} of {total} uploads failed, first failure: {first_error}")]
    Upload {
        /// Failed uploads.
        failed: usize,
        /// Tasks in the run.
        total: usize,
        /// Diagnostic of the first failed upload.
        first_error: String,
    },
}

impl CacheError {
    /// Stage the error belongs to.
    #[must_use]
    pub const fn stage(&self) -> FailureStage {
        match self {
            Self::Validation(_) => FailureStage::Validation,
            Self::Access { .. } | Self::Transient { .. } | Self::Probe { .. } => FailureStage::Probe,
            Self::Staging(_) => FailureStage::Staging,
            Self::Fetch(_) | Self::IncompleteFetch { .. } => FailureStage::Fetch,
            Self::Enumerate { .. } | Self::Upload { .. } => FailureStage::Upload,
        }
    }
}
