//! Terminal outcome of a cache-population run.

use std::fmt;

use strum_macros::{AsRefStr, Display};

/// The stage a failed run stopped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureStage {
    /// Input validation, before any remote call.
    Validation,
    /// The remote existence check.
    Probe,
    /// Creating the local staging directory.
    Staging,
    /// Fetching the artifact from the source registry.
    Fetch,
    /// Uploading staged files to the object store.
    Upload,
    /// The process received a termination signal mid-run.
    Interrupted,
}

/// How a run ended. Only used to pick the process exit code and the
/// closing summary; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The artifact already exists remotely; nothing was transferred.
    CacheHit,
    /// The artifact was fetched and uploaded.
    CachePopulated {
        /// Number of files uploaded.
        file_count: u64,
        /// Total bytes uploaded.
        total_bytes: u64,
    },
    /// The run failed.
    Failed {
        /// Stage the failure happened in.
        stage: FailureStage,
        /// Diagnostic describing the cause (secrets already masked).
        cause: String,
    },
}

impl RunResult {
    /// Returns `true` for [`Self::CacheHit`] and [`Self::CachePopulated`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Process exit code for this result: `0` on success, `1` otherwise.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_success() { 0 } else { 1 }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CacheHit => f.write_str("cache-hit"),
            Self::CachePopulated {
                file_count,
                total_bytes,
            } => write!(f, "cache-populated ({file_count} files, {total_bytes} bytes)"),
            Self::Failed { stage, cause } => write!(f, "failed in {stage}: {cause}"),
        }
    }
}
