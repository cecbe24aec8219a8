//! Upload progress reporting.
//!
//! The pipeline reports through [`ProgressCallback`] so rendering (an
//! `indicatif` bar, nothing at all) is chosen by the binary. Reporting is
//! advisory: implementations must not block, and swapping one for another
//! must not change what the pipeline does.

use std::sync::Arc;

/// Receives byte and file counts from the upload pipeline.
///
/// Called concurrently from every upload worker.
pub trait ProgressCallback: Send + Sync {
    /// Total bytes the run expects to transfer.
    fn set_total(&self, total: u64);

    /// Add `delta` transferred bytes.
    fn inc(&self, delta: u64);

    /// Replace the text shown next to the indicator.
    fn set_message(&self, msg: String);

    /// Mark the transfer as done, leaving `msg` visible.
    fn finish(&self, msg: String);

    /// Mark the transfer as done and remove the indicator.
    fn finish_and_clear(&self);
}

/// Ignores every update.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

/// Shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
