//! Concurrent upload of the staged files.
//!
//! [`build_tasks`] walks the staging directory once and turns every regular
//! file into a [`TransferTask`] with its final object key. The
//! [`UploadPipeline`] then runs a fixed number of workers that pull tasks
//! from a shared index; each task is claimed by exactly one worker, which
//! is also the only writer of that task's outcome.
//!
//! Failures are fail-together: in-flight uploads finish, but once any
//! worker records a failure no worker claims another task. Tasks that
//! were never claimed stay [`TransferOutcome::Pending`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use model_cache_models::{BucketName, RelativeFilePath};
use model_cache_store::ObjectStore;
use walkdir::WalkDir;

use crate::CacheError;
use crate::naming::RemoteLocation;
use crate::progress::ProgressCallback;

/// Result of one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Never dispatched.
    Pending,
    /// Uploaded.
    Succeeded {
        /// Bytes written to the store.
        bytes: u64,
    },
    /// Upload failed or timed out.
    Failed {
        /// Diagnostic.
        error: String,
    },
}

/// One staged file and where it goes.
#[derive(Debug)]
pub struct TransferTask {
    local_path: PathBuf,
    relative_path: RelativeFilePath,
    key: String,
    size: u64,
    outcome: OnceLock<TransferOutcome>,
}

impl TransferTask {
    /// Local file.
    #[must_use]
    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    /// Path relative to the staging root, `/`-separated.
    #[must_use]
    pub const fn relative_path(&self) -> &RelativeFilePath {
        &self.relative_path
    }

    /// Destination object key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// File size at enumeration time.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Current outcome.
    #[must_use]
    pub fn outcome(&self) -> TransferOutcome {
        self.outcome
            .get()
            .cloned()
            .unwrap_or(TransferOutcome::Pending)
    }

    fn settle(&self, outcome: TransferOutcome) {
        if self.outcome.set(outcome).is_err() {
            log::error!("Outcome for {} was recorded twice", self.key);
        }
    }
}

/// Enumerates every regular file under `root` as a [`TransferTask`],
/// sorted by relative path.
///
/// Symlinks are not followed and are skipped along with any other
/// non-regular entry.
///
/// # Errors
///
/// Returns [`CacheError::Enumerate`] if the walk fails or a file name
/// cannot be represented as an object key.
pub fn build_tasks(root: &Path, location: &RemoteLocation) -> Result<Vec<TransferTask>, CacheError> {
    let mut tasks = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| CacheError::Enumerate {
            path: e
                .path()
                .unwrap_or(root)
                .display()
                .to_string(),
            reason: e.to_string(),
        })?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            log::warn!("Skipping non-regular file {}", entry.path().display());
            continue;
        }

        let enumerate_error = |reason: String| CacheError::Enumerate {
            path: entry.path().display().to_string(),
            reason,
        };
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| enumerate_error(e.to_string()))?;
        let relative_path = RelativeFilePath::from_relative_path(relative)
            .map_err(|e| enumerate_error(e.to_string()))?;
        let size = entry
            .metadata()
            .map_err(|e| enumerate_error(e.to_string()))?
            .len();

        tasks.push(TransferTask {
            local_path: entry.path().to_path_buf(),
            key: location.object_key(&relative_path),
            relative_path,
            size,
            outcome: OnceLock::new(),
        });
    }

    tasks.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(tasks)
}

/// Aggregate of all task outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Tasks in the run.
    pub total: usize,
    /// Tasks uploaded.
    pub succeeded: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks never dispatched.
    pub pending: usize,
    /// Bytes uploaded by succeeded tasks.
    pub bytes: u64,
    /// Key and diagnostic of the first failed task, in task order.
    pub first_failure: Option<(String, String)>,
}

impl UploadReport {
    /// Tallies the outcomes of `tasks`.
    #[must_use]
    pub fn from_tasks(tasks: &[TransferTask]) -> Self {
        let mut report = Self {
            total: tasks.len(),
            ..Self::default()
        };
        for task in tasks {
            match task.outcome() {
                TransferOutcome::Pending => report.pending += 1,
                TransferOutcome::Succeeded { bytes } => {
                    report.succeeded += 1;
                    report.bytes += bytes;
                }
                TransferOutcome::Failed { error } => {
                    report.failed += 1;
                    if report.first_failure.is_none() {
                        report.first_failure = Some((task.key.clone(), error));
                    }
                }
            }
        }
        report
    }

    /// `true` only if every task succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.succeeded == self.total
    }

    /// Converts a failed report into [`CacheError::Upload`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Upload`] unless every task succeeded.
    pub fn into_result(self) -> Result<Self, CacheError> {
        if self.is_success() {
            return Ok(self);
        }
        let first_error = self.first_failure.as_ref().map_or_else(
            || format!("{} uploads were never dispatched", self.pending),
            |(key, error)| format!("{key}: {error}"),
        );
        Err(CacheError::Upload {
            failed: self.failed,
            total: self.total,
            first_error,
        })
    }
}

/// Bounded worker pool uploading [`TransferTask`]s.
pub struct UploadPipeline<'a> {
    store: &'a dyn ObjectStore,
    bucket: &'a BucketName,
    concurrency: usize,
    timeout: Duration,
    progress: Arc<dyn ProgressCallback>,
}

/// Shared state of one pipeline run.
struct Dispatch<'t> {
    tasks: &'t [TransferTask],
    next: AtomicUsize,
    halted: AtomicBool,
    completed: AtomicUsize,
}

impl<'t> Dispatch<'t> {
    /// Claims the next task unless a failure has been observed.
    fn claim(&self) -> Option<&'t TransferTask> {
        if self.halted.load(Ordering::Acquire) {
            return None;
        }
        self.tasks.get(self.next.fetch_add(1, Ordering::AcqRel))
    }
}

impl<'a> UploadPipeline<'a> {
    /// Creates a pipeline with `concurrency` workers (at least one).
    #[must_use]
    pub fn new(
        store: &'a dyn ObjectStore,
        bucket: &'a BucketName,
        concurrency: usize,
        timeout: Duration,
        progress: Arc<dyn ProgressCallback>,
    ) -> Self {
        Self {
            store,
            bucket,
            concurrency: concurrency.max(1),
            timeout,
            progress,
        }
    }

    /// Uploads `tasks` and returns the tally once every dispatched upload
    /// has settled.
    pub async fn run(&self, tasks: &[TransferTask]) -> UploadReport {
        let total_bytes: u64 = tasks.iter().map(TransferTask::size).sum();
        let workers = self.concurrency.min(tasks.len()).max(1);
        log::info!(
            "Uploading {} files ({total_bytes} bytes) with {workers} workers",
            tasks.len()
        );

        self.progress.set_total(total_bytes);
        self.progress.set_message(format!("0/{} files", tasks.len()));

        let dispatch = Dispatch {
            tasks,
            next: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
        };
        futures::future::join_all((0..workers).map(|id| self.worker(id, &dispatch))).await;

        let report = UploadReport::from_tasks(tasks);
        if report.is_success() {
            self.progress
                .finish(format!("{} files uploaded", report.succeeded));
        } else {
            self.progress.finish_and_clear();
            log::error!(
                "{} uploads failed, {} never started",
                report.failed,
                report.pending
            );
        }
        report
    }

    async fn worker(&self, id: usize, dispatch: &Dispatch<'_>) {
        while let Some(task) = dispatch.claim() {
            log::debug!("[worker {id}] uploading {}", task.key);
            let outcome = self.upload(task).await;

            if let TransferOutcome::Failed { error } = &outcome {
                log::error!("Failed to upload {}: {error}", task.relative_path);
                dispatch.halted.store(true, Ordering::Release);
            }
            task.settle(outcome);

            let done = dispatch.completed.fetch_add(1, Ordering::AcqRel) + 1;
            self.progress
                .set_message(format!("{done}/{} files", dispatch.tasks.len()));
        }
    }

    async fn upload(&self, task: &TransferTask) -> TransferOutcome {
        let request = self.store.put_file(self.bucket, &task.key, &task.local_path);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(bytes)) => {
                self.progress.inc(bytes);
                log::debug!("Uploaded {} ({bytes} bytes)", task.key);
                TransferOutcome::Succeeded { bytes }
            }
            Ok(Err(e)) => TransferOutcome::Failed {
                error: e.to_string(),
            },
            Err(_) => TransferOutcome::Failed {
                error: format!("timed out after {:?}", self.timeout),
            },
        }
    }
}
