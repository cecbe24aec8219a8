//! Sequences one run: probe, then on a miss stage, fetch, upload and clean
//! up.
//!
//! Validation happens before a [`Loader`] exists: it needs a
//! [`CacheConfig`], which only [`crate::RawConfig::validate`] produces.

use std::fmt;
use std::sync::Arc;

use model_cache_hub::ArtifactFetcher;
use model_cache_models::RunResult;
use model_cache_store::ObjectStore;
use strum_macros::Display;

use crate::config::CacheConfig;
use crate::fetch::{self, format_bytes};
use crate::naming::RemoteLocation;
use crate::progress::{ProgressCallback, null_progress};
use crate::staging::StagingDirectory;
use crate::upload::{self, UploadPipeline};
use crate::{CacheError, probe};

const BANNER_WIDTH: usize = 60;

/// States a run moves through.
///
/// `Validating → Probing → (HitDone | Fetching → Uploading → CleaningUp)`,
/// ending in `Success` or `Failed`. A failure in `Fetching` or `Uploading`
/// still passes through `CleaningUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RunState {
    /// Checking the raw inputs.
    Validating,
    /// Checking the store for an existing copy.
    Probing,
    /// The artifact was already cached.
    HitDone,
    /// Downloading into the staging directory.
    Fetching,
    /// Uploading staged files.
    Uploading,
    /// Removing the staging directory.
    CleaningUp,
    /// Terminal: exit code 0.
    Success,
    /// Terminal: exit code 1.
    Failed,
}

impl RunState {
    /// Terminal state for `result`.
    #[must_use]
    pub const fn terminal(result: &RunResult) -> Self {
        match result {
            RunResult::CacheHit | RunResult::CachePopulated { .. } => Self::Success,
            RunResult::Failed { .. } => Self::Failed,
        }
    }

    /// Logs the transition into this state.
    pub fn enter(self) {
        log::debug!("Entering state {self}");
    }
}

/// Runs the cache population flow against the given collaborators.
pub struct Loader<'a> {
    config: &'a CacheConfig,
    store: &'a dyn ObjectStore,
    fetcher: &'a dyn ArtifactFetcher,
    progress: Arc<dyn ProgressCallback>,
}

impl<'a> Loader<'a> {
    /// Creates a loader that reports no progress.
    #[must_use]
    pub fn new(
        config: &'a CacheConfig,
        store: &'a dyn ObjectStore,
        fetcher: &'a dyn ArtifactFetcher,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            progress: null_progress(),
        }
    }

    /// Reports upload progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Canonical remote location of the configured artifact.
    #[must_use]
    pub fn location(&self) -> RemoteLocation {
        RemoteLocation::new(&self.config.bucket, &self.config.prefix, &self.config.artifact)
    }

    /// Runs to completion and logs the closing banner.
    ///
    /// Never fails: errors are folded into [`RunResult::Failed`].
    pub async fn run(&self) -> RunResult {
        let location = self.location();
        let result = match self.execute(&location).await {
            Ok(result) => result,
            Err(e) => failure(&e),
        };
        RunState::terminal(&result).enter();
        self.report(&location, &result);
        result
    }

    async fn execute(&self, location: &RemoteLocation) -> Result<RunResult, CacheError> {
        RunState::Probing.enter();
        let found = probe::exists(
            self.store,
            location,
            &self.config.probe_retry,
            self.config.probe_timeout,
        )
        .await?;
        if found {
            RunState::HitDone.enter();
            log::info!("'{}' is already cached, skipping download", self.config.artifact);
            return Ok(RunResult::CacheHit);
        }

        let staging = StagingDirectory::create(&self.config.base_dir, &self.config.artifact).await?;
        let result = self.populate(&staging, location).await;

        RunState::CleaningUp.enter();
        let path = staging.path().display().to_string();
        match staging.close() {
            Ok(()) => log::info!("Removed staging directory {path}"),
            Err(e) => log::warn!("Failed to remove staging directory: {e}"),
        }

        result
    }

    async fn populate(
        &self,
        staging: &StagingDirectory,
        location: &RemoteLocation,
    ) -> Result<RunResult, CacheError> {
        RunState::Fetching.enter();
        let summary = fetch::run(self.fetcher, self.config, staging.path()).await?;
        let tasks = upload::build_tasks(staging.path(), location)?;
        fetch::verify_staged(&summary, &tasks)?;

        RunState::Uploading.enter();
        if tasks.is_empty() {
            log::warn!(
                "'{}' has no files; nothing to upload",
                self.config.artifact
            );
        }
        let report = UploadPipeline::new(
            self.store,
            location.bucket(),
            self.config.upload_concurrency,
            self.config.upload_timeout,
            Arc::clone(&self.progress),
        )
        .run(&tasks)
        .await
        .into_result()?;

        Ok(RunResult::CachePopulated {
            file_count: report.succeeded as u64,
            total_bytes: report.bytes,
        })
    }

    fn report(&self, location: &RemoteLocation, result: &RunResult) {
        match result {
            RunResult::CacheHit => banner(
                log::Level::Info,
                "SUCCESS: model is already cached",
                &[
                    format!("Model: {}", self.config.artifact),
                    format!("Location: {location}"),
                ],
            ),
            RunResult::CachePopulated {
                file_count,
                total_bytes,
            } => banner(
                log::Level::Info,
                "SUCCESS: model downloaded and uploaded",
                &[
                    format!("Model: {}", self.config.artifact),
                    format!("Location: {location}"),
                    format!("Files: {file_count}"),
                    format!("Size: {}", format_bytes(*total_bytes)),
                ],
            ),
            RunResult::Failed { stage, cause } => failure_banner(*stage, cause),
        }
    }
}

/// Converts `error` into a failed [`RunResult`], logging the cause.
#[must_use]
pub fn failure(error: &CacheError) -> RunResult {
    let stage = error.stage();
    log::error!("{stage} failed: {error}");
    RunResult::Failed {
        stage,
        cause: error.to_string(),
    }
}

/// Logs the `FAILED` banner for a run that never reached a [`Loader`], or
/// was interrupted.
pub fn failure_banner(stage: impl fmt::Display, cause: &str) {
    banner(
        log::Level::Error,
        &format!("FAILED: {stage}"),
        &[cause.to_string()],
    );
}

fn banner(level: log::Level, title: &str, lines: &[String]) {
    let rule = "=".repeat(BANNER_WIDTH);
    log::log!(level, "{rule}");
    log::log!(level, "{title}");
    for line in lines {
        log::log!(level, "  {line}");
    }
    log::log!(level, "{rule}");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use model_cache_hub::{FetchError, FetchSummary};
    use model_cache_models::{
        ArtifactId, BucketName, FailureStage, Field, Revision, Secret,
    };
    use model_cache_store::StoreError;

    use super::*;
    use crate::config::RawConfig;

    /// In-memory object store keyed by object key.
    #[derive(Default)]
    struct MemoryStore {
        objects: Mutex<BTreeMap<String, u64>>,
        probes: AtomicUsize,
        puts: AtomicUsize,
        fail_keys: Vec<String>,
    }

    impl MemoryStore {
        fn with_object(key: &str) -> Self {
            let store = Self::default();
            store.objects.lock().unwrap().insert(key.to_string(), 1);
            store
        }

        fn calls(&self) -> usize {
            self.probes.load(Ordering::SeqCst) + self.puts.load(Ordering::SeqCst)
        }

        fn keys(&self) -> Vec<String> {
            self.objects.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn exists_under(&self, _: &BucketName, prefix: &str) -> Result<bool, StoreError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .any(|key| key.starts_with(prefix)))
        }

        async fn put_file(
            &self,
            bucket: &BucketName,
            key: &str,
            local_path: &Path,
        ) -> Result<u64, StoreError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_keys.iter().any(|k| k == key) {
                return Err(StoreError::Other {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    source: "InternalError".into(),
                });
            }
            let size = std::fs::metadata(local_path).unwrap().len();
            self.objects.lock().unwrap().insert(key.to_string(), size);
            Ok(size)
        }
    }

    /// Writes a fixed file set, remembering where and for which artifact.
    struct FakeFetcher {
        files: Vec<(&'static str, &'static [u8])>,
        calls: Mutex<Vec<(String, PathBuf)>>,
        error: Option<fn(&ArtifactId) -> FetchError>,
    }

    impl FakeFetcher {
        fn with_files(files: Vec<(&'static str, &'static [u8])>) -> Self {
            Self {
                files,
                calls: Mutex::new(Vec::new()),
                error: None,
            }
        }

        fn failing(error: fn(&ArtifactId) -> FetchError) -> Self {
            Self {
                error: Some(error),
                ..Self::with_files(Vec::new())
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn staged_at(&self) -> PathBuf {
            self.calls.lock().unwrap()[0].1.clone()
        }
    }

    #[async_trait]
    impl ArtifactFetcher for FakeFetcher {
        async fn fetch(
            &self,
            artifact: &ArtifactId,
            _revision: &Revision,
            destination: &Path,
            _token: Option<&Secret>,
        ) -> Result<FetchSummary, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((artifact.to_string(), destination.to_path_buf()));
            if let Some(error) = self.error {
                return Err(error(artifact));
            }
            let mut summary = FetchSummary::default();
            for (name, contents) in &self.files {
                let path = destination.join(name);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, contents).unwrap();
                summary.file_count += 1;
                summary.total_bytes += contents.len() as u64;
            }
            Ok(summary)
        }
    }

    fn gpt2_files() -> Vec<(&'static str, &'static [u8])> {
        vec![
            ("config.json", b"{\"n_layer\": 12}".as_slice()),
            ("model.safetensors", b"weights".as_slice()),
            ("tokenizer.json", b"{}".as_slice()),
            ("onnx/decoder_model.onnx", b"graph".as_slice()),
        ]
    }

    fn raw(base: &Path) -> RawConfig {
        RawConfig {
            model_name: "gpt2".to_string(),
            revision: "main".to_string(),
            s3_bucket: "my-cache".to_string(),
            s3_prefix: "models/".to_string(),
            s3_endpoint_url: "http://localhost:9000".to_string(),
            s3_region: "us-east-1".to_string(),
            aws_access_key_id: "AKIAEXAMPLE1234".to_string(),
            aws_secret_access_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".to_string(),
            hf_token: None,
            hf_endpoint: "https://huggingface.co".to_string(),
            download_dir: base.to_path_buf(),
            upload_concurrency: 3,
            download_concurrency: 2,
            disable_progress: true,
        }
    }

    async fn run_raw(raw: &RawConfig, store: &MemoryStore, fetcher: &FakeFetcher) -> RunResult {
        match raw.validate() {
            Ok(config) => Loader::new(&config, store, fetcher).run().await,
            Err(e) => failure(&CacheError::from(e)),
        }
    }

    #[test]
    fn results_map_to_terminal_states() {
        assert_eq!(RunState::terminal(&RunResult::CacheHit), RunState::Success);
        assert_eq!(
            RunState::terminal(&RunResult::CachePopulated {
                file_count: 0,
                total_bytes: 0,
            }),
            RunState::Success
        );
        assert_eq!(
            RunState::terminal(&RunResult::Failed {
                stage: FailureStage::Upload,
                cause: "boom".to_string(),
            }),
            RunState::Failed
        );
    }

    #[tokio::test]
    async fn invalid_artifact_makes_no_remote_calls() {
        let base = tempfile::tempdir().unwrap();
        for name in ["../etc/passwd", "/gpt2", "org/../name", "gpt2;rm -rf", "a/b/c", ""] {
            let store = MemoryStore::default();
            let fetcher = FakeFetcher::with_files(gpt2_files());
            let mut input = raw(base.path());
            input.model_name = name.to_string();

            let result = run_raw(&input, &store, &fetcher).await;

            assert!(
                matches!(result, RunResult::Failed { stage: FailureStage::Validation, .. }),
                "{name}"
            );
            assert_eq!(result.exit_code(), 1);
            assert_eq!(store.calls(), 0, "{name}");
            assert_eq!(fetcher.call_count(), 0, "{name}");
        }
    }

    #[tokio::test]
    async fn validation_failure_names_the_field() {
        let base = tempfile::tempdir().unwrap();
        let mut input = raw(base.path());
        input.s3_bucket = "Not_A_Bucket".to_string();
        let err = input.validate().unwrap_err();
        assert_eq!(err.field, Field::Bucket);
    }

    #[tokio::test]
    async fn existing_prefix_is_a_cache_hit() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_object("models/gpt2/config.json");
        let fetcher = FakeFetcher::with_files(gpt2_files());
        let config = raw(base.path()).validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        assert_eq!(result, RunResult::CacheHit);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(fetcher.call_count(), 0);
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn similarly_named_artifact_is_not_a_hit() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::with_object("models/gpt2-large/config.json");
        let fetcher = FakeFetcher::with_files(gpt2_files());
        let config = raw(base.path()).validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        assert!(matches!(result, RunResult::CachePopulated { .. }));
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn gpt2_populates_an_empty_store() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let fetcher = FakeFetcher::with_files(gpt2_files());
        let config = raw(base.path()).validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        assert_eq!(
            result,
            RunResult::CachePopulated {
                file_count: 4,
                total_bytes: 15 + 7 + 2 + 5,
            }
        );
        assert_eq!(result.exit_code(), 0);
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(fetcher.calls.lock().unwrap()[0].0, "gpt2");
        assert_eq!(store.puts.load(Ordering::SeqCst), 4);
        assert_eq!(
            store.keys(),
            [
                "models/gpt2/config.json",
                "models/gpt2/model.safetensors",
                "models/gpt2/onnx/decoder_model.onnx",
                "models/gpt2/tokenizer.json",
            ]
        );
        assert!(!fetcher.staged_at().exists());
    }

    #[tokio::test]
    async fn one_failed_upload_fails_the_run_and_still_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore {
            fail_keys: vec!["models/gpt2/model.safetensors".to_string()],
            ..MemoryStore::default()
        };
        let fetcher = FakeFetcher::with_files(gpt2_files());
        let config = raw(base.path()).validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        assert!(matches!(
            result,
            RunResult::Failed {
                stage: FailureStage::Upload,
                ..
            }
        ));
        assert_eq!(result.exit_code(), 1);
        assert!(!fetcher.staged_at().exists());
    }

    #[tokio::test]
    async fn fetch_failure_skips_upload_and_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let fetcher = FakeFetcher::failing(|artifact| FetchError::NotFound {
            artifact: artifact.to_string(),
            revision: "main".to_string(),
            what: "repository".to_string(),
        });
        let config = raw(base.path()).validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        match &result {
            RunResult::Failed { stage, cause } => {
                assert_eq!(*stage, FailureStage::Fetch);
                assert!(cause.contains("not found"));
            }
            other => panic!("unexpected result {other}"),
        }
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
        assert!(!fetcher.staged_at().exists());
    }

    #[tokio::test]
    async fn empty_artifact_succeeds_with_nothing_uploaded() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let fetcher = FakeFetcher::with_files(Vec::new());
        let config = raw(base.path()).validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        assert_eq!(
            result,
            RunResult::CachePopulated {
                file_count: 0,
                total_bytes: 0,
            }
        );
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_cause_never_contains_secrets() {
        let base = tempfile::tempdir().unwrap();
        let store = MemoryStore {
            fail_keys: vec!["models/gpt2/config.json".to_string()],
            ..MemoryStore::default()
        };
        let fetcher = FakeFetcher::with_files(gpt2_files());
        let input = raw(base.path());
        let config = input.validate().unwrap();

        let result = Loader::new(&config, &store, &fetcher).run().await;

        let cause = match result {
            RunResult::Failed { cause, .. } => cause,
            other => panic!("unexpected result {other}"),
        };
        assert!(!cause.contains(&input.aws_access_key_id));
        assert!(!cause.contains(&input.aws_secret_access_key));
        assert_eq!(format!("{}", config.access_key_id), "AKIA...1234");
    }
}
