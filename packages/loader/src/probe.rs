//! Remote existence check.

use std::time::Duration;

use model_cache_store::{ObjectStore, StoreError, StoreErrorKind};

use crate::CacheError;
use crate::naming::RemoteLocation;
use crate::retry::RetryPolicy;

/// Returns `true` if any object exists under `location`'s prefix.
///
/// Each attempt is a single listing capped at one key and bounded by
/// `timeout`; a timed-out attempt counts as transient. Transient failures
/// are retried under `policy`, access failures are not retried at all.
///
/// # Errors
///
/// * [`CacheError::Access`] if the store rejected the credentials
/// * [`CacheError::Transient`] if every attempt failed transiently
/// * [`CacheError::Probe`] for any other store failure
pub async fn exists(
    store: &dyn ObjectStore,
    location: &RemoteLocation,
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<bool, CacheError> {
    log::info!("Checking whether {location} already holds objects...");

    let result = policy
        .run(
            |_| probe_once(store, location, timeout),
            StoreError::is_transient,
        )
        .await;

    match result {
        Ok(found) => {
            if found {
                log::info!("Found existing objects under {location}");
            } else {
                log::info!("No objects under {location}");
            }
            Ok(found)
        }
        Err(exhausted) => {
            let location = location.to_string();
            Err(match exhausted.error.kind() {
                StoreErrorKind::Access => CacheError::Access {
                    location,
                    source: exhausted.error,
                },
                StoreErrorKind::Transient => CacheError::Transient {
                    location,
                    attempts: exhausted.attempts,
                    source: exhausted.error,
                },
                StoreErrorKind::Other => CacheError::Probe {
                    location,
                    source: exhausted.error,
                },
            })
        }
    }
}

async fn probe_once(
    store: &dyn ObjectStore,
    location: &RemoteLocation,
    timeout: Duration,
) -> Result<bool, StoreError> {
    let request = store.exists_under(location.bucket(), location.prefix());
    tokio::time::timeout(timeout, request)
        .await
        .unwrap_or_else(|elapsed| {
            Err(StoreError::Transient {
                bucket: location.bucket().to_string(),
                key: location.prefix().to_string(),
                source: Box::new(elapsed),
            })
        })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use model_cache_models::{ArtifactId, BucketName, KeyPrefix};

    use super::*;

    type Step = fn(&str) -> Result<bool, StoreError>;

    /// Answers probes from a script, then repeats the last entry.
    struct ScriptedStore {
        script: Mutex<Vec<Step>>,
        calls: AtomicU32,
        delay: Duration,
    }

    impl ScriptedStore {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl ObjectStore for ScriptedStore {
        async fn exists_under(&self, _bucket: &BucketName, prefix: &str) -> Result<bool, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let step = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.remove(0)
                } else {
                    script[0]
                }
            };
            step(prefix)
        }

        async fn put_file(&self, _: &BucketName, _: &str, _: &Path) -> Result<u64, StoreError> {
            unreachable!("probe never uploads")
        }
    }

    fn missing(_prefix: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn present_at_canonical_prefix(prefix: &str) -> Result<bool, StoreError> {
        Ok(prefix == "models/gpt2/")
    }

    fn transient(prefix: &str) -> Result<bool, StoreError> {
        Err(StoreError::Transient {
            bucket: "my-cache".to_string(),
            key: prefix.to_string(),
            source: "connection reset".into(),
        })
    }

    fn denied(prefix: &str) -> Result<bool, StoreError> {
        Err(StoreError::Access {
            bucket: "my-cache".to_string(),
            key: prefix.to_string(),
            message: "AccessDenied".to_string(),
        })
    }

    fn location() -> RemoteLocation {
        RemoteLocation::new(
            &BucketName::parse("my-cache").unwrap(),
            &KeyPrefix::parse("models/").unwrap(),
            &ArtifactId::parse("gpt2").unwrap(),
        )
    }

    fn instant(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn probes_the_canonical_prefix() {
        let store = ScriptedStore::new(vec![present_at_canonical_prefix as Step]);
        let found = exists(&store, &location(), &instant(3), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(found);
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = ScriptedStore::new(vec![transient as Step, transient, missing]);
        let found = exists(&store, &location(), &instant(3), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!found);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_become_fatal_after_bounded_attempts() {
        let store = ScriptedStore::new(vec![transient as Step]);
        let err = exists(&store, &location(), &instant(3), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Transient { attempts: 3, .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn access_errors_are_not_retried() {
        let store = ScriptedStore::new(vec![denied as Step]);
        let err = exists(&store, &location(), &instant(3), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Access { .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timed_out_attempts_count_as_transient() {
        let mut store = ScriptedStore::new(vec![present_at_canonical_prefix as Step]);
        store.delay = Duration::from_millis(200);
        let err = exists(&store, &location(), &instant(2), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Transient { attempts: 2, .. }));
    }
}
