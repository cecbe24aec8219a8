//! Run-scoped local staging directory.

use std::path::{Path, PathBuf};

use model_cache_models::ArtifactId;
use tempfile::TempDir;

use crate::config::is_disallowed_base_dir;
use crate::naming;

/// Errors creating or verifying the staging directory.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// Filesystem operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path being operated on.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A symlink sits where the staging directory should be created.
    #[error("Refusing to use {path}: it is a symbolic link")]
    Symlink {
        /// Offending path.
        path: String,
    },

    /// The base directory resolves to a system directory.
    #[error("Refusing to stage under {path}: it resolves to the system directory {resolved}")]
    DisallowedBase {
        /// Base directory as configured.
        path: String,
        /// Symlink-resolved base directory.
        resolved: String,
    },

    /// The created directory resolves outside the base directory.
    #[error("Staging directory {path} resolves outside of base directory {base}")]
    Escape {
        /// Resolved staging path.
        path: String,
        /// Resolved base directory.
        base: String,
    },
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// The directory fetched files are written to before upload.
///
/// Removed by [`Self::close`], or on drop if the run is abandoned before
/// reaching cleanup (for example when the process is interrupted).
#[derive(Debug)]
pub struct StagingDirectory {
    dir: TempDir,
}

impl StagingDirectory {
    /// Creates the staging directory for `artifact` under `base`.
    ///
    /// `base` is resolved through symlinks and checked against the system
    /// directories before anything is created; missing components are then
    /// created. A directory left behind by an earlier, killed run is
    /// removed first.
    /// The new directory is created exclusively, readable only by the
    /// current user, and must resolve inside the resolved base.
    ///
    /// # Errors
    ///
    /// * [`StagingError::DisallowedBase`] if `base` resolves to a system
    ///   directory
    /// * [`StagingError::Symlink`] if a symlink occupies the staging path
    /// * [`StagingError::Escape`] if the result resolves outside `base`
    /// * [`StagingError::Io`] for any filesystem failure
    pub async fn create(base: &Path, artifact: &ArtifactId) -> Result<Self, StagingError> {
        let resolved = resolve_missing(base).await?;
        check_base(base, &resolved)?;
        tokio::fs::create_dir_all(&resolved)
            .await
            .map_err(|e| StagingError::io(&resolved, e))?;
        let canonical = tokio::fs::canonicalize(&resolved)
            .await
            .map_err(|e| StagingError::io(&resolved, e))?;
        check_base(base, &canonical)?;
        let base = canonical;

        let target = naming::staging_dir(&base, artifact);
        remove_stale(&target).await?;

        let name = naming::staging_dir_name(artifact);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&name).rand_bytes(0);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            builder.permissions(std::fs::Permissions::from_mode(0o700));
        }
        let dir = builder
            .tempdir_in(&base)
            .map_err(|e| StagingError::io(&target, e))?;

        let resolved = tokio::fs::canonicalize(dir.path())
            .await
            .map_err(|e| StagingError::io(dir.path(), e))?;
        if !resolved.starts_with(&base) || resolved == base {
            return Err(StagingError::Escape {
                path: resolved.display().to_string(),
                base: base.display().to_string(),
            });
        }

        log::info!("Created staging directory {}", dir.path().display());
        Ok(Self { dir })
    }

    /// Path of the staging directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Removes the directory and everything in it.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::Io`] if removal fails.
    pub fn close(self) -> Result<(), StagingError> {
        let path: PathBuf = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| StagingError::io(&path, e))
    }
}

/// Resolves `path` through its deepest existing ancestor, keeping the
/// components that do not exist yet.
async fn resolve_missing(path: &Path) -> Result<PathBuf, StagingError> {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        match tokio::fs::canonicalize(existing).await {
            Ok(resolved) => {
                return Ok(missing
                    .iter()
                    .rev()
                    .fold(resolved, |acc: PathBuf, part| acc.join(part)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        missing.push(name.to_os_string());
                        existing = parent;
                    }
                    _ => return Err(StagingError::io(path, e)),
                }
            }
            Err(e) => return Err(StagingError::io(existing, e)),
        }
    }
}

fn check_base(base: &Path, resolved: &Path) -> Result<(), StagingError> {
    if is_disallowed_base_dir(resolved) {
        return Err(StagingError::DisallowedBase {
            path: base.display().to_string(),
            resolved: resolved.display().to_string(),
        });
    }
    Ok(())
}

async fn remove_stale(target: &Path) -> Result<(), StagingError> {
    let metadata = match tokio::fs::symlink_metadata(target).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(StagingError::io(target, e)),
    };

    if metadata.file_type().is_symlink() {
        return Err(StagingError::Symlink {
            path: target.display().to_string(),
        });
    }

    log::warn!(
        "Removing stale staging directory {} from an earlier run",
        target.display()
    );
    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(target).await
    } else {
        tokio::fs::remove_file(target).await
    };
    removed.map_err(|e| StagingError::io(target, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ArtifactId {
        ArtifactId::parse("openai-community/gpt2").unwrap()
    }

    #[tokio::test]
    async fn creates_named_directory_inside_base() {
        let base = tempfile::tempdir().unwrap();
        let staging = StagingDirectory::create(base.path(), &artifact()).await.unwrap();

        let canonical_base = std::fs::canonicalize(base.path()).unwrap();
        assert_eq!(
            staging.path(),
            canonical_base.join("models--openai-community--gpt2")
        );
        assert!(staging.path().is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn directory_is_private_to_the_owner() {
        use std::os::unix::fs::PermissionsExt as _;

        let base = tempfile::tempdir().unwrap();
        let staging = StagingDirectory::create(base.path(), &artifact()).await.unwrap();
        let mode = std::fs::metadata(staging.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn missing_base_is_created() {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().join("nested").join("cache");
        let staging = StagingDirectory::create(&base, &artifact()).await.unwrap();
        assert!(staging.path().starts_with(std::fs::canonicalize(&base).unwrap()));
    }

    #[tokio::test]
    async fn stale_directory_is_replaced() {
        let base = tempfile::tempdir().unwrap();
        let stale = base.path().join("models--openai-community--gpt2");
        std::fs::create_dir_all(stale.join("sub")).unwrap();
        std::fs::write(stale.join("sub").join("leftover.bin"), b"old").unwrap();

        let staging = StagingDirectory::create(base.path(), &artifact()).await.unwrap();
        assert!(!staging.path().join("sub").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_at_staging_path_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(
            elsewhere.path(),
            base.path().join("models--openai-community--gpt2"),
        )
        .unwrap();

        let err = StagingDirectory::create(base.path(), &artifact())
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Symlink { .. }));
        assert!(elsewhere.path().exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn base_linked_to_a_system_directory_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let link = root.path().join("cache");
        std::os::unix::fs::symlink("/etc", &link).unwrap();

        let validated = crate::config::normalize_base_dir(&link).unwrap();
        let err = StagingDirectory::create(&validated, &artifact())
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::DisallowedBase { .. }), "{err}");
        assert!(!Path::new("/etc/models--openai-community--gpt2").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_base_under_a_linked_root_is_resolved_before_creation() {
        let root = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let link = root.path().join("link");
        std::os::unix::fs::symlink(target.path(), &link).unwrap();

        let staging = StagingDirectory::create(&link.join("a").join("b"), &artifact())
            .await
            .unwrap();
        let canonical_target = std::fs::canonicalize(target.path()).unwrap();
        assert!(staging.path().starts_with(canonical_target.join("a").join("b")));
    }

    #[tokio::test]
    async fn close_removes_everything() {
        let base = tempfile::tempdir().unwrap();
        let staging = StagingDirectory::create(base.path(), &artifact()).await.unwrap();
        let path = staging.path().to_path_buf();
        std::fs::write(path.join("config.json"), b"{}").unwrap();

        staging.close().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn drop_removes_the_directory() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let staging = StagingDirectory::create(base.path(), &artifact()).await.unwrap();
            staging.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
