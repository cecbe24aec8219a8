//! Fetch stage: materialises the artifact in the staging directory.

use std::path::Path;
use std::time::Instant;

use model_cache_hub::{ArtifactFetcher, FetchSummary};

use crate::config::CacheConfig;
use crate::upload::TransferTask;
use crate::CacheError;

/// How many of the largest staged files to log.
const LARGEST_FILES_LOGGED: usize = 5;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fetches the configured artifact into `destination`.
///
/// # Errors
///
/// Returns [`CacheError::Fetch`] carrying the fetcher's classification
/// (unauthorized, not found or transfer).
pub async fn run(
    fetcher: &dyn ArtifactFetcher,
    config: &CacheConfig,
    destination: &Path,
) -> Result<FetchSummary, CacheError> {
    log::info!(
        "Fetching '{}' at revision '{}' into {}",
        config.artifact,
        config.revision,
        destination.display()
    );
    if config.hub_token.is_none() {
        log::info!("No HF_TOKEN set; only public repositories can be fetched");
    }

    let started = Instant::now();
    let summary = fetcher
        .fetch(
            &config.artifact,
            &config.revision,
            destination,
            config.hub_token.as_ref(),
        )
        .await?;
    let elapsed = started.elapsed();

    log::info!(
        "Fetched {} files ({}) in {:.1}s",
        summary.file_count,
        format_bytes(summary.total_bytes),
        elapsed.as_secs_f64()
    );
    if elapsed.as_secs_f64() > 0.0 {
        #[allow(clippy::cast_precision_loss)]
        let throughput = summary.total_bytes as f64 / BYTES_PER_MB / elapsed.as_secs_f64();
        log::info!("Average download speed: {throughput:.2} MB/s");
    }

    Ok(summary)
}

/// Checks the enumerated staging contents against what the fetcher
/// reported, and logs the largest files.
///
/// # Errors
///
/// Returns [`CacheError::IncompleteFetch`] if the file counts differ.
pub fn verify_staged(summary: &FetchSummary, tasks: &[TransferTask]) -> Result<(), CacheError> {
    let found = tasks.len() as u64;
    if found != summary.file_count {
        return Err(CacheError::IncompleteFetch {
            expected: summary.file_count,
            found,
        });
    }

    let mut by_size: Vec<&TransferTask> = tasks.iter().collect();
    by_size.sort_by(|a, b| b.size().cmp(&a.size()));
    if !by_size.is_empty() {
        log::info!("Largest files:");
    }
    for task in by_size.into_iter().take(LARGEST_FILES_LOGGED) {
        log::info!("  {}: {}", task.relative_path(), format_bytes(task.size()));
    }
    Ok(())
}

/// Formats a byte count with a binary unit, e.g. `1.5 GiB`.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
