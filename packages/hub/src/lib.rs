#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Hugging Face Hub snapshot fetcher.
//!
//! Materialises every file of a model repository at a given revision under
//! a local directory, preserving the repository's relative layout:
//!
//! 1. `GET {endpoint}/api/models/{repo}/revision/{revision}` lists the
//!    repository files (`siblings[].rfilename`).
//! 2. Each file name is validated as a [`RelativeFilePath`] so a hostile
//!    listing cannot write outside the destination directory.
//! 3. Files are streamed from `{endpoint}/{repo}/resolve/{revision}/{file}`
//!    with a bounded number of downloads in flight.
//!
//! Transient HTTP failures are retried inside this crate (see [`retry`]);
//! callers only see the final [`FetchError`], classified as
//! unauthorized, not found, or a generic transfer failure.

pub mod retry;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt as _, StreamExt as _, TryStreamExt as _};
use model_cache_models::{ArtifactId, RelativeFilePath, Revision, Secret};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use strum_macros::Display;
use tokio::io::AsyncWriteExt as _;

use crate::retry::{Backoff, RequestError};

/// Public Hugging Face Hub endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Default number of files downloaded concurrently.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Maximum number of full re-downloads of one file when the body stream
/// breaks mid-transfer.
const MAX_BODY_RETRIES: u32 = 3;

/// Connection establishment timeout for hub requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time without receiving any bytes before a read is abandoned.
pub const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Coarse classification of a [`FetchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FetchErrorKind {
    /// The registry rejected the (missing or insufficient) token.
    Unauthorized,
    /// The repository, revision or file does not exist.
    NotFound,
    /// Any other failure while transferring files.
    Transfer,
}

/// Errors that can occur while fetching an artifact.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP 401/403 from the registry.
    #[error(
        "Unauthorized to fetch '{artifact}' (HTTP {status}): the repository is private or \
         gated; set HF_TOKEN to a token with access"
    )]
    Unauthorized {
        /// Artifact being fetched.
        artifact: String,
        /// HTTP status code.
        status: u16,
    },

    /// HTTP 404 from the registry.
    #[error("'{artifact}' not found at revision '{revision}': {what}")]
    NotFound {
        /// Artifact being fetched.
        artifact: String,
        /// Revision requested.
        revision: String,
        /// What was missing (the repository or a specific file).
        what: String,
    },

    /// Any other failure.
    #[error("Failed to fetch '{artifact}': {message}")]
    Transfer {
        /// Artifact being fetched.
        artifact: String,
        /// Description of what went wrong.
        message: String,
    },
}

impl FetchError {
    /// Returns the coarse classification of this error.
    #[must_use]
    pub const fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Unauthorized { .. } => FetchErrorKind::Unauthorized,
            Self::NotFound { .. } => FetchErrorKind::NotFound,
            Self::Transfer { .. } => FetchErrorKind::Transfer,
        }
    }

    fn transfer(artifact: &ArtifactId, message: impl Into<String>) -> Self {
        Self::Transfer {
            artifact: artifact.to_string(),
            message: message.into(),
        }
    }
}

/// What a successful fetch produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Number of files written under the destination directory.
    pub file_count: u64,
    /// Total bytes written.
    pub total_bytes: u64,
}

/// The fetch operation the loader depends on.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Writes every file of `artifact` at `revision` under `destination`,
    /// preserving relative paths.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the listing or any file transfer fails.
    /// On error the destination contents are incomplete.
    async fn fetch(
        &self,
        artifact: &ArtifactId,
        revision: &Revision,
        destination: &Path,
        token: Option<&Secret>,
    ) -> Result<FetchSummary, FetchError>;
}

/// Repository metadata returned by the hub API (only the parts we use).
#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

/// [`ArtifactFetcher`] over the Hugging Face Hub HTTP API.
pub struct HubClient {
    client: reqwest::Client,
    endpoint: Url,
    concurrency: usize,
    backoff: Backoff,
}

impl HubClient {
    /// Creates a client for the hub at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`reqwest::Error`] if the HTTP client cannot be built.
    pub fn new(endpoint: Url, concurrency: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("model-cache/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            concurrency: concurrency.max(1),
            backoff: Backoff::default(),
        })
    }

    /// Overrides the retry backoff schedule.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Lists the files of `artifact` at `revision`.
    async fn list_files(
        &self,
        artifact: &ArtifactId,
        revision: &Revision,
        token: Option<&Secret>,
    ) -> Result<Vec<RelativeFilePath>, FetchError> {
        let url = api_url(&self.endpoint, artifact, revision)
            .ok_or_else(|| FetchError::transfer(artifact, "hub endpoint is not a base URL"))?;
        log::debug!("Listing repository files: {url}");

        let response = retry::send(|| authorize(self.client.get(url.clone()), token), self.backoff)
            .await
            .map_err(|e| map_request_error(e, artifact, revision, "repository"))?;

        let info: ModelInfo = response.json().await.map_err(|e| {
            FetchError::transfer(artifact, format!("invalid repository listing: {e}"))
        })?;

        parse_siblings(artifact, info)
    }

    /// Downloads one file, re-fetching from scratch if the body stream
    /// breaks. Returns the number of bytes written.
    async fn download_file(
        &self,
        artifact: &ArtifactId,
        revision: &Revision,
        file: &RelativeFilePath,
        destination: &Path,
        token: Option<&Secret>,
    ) -> Result<u64, FetchError> {
        let url = resolve_url(&self.endpoint, artifact, revision, file)
            .ok_or_else(|| FetchError::transfer(artifact, "hub endpoint is not a base URL"))?;
        let dest = destination.join(file.to_path());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(artifact, parent, &e))?;
        }

        let mut body_attempt = 0;
        loop {
            let response =
                retry::send(|| authorize(self.client.get(url.clone()), token), self.backoff)
                    .await
                    .map_err(|e| map_request_error(e, artifact, revision, file.as_str()))?;

            match stream_to_file(response, &dest).await {
                Ok(bytes) => {
                    log::debug!("  downloaded {file} ({bytes} bytes)");
                    return Ok(bytes);
                }
                Err(StreamError::Http(e)) if body_attempt < MAX_BODY_RETRIES => {
                    body_attempt += 1;
                    let delay = self.backoff.delay(body_attempt);
                    log::warn!(
                        "  body of {file} broke mid-transfer (retry {body_attempt}/{MAX_BODY_RETRIES} \
                         in {delay:?}): {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(StreamError::Http(e)) => {
                    return Err(FetchError::transfer(
                        artifact,
                        format!("download of {file} failed: {e}"),
                    ));
                }
                Err(StreamError::Io(e)) => return Err(io_error(artifact, &dest, &e)),
            }
        }
    }
}

#[async_trait]
impl ArtifactFetcher for HubClient {
    async fn fetch(
        &self,
        artifact: &ArtifactId,
        revision: &Revision,
        destination: &Path,
        token: Option<&Secret>,
    ) -> Result<FetchSummary, FetchError> {
        let files = self.list_files(artifact, revision, token).await?;
        log::info!(
            "Repository '{artifact}' at '{revision}' has {} files, downloading with {} \
             concurrent transfers",
            files.len(),
            self.concurrency
        );

        let downloads: Vec<_> = files
            .iter()
            .map(|file| {
                self.download_file(artifact, revision, file, destination, token)
                    .boxed()
            })
            .collect();
        let sizes: Vec<u64> = futures::stream::iter(downloads)
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        Ok(FetchSummary {
            file_count: sizes.len() as u64,
            total_bytes: sizes.iter().sum(),
        })
    }
}

enum StreamError {
    Http(reqwest::Error),
    Io(std::io::Error),
}

/// Streams a response body into `dest`, truncating any previous content.
async fn stream_to_file(response: reqwest::Response, dest: &Path) -> Result<u64, StreamError> {
    let mut file = tokio::fs::File::create(dest).await.map_err(StreamError::Io)?;
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StreamError::Http)?;
        file.write_all(&chunk).await.map_err(StreamError::Io)?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(StreamError::Io)?;
    Ok(written)
}

fn authorize(request: reqwest::RequestBuilder, token: Option<&Secret>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token.expose()),
        None => request,
    }
}

/// `{endpoint}/api/models/{owner}/{name}/revision/{revision}`.
///
/// The revision is pushed as a single segment so `refs/pr/1` is encoded
/// as `refs%2Fpr%2F1`.
fn api_url(endpoint: &Url, artifact: &ArtifactId, revision: &Revision) -> Option<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(["api", "models"])
        .extend(artifact.segments())
        .push("revision")
        .push(revision.as_str());
    Some(url)
}

/// `{endpoint}/{owner}/{name}/resolve/{revision}/{file}`.
fn resolve_url(
    endpoint: &Url,
    artifact: &ArtifactId,
    revision: &Revision,
    file: &RelativeFilePath,
) -> Option<Url> {
    let mut url = endpoint.clone();
    url.path_segments_mut()
        .ok()?
        .pop_if_empty()
        .extend(artifact.segments())
        .push("resolve")
        .push(revision.as_str())
        .extend(file.as_str().split('/'));
    Some(url)
}

/// Validates every listed file name; one unsafe name fails the fetch.
fn parse_siblings(
    artifact: &ArtifactId,
    info: ModelInfo,
) -> Result<Vec<RelativeFilePath>, FetchError> {
    let mut files = info
        .siblings
        .into_iter()
        .map(|s| {
            RelativeFilePath::parse(&s.rfilename).map_err(|e| {
                FetchError::transfer(artifact, format!("registry listed an unsafe file: {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    files.sort();
    files.dedup();
    Ok(files)
}

fn map_request_error(
    err: RequestError,
    artifact: &ArtifactId,
    revision: &Revision,
    what: &str,
) -> FetchError {
    match err {
        RequestError::Status(status) => map_status(status, artifact, revision, what),
        RequestError::Http(e) => FetchError::transfer(artifact, format!("{what}: {e}")),
    }
}

fn map_status(status: StatusCode, artifact: &ArtifactId, revision: &Revision, what: &str) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Unauthorized {
            artifact: artifact.to_string(),
            status: status.as_u16(),
        },
        StatusCode::NOT_FOUND => FetchError::NotFound {
            artifact: artifact.to_string(),
            revision: revision.to_string(),
            what: what.to_string(),
        },
        _ => FetchError::transfer(artifact, format!("{what}: HTTP {status}")),
    }
}

fn io_error(artifact: &ArtifactId, path: &Path, e: &std::io::Error) -> FetchError {
    FetchError::transfer(artifact, format!("I/O error at {}: {e}", path.display()))
}
