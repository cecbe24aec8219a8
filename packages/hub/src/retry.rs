//! HTTP retry helpers for transient registry errors.
//!
//! Every request to the hub goes through [`send`] instead of calling
//! `reqwest::RequestBuilder::send()` directly, so connection failures,
//! timeouts, rate limiting and server errors are retried with exponential
//! backoff. Client errors (4xx other than 429) are permanent and returned
//! immediately with their status so the caller can tell "unauthorized"
//! from "not found".

use std::time::Duration;

use reqwest::StatusCode;

/// Maximum number of retry attempts for transient HTTP errors.
///
/// With the default 2s base delay the backoff is 2s, 4s, 8s, 16s, 32s, a
/// total wait of 62 seconds before giving up on a single request.
pub const MAX_RETRIES: u32 = 5;

/// Default base delay; doubled on every retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Why a request ultimately failed.
#[derive(Debug)]
pub enum RequestError {
    /// The server answered with a non-success status.
    Status(StatusCode),
    /// The request could not be sent or the connection failed.
    Http(reqwest::Error),
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Http(e) => write!(f, "{e}"),
        }
    }
}

/// Backoff schedule for one request.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Sends the request built by `build_request`, retrying transient errors.
///
/// The closure is called on each attempt to construct a fresh
/// [`reqwest::RequestBuilder`] (builders are consumed by `.send()`).
/// Returns the successful [`reqwest::Response`] (status 2xx or 3xx).
///
/// # Errors
///
/// Returns [`RequestError::Status`] for permanent client errors or when
/// retries are exhausted on 429/5xx, and [`RequestError::Http`] when the
/// connection keeps failing.
#[allow(clippy::future_not_send)]
pub async fn send<F>(build_request: F, backoff: Backoff) -> Result<reqwest::Response, RequestError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = backoff.delay(attempt);
            log::warn!("  retry {attempt}/{} in {delay:?}...", backoff.max_retries);
            tokio::time::sleep(delay).await;
        }
        let retries_left = attempt < backoff.max_retries;
        attempt += 1;

        match build_request().send().await {
            Err(e) => {
                if is_transient(&e) && retries_left {
                    log::warn!("  transient error: {e}");
                    continue;
                }
                return Err(RequestError::Http(e));
            }
            Ok(response) => {
                let status = response.status();

                if is_retryable_status(status) {
                    if retries_left {
                        log::warn!("  HTTP {status} from {}", response.url());
                        continue;
                    }
                    return Err(RequestError::Status(status));
                }

                if status.is_client_error() || status.is_server_error() {
                    return Err(RequestError::Status(status));
                }

                return Ok(response);
            }
        }
    }
}

/// Returns `true` for 429 and 5xx responses.
#[must_use]
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_delay() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[tokio::test]
    async fn connection_failures_surface_after_retries() {
        let client = reqwest::Client::new();
        let backoff = Backoff {
            max_retries: 1,
            base_delay: Duration::ZERO,
        };
        let err = send(|| client.get("http://127.0.0.1:9/unreachable"), backoff)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Http(_)));
    }
}
