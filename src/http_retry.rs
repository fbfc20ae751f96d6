//! HTTP send with automatic retry and backoff.
//!
//! Only establishing the response is retried. Once the body starts streaming,
//! failures surface to the resource loader, which keeps whatever arrived.

use http::HeaderMap;
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of send attempts (1 initial + 1 retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default backoff between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 500;

/// Configuration for [`send_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts (minimum 1; 0 is treated as 1).
    pub max_attempts: u32,
    /// Sleep duration between consecutive attempts.
    pub backoff: Duration,
    /// Optional per-request timeout applied to each individual attempt.
    ///
    /// When `None`, the client's own timeout applies. The timeout covers the whole
    /// transfer including the body, so leave it unset for long media streams.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: None,
        }
    }
}

async fn send_once(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    timeout: Option<Duration>,
) -> Result<Response, reqwest::Error> {
    let mut request = client.get(url).headers(headers.clone());
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    request.send().await
}

/// Send a GET with `headers`, retrying with backoff.
///
/// Up to `config.max_attempts` sends, sleeping `config.backoff` in between. Transport
/// failures and 5xx answers are retried; client errors (4xx) are returned at once,
/// since a 404 or 416 will not change on a second try.
///
/// # Errors
///
/// The first client error, or the last transport or non-2xx error once every attempt
/// is used up.
pub async fn send_with_retry(
    client: &Client,
    url: &str,
    headers: &HeaderMap,
    config: &RetryConfig,
) -> Result<Response, reqwest::Error> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let last = attempt == max_attempts;
        match send_once(client, url, headers, config.timeout).await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) if response.status().is_client_error() => {
                debug!("Origin answered {} for {}", response.status(), url);
                return response.error_for_status();
            }
            Ok(response) => {
                warn!(
                    "Origin answered {} for {} (attempt {}/{})",
                    response.status(),
                    url,
                    attempt,
                    max_attempts
                );
                if last {
                    return response.error_for_status();
                }
            }
            Err(e) => {
                warn!(
                    "Request to {} failed (attempt {}/{}): {}",
                    url, attempt, max_attempts, e
                );
                if last {
                    return Err(e);
                }
            }
        }

        debug!("Retrying {} in {}ms", url, config.backoff.as_millis());
        tokio::time::sleep(config.backoff).await;
        attempt += 1;
    }
}
