// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient HTTP transport.
//!
//! A drop-in replacement for executing a request on a plain `reqwest::Client`
//! that retries on failure:
//!
//! - any error raised while sending (connection refused, reset, timeout)
//! - a `502`, `503` or `504` response
//!
//! Every other status (including `4xx`, `200` and `201`) is returned to the
//! caller untouched. Bodies are held in memory in [`HttpRequest`] so each
//! attempt resends exactly the same bytes.
//!
//! When retries run out the last response or error is returned as-is; no
//! new error type is synthesized. Intermediate failed responses are drained
//! before the next attempt so the connection can go back to the pool.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use event_replication::resilience::RetryConfig;
//! use event_replication::transport::{HttpRequest, RetryingClient};
//!
//! let client = RetryingClient::new(RetryConfig::with_max_retries(10))?;
//! let request = HttpRequest::post("http://events:8080/event/worklog", b"{}".to_vec())
//!     .header("Content-Type", "application/json");
//! let response = client.execute(&request).await?;
//! assert_eq!(response.status().as_u16(), 201);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use reqwest::{Client, Method, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Connect timeout applied to every attempt. Body reads are not bounded,
/// since the event stream is a long-lived response.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A request whose body is fully buffered so it can be replayed.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Build a request with no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// `GET url`
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// `POST url` with the given body.
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Set a header. Values are validated by `reqwest` at send time.
    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Replace the body.
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Value of the first header with this name (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn operation(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Statuses that indicate the gateway, not the request, is at fault.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Decide whether an attempt's outcome warrants another attempt.
///
/// Builder errors (bad URL, invalid header value) fail identically on every
/// attempt, so they are returned immediately.
fn should_retry(outcome: &std::result::Result<Response, reqwest::Error>) -> bool {
    match outcome {
        Ok(response) => is_retryable_status(response.status()),
        Err(e) => !e.is_builder(),
    }
}

/// Read and discard the rest of a response so its connection can be reused.
async fn drain_body(mut response: Response) {
    while let Ok(Some(_)) = response.chunk().await {}
}

/// HTTP client that retries transient failures with exponential backoff.
///
/// Cloning is cheap: the inner `reqwest::Client` shares its connection pool.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    client: Client,
    retry: RetryConfig,
}

impl RetryingClient {
    /// Create a client with a fresh connection pool.
    pub fn new(retry: RetryConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ReplicationError::Config(format!("http client build failed: {e}")))?;
        Ok(Self { client, retry })
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn with_client(client: Client, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Get the retry configuration.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Send one attempt.
    async fn send_once(&self, request: &HttpRequest) -> std::result::Result<Response, reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }
        builder.send().await
    }

    /// Execute a request, retrying per the configured schedule.
    ///
    /// Returns the final response (which may itself be a 502/503/504 if
    /// retries ran out) or the final transport error.
    pub async fn execute(&self, request: &HttpRequest) -> std::result::Result<Response, reqwest::Error> {
        let mut attempt = 0usize;

        loop {
            let outcome = self.send_once(request).await;

            if !should_retry(&outcome) {
                if attempt > 0 {
                    debug!(
                        operation = %request.operation(),
                        attempts = attempt + 1,
                        "Request settled after retry"
                    );
                }
                return outcome;
            }

            if attempt >= self.retry.max_retries {
                warn!(
                    operation = %request.operation(),
                    attempts = attempt + 1,
                    "Retries exhausted"
                );
                metrics::record_transport_exhausted(request.method.as_str());
                return outcome;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            let cause = match outcome {
                Ok(response) => {
                    let status = response.status().as_u16();
                    warn!(
                        operation = %request.operation(),
                        status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Gateway error, retrying"
                    );
                    drain_body(response).await;
                    "status"
                }
                Err(e) => {
                    warn!(
                        operation = %request.operation(),
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transport error, retrying"
                    );
                    "error"
                }
            };
            metrics::record_transport_retry(request.method.as_str(), cause);

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
