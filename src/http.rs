//! Shared request handling for the HTTP-backed collaborators.
//!
//! Every outbound JSON call (embeddings, chat completion, Slack Web API)
//! goes through [`send_json`], which turns transport failures and non-2xx
//! statuses into classified [`ServiceError`]s so the resilience layer can
//! decide what to retry.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::error::ServiceError;

/// Build a client with a request timeout.
pub fn client(timeout_secs: u64) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ServiceError::from_reqwest("http", e))
}

/// Send a request and decode a JSON body.
///
/// Non-success statuses become a [`ServiceError`] classified by status
/// code, carrying the server's `Retry-After` hint when present.
pub async fn send_json(
    service: &'static str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ServiceError> {
    let response = request
        .send()
        .await
        .map_err(|e| ServiceError::from_reqwest(service, e))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::from_status(service, status, &body).with_retry_after(retry_after));
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ServiceError::from_reqwest(service, e))
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
