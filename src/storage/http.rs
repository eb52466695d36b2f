//! HTTP status classification shared by the REST-backed adapters.

use std::time::Duration;

use reqwest::{Response, StatusCode};

use super::traits::AdapterError;

/// Map a transport-level failure (connect, timeout, TLS) into the taxonomy.
pub(crate) fn transport_error(store: &str, err: reqwest::Error) -> AdapterError {
    if err.is_decode() {
        return AdapterError::Rejected(format!("{}: undecodable response: {}", store, err));
    }
    AdapterError::Unavailable(format!("{}: {}", store, err))
}

/// Map a non-success status code into the taxonomy.
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> AdapterError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited { retry_after },
        StatusCode::NOT_FOUND => AdapterError::NotFound,
        StatusCode::REQUEST_TIMEOUT => AdapterError::Unavailable(format!("{}: {}", status, body)),
        s if s.is_server_error() => AdapterError::Unavailable(format!("{}: {}", status, body)),
        _ => AdapterError::Rejected(format!("{}: {}", status, body)),
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Turn an unsuccessful response into an [`AdapterError`], passing
/// successful ones through.
pub(crate) async fn check(store: &str, response: Response) -> Result<Response, AdapterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let hint = retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let err = classify_status(status, hint, &body);
    tracing::debug!(store, %status, error = %err, "store returned an error status");
    Err(err)
}
