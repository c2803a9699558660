//! Shared plumbing for HTTP-backed adapters
use super::{AdapterError, Backend};
use reqwest::{Client, Response, StatusCode};
use std::time::Duration;
use tracing::warn;

/// Build a client with a per-request deadline
///
/// `verify_tls = false` accepts any certificate; only the batch-job client
/// exposes that switch.
pub fn build_client(timeout: Duration, verify_tls: bool) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .build()
}

/// Join path segments onto a base URL, percent-encoding each segment
pub fn join_url(base: &str, parts: &[&str]) -> String {
    let mut url = base.trim_end_matches('/').to_string();
    for part in parts {
        url.push('/');
        url.push_str(&urlencoding::encode(part));
    }
    url
}

/// Map a transport failure (connect, timeout, body read)
pub fn transport_error(backend: Backend, err: reqwest::Error) -> AdapterError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        err.to_string()
    };
    AdapterError::unavailable(backend, message)
}

/// Pass 2xx through; 4xx is a definite rejection, anything else is unavailable
pub async fn check_status(backend: Backend, resp: Response) -> Result<Response, AdapterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    warn!(
        backend = %backend,
        status = status.as_u16(),
        url = %url,
        body = %body,
        "Backend returned error status"
    );

    Err(status_error(backend, status, body))
}

pub fn status_error(backend: Backend, status: StatusCode, body: String) -> AdapterError {
    let message = if body.is_empty() {
        status.canonical_reason().unwrap_or("error").to_string()
    } else {
        body
    };

    if status.is_client_error() {
        AdapterError::Rejected {
            backend,
            status: status.as_u16(),
            message,
        }
    } else {
        AdapterError::Unavailable {
            backend,
            message: format!("HTTP {}: {}", status.as_u16(), message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url_encodes_segments() {
        assert_eq!(
            join_url("http://ds/api/", &["users", "alice", "exists"]),
            "http://ds/api/users/alice/exists"
        );
        assert_eq!(
            join_url("http://lists", &["mailman", "admin", "a b"]),
            "http://lists/mailman/admin/a%20b"
        );
    }

    #[test]
    fn test_status_error_classification() {
        let rejected = status_error(Backend::Storage, StatusCode::CONFLICT, "exists".into());
        assert!(matches!(
            rejected,
            AdapterError::Rejected { status: 409, .. }
        ));

        let down = status_error(Backend::Storage, StatusCode::BAD_GATEWAY, String::new());
        assert!(down.is_transient());
        assert!(down.to_string().contains("502"));
    }
}
