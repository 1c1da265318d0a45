//! HTTP plumbing shared by the REST adapters

use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::PlatformResult;
use crate::error::{ConfigError, PlatformError, Result};

pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("teamcast/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            ConfigError::InvalidValue {
                field: "http client".to_string(),
                reason: e.to_string(),
            }
            .into()
        })
}

/// Transport failures and timeouts are always retryable
pub(crate) fn transport_error(error: reqwest::Error) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Network(format!("request timed out: {error}"))
    } else {
        PlatformError::Network(error.to_string())
    }
}

/// Map a non-success status to an error, carrying the body verbatim
pub(crate) fn classify(status: StatusCode, headers: &HeaderMap, body: String) -> PlatformError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit {
            message: body,
            retry_after: retry_after(headers),
        },
        StatusCode::UNAUTHORIZED => PlatformError::TokenExpired(body),
        s if s.is_server_error() => PlatformError::Server {
            status: s.as_u16(),
            body,
        },
        s => PlatformError::Rejected {
            status: s.as_u16(),
            body,
        },
    }
}

/// Pass successful responses through; turn everything else into an error
pub(crate) async fn check(response: Response) -> PlatformResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(classify(status, &headers, body))
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> PlatformResult<T> {
    let status = response.status().as_u16();
    let body = response.text().await.map_err(transport_error)?;
    serde_json::from_str(&body).map_err(|e| PlatformError::Rejected {
        status,
        body: format!("unexpected response ({e}): {body}"),
    })
}

/// `Retry-After` in seconds, else an `x-rate-limit-reset` epoch
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_u64(headers, "x-rate-limit-reset")? as i64;
    let wait = reset - Utc::now().timestamp();
    Some(Duration::from_secs(wait.max(0) as u64))
}

pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}


#[cfg(test)]
mod tests {
    use super::test_server::{serve, Canned};
    use super::*;

    async fn get(base: &str) -> PlatformResult<Response> {
        let client = build_client(Duration::from_secs(5)).unwrap();
        let response = client.get(format!("{base}/thing")).send().await.map_err(transport_error)?;
        check(response).await
    }

    #[tokio::test]
    async fn test_status_classification() {
        let (base, _rx) = serve(vec![
            Canned::json(429, "slow down").with_header("retry-after", "7"),
            Canned::json(401, r#"{"title":"Unauthorized"}"#),
            Canned::json(503, "unavailable"),
            Canned::json(400, r#"{"detail":"bad"}"#),
        ])
        .await;

        match get(&base).await.unwrap_err() {
            PlatformError::RateLimit { message, retry_after } => {
                assert_eq!(message, "slow down");
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        let err = get(&base).await.unwrap_err();
        assert_eq!(err, PlatformError::TokenExpired(r#"{"title":"Unauthorized"}"#.to_string()));

        let err = get(&base).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, PlatformError::Server { status: 503, .. }));

        let err = get(&base).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(
            err,
            PlatformError::Rejected {
                status: 400,
                body: r#"{"detail":"bad"}"#.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        // bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = get(&format!("http://{addr}")).await.unwrap_err();
        assert!(matches!(err, PlatformError::Network(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_after_from_reset_header() {
        let mut headers = HeaderMap::new();
        let reset = Utc::now().timestamp() + 60;
        headers.insert("x-rate-limit-reset", reset.to_string().parse().unwrap());
        let wait = retry_after(&headers).unwrap();
        assert!(wait <= Duration::from_secs(60));
        assert!(wait >= Duration::from_secs(55));
    }
}
