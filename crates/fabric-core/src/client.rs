//! Shared HTTP primitive for the operation drivers.
//!
//! One `reqwest::Client` is shared by every driver in an apply; it is safe
//! for concurrent use by the scheduler workers. Connection-level failures
//! are retried here with a fixed interval; everything else is classified and
//! handed back to the driver ladder.

use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ConnRetry;

/// HTTP success code for hardware-control PUT/GET operations.
pub const HTTP_OK: u16 = 200;
/// HTTP success code for extended-procedure POSTs.
pub const HTTP_ACCEPTED: u16 = 202;

/// A parsed HTTP response.
///
/// The body is decoded as JSON when possible, kept as a raw string
/// otherwise, and `Null` when empty.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    /// The `code` field of an error body, when present.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("code").and_then(Value::as_str)
    }
}

/// Classification of a request that never produced an HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request timed out (E40003).
    Timeout,
    /// No TCP connection could be opened, even after transport retries (E40007).
    Unreachable,
    /// Any other transport-level failure (E40008).
    Unexpected,
}

/// A transport-level failure, mapped to its stable code and status.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub uri: String,
    pub message: String,
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self.kind {
            TransportErrorKind::Timeout => "E40003",
            TransportErrorKind::Unreachable => "E40007",
            TransportErrorKind::Unexpected => "E40008",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self.kind {
            TransportErrorKind::Timeout => 504,
            TransportErrorKind::Unreachable | TransportErrorKind::Unexpected => 500,
        }
    }

    /// Error body in the same shape the external services use.
    pub fn body(&self) -> Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.message,
        })
    }
}

/// HTTP client shared across drivers.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    conn_retry_interval: Duration,
    conn_retry_max_count: u32,
}

impl ApiClient {
    pub fn new(conn_retry: &ConnRetry) -> Self {
        Self {
            http: reqwest::Client::new(),
            conn_retry_interval: Duration::from_secs(conn_retry.interval),
            conn_retry_max_count: conn_retry.max_count,
        }
    }

    /// Issue one request, retrying connection failures.
    ///
    /// Connection-level failures (no TCP connection) are retried up to
    /// `conn_retry.max_count` times with a fixed interval; the final failure
    /// is returned. Timeouts and other transport errors are not retried.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        query: Option<&[(&str, String)]>,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<ApiResponse, TransportError> {
        let mut attempt: u32 = 0;
        loop {
            let mut request = self
                .http
                .request(method.clone(), url)
                .timeout(timeout)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(%method, url, attempt, "issuing request");
            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.unwrap_or_default();
                    let body = parse_body(&text);
                    debug!(%method, url, status, "request completed");
                    return Ok(ApiResponse { status, body });
                }
                Err(err) if err.is_timeout() => {
                    return Err(TransportError {
                        kind: TransportErrorKind::Timeout,
                        uri: url.to_owned(),
                        message: format!("request to {url} timed out"),
                    });
                }
                Err(err) if err.is_connect() => {
                    if attempt < self.conn_retry_max_count {
                        attempt += 1;
                        warn!(url, attempt, error = %err, "connection failed, retrying");
                        tokio::time::sleep(self.conn_retry_interval).await;
                        continue;
                    }
                    return Err(TransportError {
                        kind: TransportErrorKind::Unreachable,
                        uri: url.to_owned(),
                        message: format!("url {url} is unreachable"),
                    });
                }
                Err(err) => {
                    return Err(TransportError {
                        kind: TransportErrorKind::Unexpected,
                        uri: url.to_owned(),
                        message: format!("unexpected request error: {err}"),
                    });
                }
            }
        }
    }
}

/// Decode a response body: JSON when possible, raw string otherwise,
/// `Null` when empty.
fn parse_body(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_body_decodes_json() {
        let body = parse_body(r#"{"code": "ER005BAS001"}"#);
        assert_eq!(body["code"], "ER005BAS001");
    }

    #[test]
    fn parse_body_keeps_raw_text() {
        let body = parse_body("plain text");
        assert_eq!(body, Value::String("plain text".into()));
    }

    #[test]
    fn parse_body_empty_is_null() {
        assert_eq!(parse_body(""), Value::Null);
    }

    #[test]
    fn transport_error_codes() {
        let err = TransportError {
            kind: TransportErrorKind::Timeout,
            uri: "http://x".into(),
            message: "m".into(),
        };
        assert_eq!(err.code(), "E40003");
        assert_eq!(err.status_code(), 504);
        assert_eq!(err.body()["code"], "E40003");

        let err = TransportError {
            kind: TransportErrorKind::Unreachable,
            uri: "http://x".into(),
            message: "m".into(),
        };
        assert_eq!(err.code(), "E40007");
        assert_eq!(err.status_code(), 500);

        let err = TransportError {
            kind: TransportErrorKind::Unexpected,
            uri: "http://x".into(),
            message: "m".into(),
        };
        assert_eq!(err.code(), "E40008");
        assert_eq!(err.status_code(), 500);
    }
}
