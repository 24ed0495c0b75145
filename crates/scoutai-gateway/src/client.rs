// Outbound HTTP relay for contexts that cannot reach the network directly.
//
// The gateway performs exactly one attempt per call. Non-2xx responses and
// transport failures both come back as `HttpError`; retry policy, if any,
// belongs to the caller.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use scoutai_core::protocol::ApiRequestPayload;
use scoutai_core::ScoutError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Normalized failure of an outbound call.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct HttpError {
    /// HTTP status, or `None` if no response was received.
    pub status: Option<u16>,
    pub message: String,
}

impl HttpError {
    fn transport(message: impl Into<String>) -> Self {
        HttpError {
            status: None,
            message: message.into(),
        }
    }
}

impl From<HttpError> for ScoutError {
    fn from(e: HttpError) -> Self {
        ScoutError::Http {
            status: e.status,
            message: e.message,
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway seam
// ---------------------------------------------------------------------------

/// Performs `request(url, method, headers, body) -> json | HttpError`.
#[async_trait]
pub trait ApiGateway: Send + Sync {
    async fn request(&self, request: &ApiRequestPayload) -> Result<Value, HttpError>;
}

// ---------------------------------------------------------------------------
// HttpGateway
// ---------------------------------------------------------------------------

/// `reqwest`-backed gateway.
pub struct HttpGateway {
    http: reqwest::Client,
}

impl HttpGateway {
    /// Create a gateway whose calls give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::transport(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ApiGateway for HttpGateway {
    async fn request(&self, request: &ApiRequestPayload) -> Result<Value, HttpError> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| HttpError::transport(format!("Invalid HTTP method: {}", request.method)))?;
        let headers = build_headers(request)?;

        debug!(method = %method, url = %request.url, "API request");

        let mut builder = self.http.request(method, &request.url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.to_string());
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = %request.url, "API request failed: {e}");
            HttpError {
                status: e.status().map(|s| s.as_u16()),
                message: format!("Network error: {e}"),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = format!(
                "API request failed: {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string();
            warn!(url = %request.url, status = status.as_u16(), "{message}");
            return Err(HttpError {
                status: Some(status.as_u16()),
                message,
            });
        }

        let text = response.text().await.map_err(|e| HttpError {
            status: Some(status.as_u16()),
            message: format!("Failed to read response body: {e}"),
        })?;
        parse_body(&text).map_err(|message| HttpError {
            status: Some(status.as_u16()),
            message,
        })
    }
}

/// `Content-Type: application/json` unless the caller overrides it, plus the
/// caller's headers.
fn build_headers(request: &ApiRequestPayload) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpError::transport(format!("Invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| HttpError::transport(format!("Invalid value for header {name}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Decode a success body. An empty body decodes as `null`.
pub(crate) fn parse_body(text: &str) -> Result<Value, String> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| format!("Invalid JSON response: {e}"))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve exactly one canned HTTP response on a local port. Returns the
    /// base URL and a receiver yielding the raw request text.
    async fn one_shot_server(status_line: &str, body: &str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            // Read headers, then as much body as Content-Length announces.
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if buf.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });

        (format!("http://{addr}"), rx)
    }

    fn gateway() -> HttpGateway {
        HttpGateway::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn success_returns_decoded_json() {
        let (base, _req) = one_shot_server("200 OK", r#"{"recommendations":[]}"#).await;
        let request = ApiRequestPayload {
            url: format!("{base}/recommendations"),
            method: "GET".into(),
            headers: BTreeMap::new(),
            body: None,
        };
        let value = gateway().request(&request).await.unwrap();
        assert_eq!(value, json!({"recommendations": []}));
    }

    #[tokio::test]
    async fn non_2xx_normalizes_to_http_error() {
        let (base, _req) = one_shot_server("503 Service Unavailable", r#"{"detail":"down"}"#).await;
        let request = ApiRequestPayload::post_json(format!("{base}/recommendations"), json!({}));
        let err = gateway().request(&request).await.unwrap_err();
        assert_eq!(err.status, Some(503));
        assert_eq!(err.message, "API request failed: 503 Service Unavailable");
    }

    #[tokio::test]
    async fn post_sends_json_body_and_default_content_type() {
        let (base, req) = one_shot_server("200 OK", "{}").await;
        let mut request =
            ApiRequestPayload::post_json(format!("{base}/recommendations"), json!({"current_pick": 5}));
        request.headers.insert("X-Client".into(), "scoutai".into());

        gateway().request(&request).await.unwrap();

        let raw = req.await.unwrap();
        let lower = raw.to_ascii_lowercase();
        assert!(raw.starts_with("POST /recommendations "));
        assert!(lower.contains("content-type: application/json"));
        assert!(lower.contains("x-client: scoutai"));
        assert!(raw.ends_with(r#"{"current_pick":5}"#));
    }

    #[tokio::test]
    async fn connection_refused_has_no_status() {
        // Bind then drop to get a port nobody is listening on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let request = ApiRequestPayload::post_json(format!("http://127.0.0.1:{port}/x"), json!({}));
        let err = gateway().request(&request).await.unwrap_err();
        assert_eq!(err.status, None);
        assert!(err.message.starts_with("Network error"));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let request = ApiRequestPayload {
            url: "http://127.0.0.1:1/".into(),
            method: "BAD METHOD".into(),
            headers: BTreeMap::new(),
            body: None,
        };
        let err = gateway().request(&request).await.unwrap_err();
        assert_eq!(err.status, None);
        assert!(err.message.contains("Invalid HTTP method"));
    }

    #[tokio::test]
    async fn invalid_json_body_keeps_status() {
        let (base, _req) = one_shot_server("200 OK", "<html>").await;
        let request = ApiRequestPayload::post_json(format!("{base}/x"), json!({}));
        let err = gateway().request(&request).await.unwrap_err();
        assert_eq!(err.status, Some(200));
        assert!(err.message.starts_with("Invalid JSON response"));
    }

    #[test]
    fn empty_body_is_null() {
        assert_eq!(parse_body("  "), Ok(Value::Null));
    }

    #[test]
    fn http_error_converts_to_scout_error() {
        let err: ScoutError = HttpError {
            status: Some(500),
            message: "boom".into(),
        }
        .into();
        assert_eq!(
            err,
            ScoutError::Http {
                status: Some(500),
                message: "boom".into()
            }
        );
    }
}
