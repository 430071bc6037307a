//! HTTP transport used to send poll requests.
//!
//! The poller only needs a status code and a body back, so the seam is the
//! small [`Transport`] trait; [`HttpTransport`] is the reqwest implementation.
//! Request timeouts belong to the transport.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder};
use thiserror::Error;

use crate::request::PollRequest;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("{0}")]
    Other(String),
}

/// Status code and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: PollRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
///
/// Bodies are read chunk by chunk and reading stops one byte past
/// `max_body_size`, so an oversized response is detected without buffering
/// all of it.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    max_body_size: usize,
}

impl HttpTransport {
    pub fn new(max_body_size: usize) -> Result<Self, TransportError> {
        Self::with_timeout(max_body_size, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(max_body_size: usize, timeout: Duration) -> Result<Self, TransportError> {
        let client = create_reqwest_client_builder()?.timeout(timeout).build()?;
        Ok(Self {
            client,
            max_body_size,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: PollRequest) -> Result<TransportResponse, TransportError> {
        tracing::debug!(
            url = %request.url,
            headers = ?redact_headers(&request.headers),
            body_len = request.body.len(),
            body = %body_preview(&request.body),
            "remote-config: sending poll request"
        );

        let mut response = self
            .client
            .post(&request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;
        let status = response.status();

        let limit = self.max_body_size.saturating_add(1);
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let remaining = limit - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(
            status = status.as_u16(),
            body_len = body.len(),
            "remote-config: received poll response"
        );
        Ok(TransportResponse {
            status: status.as_u16(),
            body,
        })
    }
}

/// Creates a reqwest client builder using rustls.
#[cfg(not(feature = "fips"))]
pub fn create_reqwest_client_builder() -> Result<ClientBuilder, TransportError> {
    Ok(Client::builder().use_rustls_tls())
}

/// Creates a reqwest client builder restricted to the process-wide FIPS
/// crypto provider and the native root certificates.
#[cfg(feature = "fips")]
pub fn create_reqwest_client_builder() -> Result<ClientBuilder, TransportError> {
    let tls = |msg: &str| TransportError::TlsConfig(msg.to_string());
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| tls("no crypto provider configured"))?;
    if !provider.fips() {
        return Err(tls("crypto provider is not FIPS-compliant"));
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    let mut valid_count = 0;
    for cert in native_certs.certs {
        match root_cert_store.add(cert) {
            Ok(()) => valid_count += 1,
            Err(err) => tracing::debug!("remote-config: skipping unparsable certificate: {err:?}"),
        }
    }
    if valid_count == 0 {
        return Err(tls("no valid certificates found in native root store"));
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|_| tls("failed to set protocol versions"))?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    if !config.fips() {
        return Err(tls("the final TLS configuration is not FIPS-compliant"));
    }
    Ok(Client::builder().use_preconfigured_tls(config))
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 3] = ["dd-api-key", "dd-application-key", "authorization"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}

pub(crate) fn body_preview(body: &[u8]) -> String {
    truncate_preview_text(String::from_utf8_lossy(body))
}

fn truncate_preview_text(text: Cow<'_, str>) -> String {
    const MAX_CHARS: usize = 1024;
    let mut chars = text.chars();
    let mut preview = String::new();
    for _ in 0..MAX_CHARS {
        match chars.next() {
            Some(ch) => preview.push(ch),
            None => return preview,
        }
    }
    if chars.next().is_some() {
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_state::NextClientState;
    use crate::config::PollerConfig;
    use crate::request::RequestFactory;
    use httptest::matchers::{all_of, contains, json_decoded, key, not, request};
    use httptest::responders::status_code;
    use httptest::{Expectation, Server};
    use reqwest::header::HeaderValue;
    use serde_json::Value;

    fn poll_request(server: &Server) -> PollRequest {
        let config = PollerConfig {
            container_id: Some("c0ffee".to_string()),
            ..PollerConfig::default()
        };
        RequestFactory::new(&config, &server.url_str("/v0.7/config"))
            .unwrap()
            .build(vec!["APM_TRACING".to_string()], &NextClientState::default(), vec![], 1)
            .unwrap()
    }

    #[tokio::test]
    async fn posts_json_and_returns_status_and_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v0.7/config"),
                request::headers(contains(("content-type", "application/json"))),
                request::headers(contains(("datadog-container-id", "c0ffee"))),
                request::headers(not(contains(key("datadog-entity-id")))),
                request::body(json_decoded(|body: &Value| {
                    body["client"]["products"][0] == "APM_TRACING"
                })),
            ])
            .respond_with(status_code(200).body("{\"client_configs\":[]}")),
        );

        let transport = HttpTransport::new(1024).unwrap();
        let response = transport.execute(poll_request(&server)).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.body, b"{\"client_configs\":[]}");
    }

    #[tokio::test]
    async fn non_success_statuses_are_returned_not_raised() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v0.7/config"))
                .respond_with(status_code(404)),
        );

        let transport = HttpTransport::new(1024).unwrap();
        let response = transport.execute(poll_request(&server)).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn oversized_bodies_are_cut_one_byte_past_the_limit() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v0.7/config"))
                .respond_with(status_code(200).body(vec![b'x'; 4096])),
        );

        let transport = HttpTransport::new(100).unwrap();
        let response = transport.execute(poll_request(&server)).await.unwrap();
        assert_eq!(response.body.len(), 101);
    }

    #[tokio::test]
    async fn connection_failures_are_transport_errors() {
        let server = Server::run();
        let request = poll_request(&server);
        drop(server);

        let transport = HttpTransport::with_timeout(1024, Duration::from_secs(2)).unwrap();
        assert!(matches!(
            transport.execute(request).await,
            Err(TransportError::Http(_))
        ));
    }

    #[test]
    fn sensitive_headers_are_redacted() {
        let mut headers = HeaderMap::new();
        headers.insert("DD-API-KEY", HeaderValue::from_static("secret"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let redacted = redact_headers(&headers);
        assert!(redacted.contains(&("dd-api-key".to_string(), "<redacted>".to_string())));
        assert!(redacted.contains(&("content-type".to_string(), "application/json".to_string())));
    }

    #[test]
    fn previews_are_truncated() {
        let long = "a".repeat(2000);
        let preview = body_preview(long.as_bytes());
        assert_eq!(preview.chars().count(), 1025);
        assert!(preview.ends_with('…'));
        assert_eq!(body_preview(b"{}"), "{}");
    }
}
