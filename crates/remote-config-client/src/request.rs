//! Construction of poll requests.
//!
//! The [`RequestFactory`] is created once the endpoint is known and holds
//! everything that stays fixed for the lifetime of the poller: the URL, the
//! client id and the tracer metadata. Each cycle it serialises the mutable
//! parts (subscriptions, client state, cache, capabilities) into a
//! [`PollRequest`].

use base64::Engine;
use remote_config_wire::{Client, ClientGetConfigsRequest, ClientTracer, TargetFileMeta};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use thiserror::Error;

use crate::client_state::NextClientState;
use crate::config::PollerConfig;
use crate::util::capabilities_to_bytes;

const CONTAINER_ID_HEADER: &str = "datadog-container-id";
const ENTITY_ID_HEADER: &str = "datadog-entity-id";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid remote configuration url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid value for header {name}")]
    InvalidHeader { name: &'static str },
    #[error("failed to serialise poll request: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A fully built request, ready for a [`crate::transport::Transport`].
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl PollRequest {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Resolves the endpoint to poll. `None` means it is not known yet and the
/// tick is skipped without error.
pub trait EndpointProvider: Send + Sync {
    fn endpoint(&self) -> Option<String>;
}

/// Endpoint fixed at construction time.
#[derive(Debug, Clone)]
pub struct StaticEndpoint(Option<String>);

impl StaticEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self(Some(url.into()))
    }

    pub fn unknown() -> Self {
        Self(None)
    }
}

impl EndpointProvider for StaticEndpoint {
    fn endpoint(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RequestFactory {
    url: String,
    client_id: String,
    tracer: ClientTracer,
    headers: HeaderMap,
}

impl RequestFactory {
    pub fn new(config: &PollerConfig, url: &str) -> Result<Self, RequestError> {
        let parsed = Url::parse(url).map_err(|err| RequestError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RequestError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        insert_optional(&mut headers, CONTAINER_ID_HEADER, config.container_id.as_deref())?;
        insert_optional(&mut headers, ENTITY_ID_HEADER, config.entity_id.as_deref())?;

        Ok(Self {
            url: parsed.to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            tracer: ClientTracer {
                runtime_id: config.runtime_id.clone(),
                language: config.language.clone(),
                tracer_version: config.tracer_version.clone(),
                service: config.service.clone(),
                env: config.env.clone(),
                app_version: config.app_version.clone(),
                tags: config.tags.clone(),
                extra_services: Vec::new(),
            },
            headers,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Builds the request body model.
    pub fn payload(
        &self,
        products: Vec<String>,
        state: &NextClientState,
        cached_target_files: Vec<TargetFileMeta>,
        capabilities: u64,
    ) -> ClientGetConfigsRequest {
        ClientGetConfigsRequest {
            client: Client {
                state: state.to_wire(),
                id: self.client_id.clone(),
                products,
                is_tracer: true,
                client_tracer: self.tracer.clone(),
                capabilities: capabilities_to_bytes(capabilities),
            },
            cached_target_files,
        }
    }

    pub fn build(
        &self,
        products: Vec<String>,
        state: &NextClientState,
        cached_target_files: Vec<TargetFileMeta>,
        capabilities: u64,
    ) -> Result<PollRequest, RequestError> {
        let payload = self.payload(products, state, cached_target_files, capabilities);
        Ok(PollRequest {
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: serde_json::to_vec(&payload)?,
        })
    }
}

fn insert_optional(
    headers: &mut HeaderMap,
    name: &'static str,
    value: Option<&str>,
) -> Result<(), RequestError> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(());
    };
    let value = HeaderValue::from_str(value).map_err(|_| RequestError::InvalidHeader { name })?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Base64 form of the capability bitmask, as it appears on the wire.
pub fn encode_capabilities(capabilities: u64) -> String {
    base64::engine::general_purpose::STANDARD.encode(capabilities_to_bytes(capabilities))
}
