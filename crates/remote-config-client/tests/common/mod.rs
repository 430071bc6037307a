//! Fixtures shared by the integration tests: a fixed signing key, a builder
//! for signed poll responses and a scripted transport.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use remote_config_client::{
    canonicalize, ConfigurationPoller, PollRequest, PollerConfig, StaticEndpoint, Transport,
    TransportError, TransportResponse,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub const KEY_ID: &str = "2f1c5d4b6e0a9f8d7c6b5a4938271605f4e3d2c1b0a99887766554433221100f";

pub fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

/// Poller configuration trusting [`signing_key`].
pub fn config() -> PollerConfig {
    PollerConfig {
        targets_key_id: KEY_ID.to_string(),
        targets_key: hex::encode(signing_key().verifying_key().to_bytes()),
        ..PollerConfig::default()
    }
}

pub fn poller(transport: &Arc<ScriptedTransport>) -> ConfigurationPoller {
    poller_with(config(), transport)
}

pub fn poller_with(config: PollerConfig, transport: &Arc<ScriptedTransport>) -> ConfigurationPoller {
    ConfigurationPoller::new(
        config,
        Arc::clone(transport) as Arc<dyn Transport>,
        Arc::new(StaticEndpoint::new("http://localhost:8126/v0.7/config")),
    )
    .expect("poller must build")
}

fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Builds signed poll response bodies.
#[derive(Debug, Clone, Default)]
pub struct Response {
    version: u64,
    targets: BTreeMap<String, Value>,
    client_configs: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
    tampered: bool,
}

impl Response {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Declares, requests and delivers `path`.
    pub fn config(mut self, path: &str, content: &[u8], version: u64) -> Self {
        self = self.cached(path, content, version);
        self.files.push((path.to_string(), content.to_vec()));
        self
    }

    /// Declares and requests `path` without delivering its content.
    pub fn cached(mut self, path: &str, content: &[u8], version: u64) -> Self {
        self.targets.insert(
            path.to_string(),
            json!({
                "length": content.len(),
                "hashes": {"sha256": sha256_hex(content)},
                "custom": {"v": version}
            }),
        );
        self.client_configs.push(path.to_string());
        self
    }

    /// Alters the signed metadata after it was signed.
    pub fn tampered(mut self) -> Self {
        self.tampered = true;
        self
    }

    pub fn body(&self) -> Vec<u8> {
        let mut signed = json!({
            "_type": "targets",
            "custom": {"opaque_backend_state": "eyJzdGF0ZSI6MX0="},
            "expires": "2030-01-01T00:00:00Z",
            "spec_version": "1.0.0",
            "targets": self.targets,
            "version": self.version,
        });
        let canonical = canonicalize(&signed).expect("fixture must canonicalize");
        let signature = signing_key().sign(&canonical);
        if self.tampered {
            signed["expires"] = json!("2030-01-01T00:00:01Z");
        }

        let targets = json!({
            "signed": signed,
            "signatures": [{"keyid": KEY_ID, "sig": hex::encode(signature.to_bytes())}],
        });
        let target_files: Vec<Value> = self
            .files
            .iter()
            .map(|(path, raw)| json!({"path": path, "raw": STANDARD.encode(raw)}))
            .collect();
        serde_json::to_vec(&json!({
            "targets": STANDARD.encode(serde_json::to_vec(&targets).expect("serialise targets")),
            "target_files": target_files,
            "client_configs": self.client_configs,
        }))
        .expect("serialise response")
    }

    pub fn ok(&self) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(200, self.body()))
    }
}

/// Replays queued responses (204 once exhausted) and records request bodies.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    pub fn push(&self, response: Result<TransportResponse, TransportError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn status(&self, status: u16) {
        self.push(Ok(TransportResponse::new(status, Vec::new())));
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Value {
        self.requests().pop().expect("no request was sent")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: PollRequest) -> Result<TransportResponse, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::from_slice(&request.body).expect("request body is JSON"));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TransportResponse::new(204, Vec::new())))
    }
}
