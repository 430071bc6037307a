//! Shared fixtures for unit tests: a fixed signing key and a builder producing
//! signed poll responses.

#![cfg(test)]

use std::collections::BTreeMap;

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Map, Value};

use crate::canonical::canonicalize;
use crate::envelope::ResponseEnvelope;
use crate::util::compute_sha256;
use crate::verify::IntegrityVerifier;

pub(crate) const TEST_KEY_ID: &str = "5c4ece41241a1bb513f6e3e5df74ab7d5183dfffbd71bfd43127920d880569fd";
pub(crate) const MAX_PAYLOAD: usize = 1 << 20;

pub(crate) fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

pub(crate) fn verifier(enabled: bool) -> IntegrityVerifier {
    IntegrityVerifier::new(enabled, TEST_KEY_ID, signing_key().verifying_key())
}

/// Builds poll response bodies signed with [`signing_key`].
#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseBuilder {
    version: u64,
    targets: BTreeMap<String, Value>,
    client_configs: Vec<String>,
    files: Vec<(String, Vec<u8>)>,
    opaque_backend_state: Option<String>,
    tamper: bool,
    corrupt_signature: bool,
}

impl ResponseBuilder {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            version,
            ..Default::default()
        }
    }

    /// Declares, delivers and requests `path` with `content`.
    pub(crate) fn target(self, path: &str, content: &[u8], version: u64) -> Self {
        self.declared(path, content, version)
            .client_config(path)
            .extra_file(path, content)
    }

    /// Declares and requests `path` without delivering its content, as the
    /// agent does for files the client already caches.
    pub(crate) fn cached_target(self, path: &str, content: &[u8], version: u64) -> Self {
        self.declared(path, content, version).client_config(path)
    }

    /// Adds `path` to the signed targets only.
    pub(crate) fn declared(mut self, path: &str, content: &[u8], version: u64) -> Self {
        self.targets.insert(
            path.to_string(),
            json!({
                "length": content.len(),
                "hashes": {"sha256": compute_sha256(content)},
                "custom": {"v": version}
            }),
        );
        self
    }

    pub(crate) fn client_config(mut self, path: &str) -> Self {
        self.client_configs.push(path.to_string());
        self
    }

    pub(crate) fn extra_file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.push((path.to_string(), content.to_vec()));
        self
    }

    pub(crate) fn opaque_backend_state(mut self, state: &str) -> Self {
        self.opaque_backend_state = Some(state.to_string());
        self
    }

    /// Changes one character of the signed metadata after signing.
    pub(crate) fn tampered(mut self) -> Self {
        self.tamper = true;
        self
    }

    pub(crate) fn corrupt_signature(mut self) -> Self {
        self.corrupt_signature = true;
        self
    }

    pub(crate) fn body(&self) -> Vec<u8> {
        let mut custom = Map::new();
        if let Some(state) = &self.opaque_backend_state {
            custom.insert("opaque_backend_state".into(), Value::String(state.clone()));
        }
        let mut signed = json!({
            "_type": "targets",
            "custom": custom,
            "expires": "2030-01-01T00:00:00Z",
            "spec_version": "1.0.0",
            "targets": self.targets,
            "version": self.version,
        });

        let canonical = canonicalize(&signed).expect("fixture must canonicalize");
        let mut signature = signing_key().sign(&canonical).to_bytes();
        if self.corrupt_signature {
            signature[0] ^= 0x01;
        }
        if self.tamper {
            signed["expires"] = Value::String("2030-01-01T00:00:01Z".into());
        }

        let targets = json!({
            "signed": signed,
            "signatures": [{"keyid": TEST_KEY_ID, "sig": hex::encode(signature)}]
        });
        let target_files: Vec<Value> = self
            .files
            .iter()
            .map(|(path, raw)| {
                json!({"path": path, "raw": base64::engine::general_purpose::STANDARD.encode(raw)})
            })
            .collect();
        serde_json::to_vec(&json!({
            "targets": base64::engine::general_purpose::STANDARD
                .encode(serde_json::to_vec(&targets).expect("fixture must serialise")),
            "client_configs": self.client_configs,
            "target_files": target_files,
        }))
        .expect("fixture must serialise")
    }

    pub(crate) fn envelope(&self) -> ResponseEnvelope {
        ResponseEnvelope::parse(&self.body(), MAX_PAYLOAD)
            .expect("fixture must parse")
            .expect("fixture carries targets")
    }
}
