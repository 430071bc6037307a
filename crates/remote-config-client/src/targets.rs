//! Typed view of the signed targets metadata.
//!
//! The `targets` blob of a poll response decodes to
//! `{"signed": {...}, "signatures": [{"keyid": .., "sig": ..}]}`. The typed
//! [`SignedTargets`] drives change detection, while the untyped `signed` tree
//! is retained verbatim because the signature covers its canonical encoding,
//! which re-serialising the typed model cannot be trusted to reproduce.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// Signed manifest of every configuration file currently valid for the client.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SignedTargets {
    /// Monotonic targets version.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDescriptor>,
    #[serde(default)]
    pub custom: Option<SignedTargetsCustom>,
}

/// Top-level custom section of `targets.signed`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SignedTargetsCustom {
    /// Backend state echoed back on the next request.
    #[serde(default)]
    pub opaque_backend_state: Option<String>,
}

/// The server's declaration of one file's identity.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TargetDescriptor {
    #[serde(default)]
    pub length: u64,
    /// Hex digests keyed by algorithm (e.g. `sha256`).
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub custom: Option<TargetCustom>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TargetCustom {
    /// Per-file version.
    #[serde(default)]
    pub v: u64,
}

impl TargetDescriptor {
    pub fn version(&self) -> u64 {
        self.custom.as_ref().map(|custom| custom.v).unwrap_or(0)
    }

    /// Whether this descriptor identifies the same content as `length`/`hashes`.
    pub fn same_content(&self, length: u64, hashes: &BTreeMap<String, String>) -> bool {
        self.length == length && &self.hashes == hashes
    }
}

/// Detached signature entry of the targets document.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TargetsSignature {
    pub keyid: String,
    /// Hex-encoded signature bytes.
    pub sig: String,
}

#[derive(Debug, Deserialize)]
struct RawTargetsDocument {
    signed: Value,
    #[serde(default)]
    signatures: Option<Vec<TargetsSignature>>,
}

/// Parsed targets document keeping both the typed and untyped `signed` trees.
#[derive(Debug, Clone)]
pub struct TargetsDocument {
    signed: SignedTargets,
    untyped_signed: Value,
    signatures: Vec<TargetsSignature>,
}

impl TargetsDocument {
    /// Parses the decoded (not base64) targets blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let raw: RawTargetsDocument = serde_json::from_slice(bytes)?;
        let signed = SignedTargets::deserialize(&raw.signed)?;
        Ok(Self {
            signed,
            untyped_signed: raw.signed,
            signatures: raw.signatures.unwrap_or_default(),
        })
    }

    pub fn signed(&self) -> &SignedTargets {
        &self.signed
    }

    /// The `signed` tree exactly as received.
    pub fn untyped_signed(&self) -> &Value {
        &self.untyped_signed
    }

    pub fn signatures(&self) -> &[TargetsSignature] {
        &self.signatures
    }

    pub fn version(&self) -> u64 {
        self.signed.version
    }

    pub fn get_target(&self, path: &str) -> Option<&TargetDescriptor> {
        self.signed.targets.get(path)
    }

    /// Returns the hex signature published under `key_id`, if any.
    pub fn signature_for(&self, key_id: &str) -> Option<&str> {
        self.signatures
            .iter()
            .find(|signature| signature.keyid == key_id)
            .map(|signature| signature.sig.as_str())
    }

    pub fn opaque_backend_state(&self) -> Option<&str> {
        self.signed
            .custom
            .as_ref()
            .and_then(|custom| custom.opaque_backend_state.as_deref())
    }
}
