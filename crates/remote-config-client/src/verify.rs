//! Integrity checks run on every response before anything is applied.
//!
//! Two checks are performed: the Ed25519 signature published for the pinned
//! key id must match the canonical encoding of `targets.signed`, and every
//! file delivered in `target_files` must be declared in the signed targets.

use ed25519_dalek::{Signature, VerifyingKey, SIGNATURE_LENGTH};
use thiserror::Error;

use crate::canonical::canonicalize;
use crate::envelope::ResponseEnvelope;

/// Reasons a response is rejected as a whole.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("{0}")]
    SignatureInvalid(String),
    #[error("Path {0} is in target_files, but not in targets.signed")]
    UndeclaredFile(String),
}

/// Raised when the configured public key material cannot be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("bad public key '{key}': {reason}")]
pub struct PublicKeyError {
    key: String,
    reason: String,
}

/// Verifies responses against a pinned key.
#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    enabled: bool,
    key_id: String,
    key: VerifyingKey,
}

impl IntegrityVerifier {
    pub fn new(enabled: bool, key_id: impl Into<String>, key: VerifyingKey) -> Self {
        Self {
            enabled,
            key_id: key_id.into(),
            key,
        }
    }

    /// Builds a verifier from a hex-encoded 32-byte Ed25519 public key.
    pub fn from_hex(
        enabled: bool,
        key_id: impl Into<String>,
        key_hex: &str,
    ) -> Result<Self, PublicKeyError> {
        let bad_key = |reason: String| PublicKeyError {
            key: key_hex.to_string(),
            reason,
        };
        let bytes = hex::decode(key_hex.trim()).map_err(|err| bad_key(err.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| bad_key(format!("expected 32 bytes, got {}", bytes.len())))?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|err| bad_key(err.to_string()))?;
        Ok(Self::new(enabled, key_id, key))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Checks `envelope`; a disabled verifier accepts everything.
    pub fn verify(&self, envelope: &ResponseEnvelope) -> Result<(), IntegrityError> {
        if !self.enabled {
            return Ok(());
        }
        self.verify_signature(envelope)?;
        verify_presence(envelope)
    }

    fn verify_signature(&self, envelope: &ResponseEnvelope) -> Result<(), IntegrityError> {
        let targets = envelope.targets();
        let (signature, canonical) = targets
            .signature_for(&self.key_id)
            .ok_or_else(|| format!("no signature published for key id {}", self.key_id))
            .and_then(decode_signature)
            .and_then(|signature| {
                canonicalize(targets.untyped_signed())
                    .map(|canonical| (signature, canonical))
                    .map_err(|err| err.to_string())
            })
            .map_err(|reason| {
                IntegrityError::SignatureInvalid(format!(
                    "Error reading signature or canonicalizing targets.signed: {reason}"
                ))
            })?;

        self.key.verify_strict(&canonical, &signature).map_err(|_| {
            IntegrityError::SignatureInvalid(format!(
                "Signature verification failed for targets.signed. Key id: {}",
                self.key_id
            ))
        })
    }
}

fn decode_signature(sig_hex: &str) -> Result<Signature, String> {
    let bytes = hex::decode(sig_hex).map_err(|err| err.to_string())?;
    let bytes: [u8; SIGNATURE_LENGTH] = bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| {
            format!(
                "expected {SIGNATURE_LENGTH} signature bytes, got {}",
                bytes.len()
            )
        })?;
    Ok(Signature::from_bytes(&bytes))
}

fn verify_presence(envelope: &ResponseEnvelope) -> Result<(), IntegrityError> {
    match envelope
        .target_file_paths()
        .iter()
        .find(|path| envelope.get_target(path).is_none())
    {
        Some(path) => Err(IntegrityError::UndeclaredFile(path.clone())),
        None => Ok(()),
    }
}
