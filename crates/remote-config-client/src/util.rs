//! Small hashing and encoding helpers.

use sha2::{Digest, Sha256};

/// Computes the lowercase hexadecimal SHA-256 digest of `bytes`.
pub(crate) fn compute_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Encodes a capability bitmask as its minimal big-endian byte form (at least
/// one byte).
pub(crate) fn capabilities_to_bytes(capabilities: u64) -> Vec<u8> {
    let bytes = capabilities.to_be_bytes();
    let first = bytes
        .iter()
        .position(|byte| *byte != 0)
        .unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}
