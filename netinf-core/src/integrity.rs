//! Content hashing: identifiers for downloaded bytes and opt-in verification of retrieved bytes.

use sha2::{Digest, Sha256};

use crate::identifier::ContentIdentifier;

/// Canonical name of the only algorithm the node can compute.
pub const SHA_256: &str = "sha-256";

/// True for the spellings of SHA-256 seen in `ni` names.
pub fn is_supported(algorithm: &str) -> bool {
    matches!(
        algorithm.to_ascii_lowercase().as_str(),
        "sha-256" | "sha256"
    )
}

/// Hash a payload. Returns the lowercase hex SHA-256 digest.
pub fn hash_content(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Check a payload against the identifier it was retrieved under.
pub fn verify_content(
    payload: &[u8],
    expected: &ContentIdentifier,
) -> Result<bool, UnsupportedAlgorithm> {
    if !is_supported(expected.hash_algorithm()) {
        return Err(UnsupportedAlgorithm(expected.hash_algorithm().to_string()));
    }
    Ok(hash_content(payload).eq_ignore_ascii_case(expected.hash_value()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported hash algorithm: {0}")]
pub struct UnsupportedAlgorithm(pub String);
