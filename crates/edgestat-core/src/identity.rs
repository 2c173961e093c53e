//! Deterministic event identity and privacy-preserving actor hashing
//!
//! Both functions are pure: the same input always yields the same output,
//! which is what makes queue redelivery safe downstream.

use sha2::{Digest, Sha256};

/// Number of hex characters of the digest kept in an idempotent ID
const ID_DIGEST_HEX_LEN: usize = 8;

/// Number of hex characters kept in an actor hash
const ACTOR_HASH_HEX_LEN: usize = 16;

/// Derive the idempotent ID of a request.
///
/// Format: `"{timestamp_ms}-{first 8 hex chars of sha256(inputs)}"`.
/// The four inputs are concatenated in order with no separator.
pub fn derive_idempotent_id(
    timestamp_ms: i64,
    actor_address: &str,
    path: &str,
    correlation_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp_ms.to_string().as_bytes());
    hasher.update(actor_address.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(correlation_id.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}-{}", timestamp_ms, &digest[..ID_DIGEST_HEX_LEN])
}

/// One-way hash of an actor (client IP) address, truncated to 16 hex chars.
pub fn hash_actor(address: &str) -> String {
    let digest = hex::encode(Sha256::digest(address.as_bytes()));
    digest[..ACTOR_HASH_HEX_LEN].to_string()
}
