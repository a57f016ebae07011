//! Cryptographic utilities for key hashing and payment callback signatures.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Computes SHA-256 hash of the input and returns it as a hex string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Computes the lowercase hex HMAC-SHA256 of `payload` under `secret`.
///
/// This is the signature format payment providers send in the
/// `X-Callback-Signature` header.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a hex encoded HMAC-SHA256 signature over `payload`.
///
/// The comparison is constant time. Signatures that are not valid hex, or
/// that are empty, are rejected.
pub fn verify_hmac_sha256_hex(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    let signature = match hex::decode(signature_hex.trim()) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        _ => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Compares a presented secret against a stored SHA-256 hex digest.
pub fn matches_sha256_digest(presented: &str, expected_hex: &str) -> bool {
    let presented_digest = sha256_hex(presented);
    // Equal-length hex strings; fold to avoid early exit on the first mismatch.
    presented_digest.len() == expected_hex.len()
        && presented_digest
            .bytes()
            .zip(expected_hex.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
