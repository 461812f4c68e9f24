//! Blob checksums.
//!
//! A package blob is identified by the lowercase hex SHA-256 of its raw bytes.
//! Registries publish this value next to each version; the fetcher refuses any
//! blob whose digest differs.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compares a computed digest with a published one, ignoring hex case and
/// surrounding whitespace.
pub fn checksum_matches(actual: &str, expected: &str) -> bool {
    actual.trim().eq_ignore_ascii_case(expected.trim())
}
