//! Utility functions for the probe engine
//!
//! Hashing helpers used for query identity and configuration change
//! detection, plus small string/time helpers shared by both crates.

use blake3::Hasher;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Calculate the BLAKE3 fingerprint of a canonical, serializable value.
///
/// The value is serialized to JSON first; struct fields serialize in
/// declaration order and map types used in canonical specs are ordered,
/// so equal values always produce equal fingerprints.
pub fn fingerprint<T: Serialize>(value: &T) -> crate::Result<String> {
    let canonical = serde_json::to_string(value)?;
    Ok(calculate_string_checksum(&canonical))
}

/// Calculate BLAKE3 checksum of concatenated configuration files
///
/// Takes probe.toml and tests.toml contents, concatenates them,
/// and returns a BLAKE3 hash as a hex-encoded string.
pub fn calculate_checksum(probe_toml: &str, tests_toml: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(probe_toml.as_bytes());
    hasher.update(tests_toml.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Calculate BLAKE3 checksum of a string
///
/// Returns the hash as a hex-encoded string (64 characters).
pub fn calculate_string_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get current Unix timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Truncate string to maximum length with ellipsis
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let mut cut = max_len - 3;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &s[..cut])
    }
}
