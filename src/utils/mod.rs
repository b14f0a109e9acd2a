//! Utility functions and helpers.

pub mod http;
pub mod url;

use sha2::{Digest, Sha256};

/// Derive a storage key from an identity: `{prefix}_{first 16 hex chars of sha256}`.
pub fn hash_key(prefix: &str, identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    let hex = hex::encode(digest);
    format!("{prefix}_{}", &hex[..16])
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
