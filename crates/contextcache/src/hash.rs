// crates/contextcache/src/hash.rs
// Content hashing for dedup (spec 4.3).

use sha2::{Digest, Sha256};

/// Canonicalize content before hashing: UTF-8 (caller already guarantees
/// this by typing `content: &str`), trim trailing whitespace of the whole
/// blob, preserve internal whitespace. No length truncation.
pub fn canonicalize(content: &str) -> &str {
    content.trim_end()
}

/// `content_hash = hex(sha256(content_bytes))` after canonicalization.
pub fn content_hash(content: &str) -> String {
    let canonical = canonicalize(content);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")
}
