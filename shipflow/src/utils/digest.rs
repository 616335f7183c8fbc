//! Content digests for artifact manifests and rendered templates.

use sha2::{Digest, Sha256};

/// Returns the lowercase hex SHA-256 digest of `content`.
#[must_use]
pub fn sha256_hex(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    hex::encode(hasher.finalize())
}

/// Returns the first 12 hex characters of a digest, for log lines.
#[must_use]
pub fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
