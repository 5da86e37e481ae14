use sha2::{Digest, Sha256};

/// Derive the idempotency key for a publish request.
///
/// Each field is length-prefixed before hashing, so no caption content can
/// make two different triples hash the same input.
pub fn derive_key(artifact_ref: &str, caption: &str, publish_at: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [artifact_ref, caption, publish_at] {
        hasher.update(field.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
