//! Stable hashes over semantic payloads.
//!
//! Content hashes identify a message's payload across cells, enabling
//! context-set membership tracking (`context_hashes`) without comparing
//! bodies.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex digest length kept for content hashes.
const CONTENT_HASH_LEN: usize = 32;

/// Stable hash of a JSON payload's semantic content.
///
/// Strings hash their raw text; everything else hashes its canonical
/// (sorted-key) JSON rendering, so two payloads that serialize identically
/// share a hash.
#[must_use]
pub fn content_hash(value: &Value) -> String {
    let canonical = match value {
        Value::String(s) => s.clone(),
        other => canonical_json(other),
    };
    hex_digest(canonical.as_bytes(), CONTENT_HASH_LEN)
}

/// Truncated hex SHA-256.
#[must_use]
pub fn hex_digest(bytes: &[u8], len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(len);
    for byte in digest.iter() {
        out.push_str(&format!("{byte:02x}"));
        if out.len() >= len {
            break;
        }
    }
    out.truncate(len);
    out
}

/// Render JSON with object keys sorted at every level.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
