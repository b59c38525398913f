//! Canonical payload signing for provider webhooks and redirect callbacks.
//!
//! Providers may re-order JSON fields or re-encode whitespace before signing, so a
//! stable canonical form is computed before hashing. Verification compares digests in
//! constant time to resist timing attacks on the shared secret.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("secret key is invalid for HMAC-SHA256")]
    InvalidKeyLength,
}

/// Renders a single JSON value the way the canonical form expects:
/// strings verbatim, numbers/bools/null by their literal text, everything
/// else (arrays, objects) as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Concatenates `key=value` pairs from `map`, keys sorted lexicographically,
/// entries joined by `&`. Missing/absent keys are simply not present in `map`
/// and are therefore omitted, never serialised as `key=`.
pub fn canonicalise(map: &serde_json::Map<String, Value>) -> String {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| format!("{k}={}", render_value(&map[k])))
        .collect::<Vec<_>>()
        .join("&")
}

/// Computes the lowercase hex HMAC-SHA256 digest over the canonical form of `map`.
pub fn hmac_hex(map: &serde_json::Map<String, Value>, secret: &[u8]) -> Result<String, SignatureError> {
    let canonical = canonicalise(map);
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidKeyLength)?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recomputes the HMAC over `map` and compares it against `provided_hex` in constant
/// time. Returns `false` (never an error) on malformed hex or length mismatch, since a
/// verification failure and a malformed signature are the same outcome to the caller.
pub fn verify(map: &serde_json::Map<String, Value>, secret: &[u8], provided_hex: &str) -> bool {
    let Ok(expected_hex) = hmac_hex(map, secret) else {
        return false;
    };
    let expected = expected_hex.as_bytes();
    let provided = provided_hex.as_bytes();
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}
