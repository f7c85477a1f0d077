//! Signing primitives for Clearway envelopes.
//!
//! Implements:
//! - Canonical JSON serialization (JCS-style: sorted keys, no whitespace)
//! - Ed25519 signatures over canonical request payloads
//! - Address derivation from verifying keys

use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{ClearwayError, ClearwayResult};

/// Serialize a JSON value in canonical form: object keys sorted
/// lexicographically, no insignificant whitespace. Two frames with the same
/// content always canonicalize to the same bytes, so signatures survive
/// re-serialization on the way to the relay.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Null => out.push_str("null"),
        serde_json::Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                out.push_str(&n.to_string());
            }
        }
        serde_json::Value::String(s) => {
            // serde_json's string escaping is stable across versions
            out.push_str(&serde_json::Value::String(s.clone()).to_string());
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Sign raw payload bytes with an Ed25519 key, returning base64.
pub fn sign_payload(payload: &[u8], signing_key: &SigningKey) -> String {
    let signature: Signature = signing_key.sign(payload);
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Verify a base64 signature over raw payload bytes.
pub fn verify_payload(
    payload: &[u8],
    signature_b64: &str,
    verifying_key: &VerifyingKey,
) -> ClearwayResult<()> {
    let signature_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| ClearwayError::Crypto(format!("invalid base64 signature: {}", e)))?;

    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| ClearwayError::Crypto(format!("invalid signature format: {}", e)))?;

    verifying_key
        .verify(payload, &signature)
        .map_err(|_| ClearwayError::Crypto("signature verification failed".to_string()))
}

/// Derive a `0x`-prefixed address from a verifying key: the first 20 bytes
/// of the SHA-256 of the public key, hex-encoded.
pub fn derive_address(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    format!("0x{}", hex_encode(&digest[..20]))
}

/// Hex-encode bytes (lowercase, no prefix).
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string (with or without `0x` prefix).
pub fn hex_decode(s: &str) -> ClearwayResult<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(ClearwayError::Crypto("odd-length hex string".to_string()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| ClearwayError::Crypto(format!("invalid hex: {}", e)))
        })
        .collect()
}
