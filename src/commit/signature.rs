//! Canonical JSON signing for immutable records.
//!
//! Canonical form: keys sorted lexicographically, no whitespace, string
//! escaping per serde_json, UTC ISO-8601 timestamps supplied by callers.
//! Two independent implementations of this writer must agree bit-for-bit,
//! so the serialization is explicit rather than delegated to Map ordering.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("key serialization"));
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
    }
}

/// SHA-256 over the canonical form, hex-encoded.
pub fn sign(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute and compare; divergence is an integrity failure.
pub fn verify(value: &Value, stored_signature: &str) -> bool {
    sign(value) == stored_signature
}
