//! Webhook signature verification
//!
//! Signatures are HMAC-SHA256 over the canonical JSON form of the payload:
//! object keys sorted, `,` and `:` separators, no insignificant whitespace.
//! Accepted header forms are `sha256=<hex>` and bare hex.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Canonical JSON encoding used for signing and alert-id derivation
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Hex HMAC-SHA256 of `message` under `key`
pub fn hmac_sha256_hex(key: &[u8], message: &[u8]) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| format!("HMAC error: {}", e))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Signature a source should send for `payload` under `secret`
pub fn compute_signature(secret: &str, payload: &serde_json::Value) -> Result<String, String> {
    hmac_sha256_hex(secret.as_bytes(), canonical_json(payload).as_bytes())
}

/// Strip an optional `sha256=` prefix and decode the hex digest
fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let trimmed = header.trim();
    let hex_part = match trimmed.split_once('=') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("sha256") => rest,
        Some(_) => return None,
        None => trimmed,
    };
    hex::decode(hex_part.trim()).ok()
}

/// Constant-time check of `header` against the payload's canonical form
pub fn verify_signature(secret: &str, payload: &serde_json::Value, header: &str) -> bool {
    let Some(expected) = parse_signature_header(header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical_json(payload).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Fallback alert id: first 32 hex chars of SHA-256 over the canonical payload
pub fn derive_alert_id(payload: &serde_json::Value) -> String {
    let digest = Sha256::digest(canonical_json(payload).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(32);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": "s"}], "c": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"c":null,"z":[1,{"x":"s","y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let value = json!({"msg": "a \"quoted\" line\n"});
        assert_eq!(canonical_json(&value), r#"{"msg":"a \"quoted\" line\n"}"#);
    }

    #[test]
    fn test_key_order_does_not_change_signature() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"ticker":"BTCUSDT","action":"buy","quantity":0.01}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{ "quantity": 0.01, "action": "buy", "ticker": "BTCUSDT" }"#)
                .unwrap();
        assert_eq!(
            compute_signature("s", &a).unwrap(),
            compute_signature("s", &b).unwrap()
        );
    }

    #[test]
    fn test_verify_accepts_prefixed_and_bare_hex() {
        let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});
        let sig = compute_signature("s", &payload).unwrap();

        assert!(verify_signature("s", &payload, &sig));
        assert!(verify_signature("s", &payload, &format!("sha256={}", sig)));
        assert!(verify_signature("s", &payload, &format!("SHA256={}", sig.to_uppercase())));
    }

    #[test]
    fn test_verify_rejects_tampering_and_garbage() {
        let payload = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 0.01});
        let sig = compute_signature("s", &payload).unwrap();

        let tampered = json!({"ticker": "BTCUSDT", "action": "buy", "quantity": 1.0});
        assert!(!verify_signature("s", &tampered, &sig));
        assert!(!verify_signature("other", &payload, &sig));
        assert!(!verify_signature("s", &payload, "not-hex"));
        assert!(!verify_signature("s", &payload, &format!("md5={}", sig)));
        assert!(!verify_signature("s", &payload, ""));
    }

    #[test]
    fn test_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            hmac_sha256_hex(b"key", b"The quick brown fox jumps over the lazy dog").unwrap(),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_derived_alert_id_is_stable() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        let id = derive_alert_id(&a);
        assert_eq!(id.len(), 32);
        assert_eq!(id, derive_alert_id(&b));
        assert_ne!(id, derive_alert_id(&json!({"x": 2, "y": 2})));
    }
}
