//! Deterministic fingerprinting of structured values.
//!
//! Every cache key in kiln is the sha256 hex digest of the canonical JSON
//! encoding of some value. Canonical JSON sorts map keys lexicographically
//! and never escapes forward slashes, so equal values produce equal keys on
//! every host.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//!
//! let key = kiln_keys::generate_key(&json!({"kind": "manual", "config": {}}));
//! assert!(kiln_keys::is_key(&key));
//! ```

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of a cache key: a sha256 hex digest.
pub const KEY_LENGTH: usize = 64;

/// Check whether the passed string *could be* a cache key: the length of a
/// sha256 hex digest, fully lower case, no non-hex characters.
pub fn is_key(key: &str) -> bool {
    key.len() == KEY_LENGTH && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Generate a sha256 hex digest from the given value.
///
/// The value can be a simple scalar or a recursive map/list structure;
/// anything representable as JSON.
pub fn generate_key(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    let mut hasher = Sha256::new();
    hasher.update(out.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash raw bytes into a 64-hex digest string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Canonical JSON: object keys sorted lexicographically, no whitespace,
/// no forward-slash escaping, minimal string escapes.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
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
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn is_key_accepts_sha256_hex() {
        let key = generate_key(&json!("anything"));
        assert!(is_key(&key));
    }

    #[test]
    fn is_key_rejects_wrong_length() {
        assert!(!is_key("abc123"));
        assert!(!is_key(&"a".repeat(63)));
        assert!(!is_key(&"a".repeat(65)));
    }

    #[test]
    fn is_key_rejects_upper_case_and_non_hex() {
        assert!(!is_key(&"A".repeat(64)));
        assert!(!is_key(&"g".repeat(64)));
    }

    #[test]
    fn map_key_order_does_not_matter() {
        let a = json!({"alpha": 1, "beta": [1, 2, 3], "gamma": {"x": true}});
        let b = json!({"gamma": {"x": true}, "beta": [1, 2, 3], "alpha": 1});
        assert_eq!(generate_key(&a), generate_key(&b));
    }

    #[test]
    fn list_order_matters() {
        assert_ne!(
            generate_key(&json!([1, 2, 3])),
            generate_key(&json!([3, 2, 1]))
        );
    }

    #[test]
    fn forward_slashes_are_not_escaped() {
        let mut out = String::new();
        write_canonical(&json!("usr/bin/foo"), &mut out);
        assert_eq!(out, "\"usr/bin/foo\"");
    }

    #[test]
    fn control_characters_are_escaped() {
        let mut out = String::new();
        write_canonical(&json!("a\nb\u{0001}c"), &mut out);
        assert_eq!(out, "\"a\\nb\\u0001c\"");
    }

    #[test]
    fn scalars_and_null_roundtrip_to_distinct_keys() {
        let keys = [
            generate_key(&json!(null)),
            generate_key(&json!(false)),
            generate_key(&json!(0)),
            generate_key(&json!("")),
            generate_key(&json!([])),
            generate_key(&json!({})),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn canonical_form_is_sorted_and_compact() {
        let mut out = String::new();
        write_canonical(&json!({"b": 1, "a": ["x", {"z": null}]}), &mut out);
        insta::assert_snapshot!(out, @r#"{"a":["x",{"z":null}],"b":1}"#);
    }

    #[test]
    fn hash_bytes_matches_known_vector() {
        // sha256 of the empty string.
        assert_eq!(
            hash_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    proptest! {
        #[test]
        fn generated_keys_are_stable_and_hex(s in ".*", n in any::<i64>()) {
            let value = json!({"s": s, "n": n});
            let k1 = generate_key(&value);
            let k2 = generate_key(&value);
            prop_assert_eq!(&k1, &k2);
            prop_assert!(is_key(&k1));
        }

        #[test]
        fn distinct_scalars_produce_distinct_keys(a in any::<u32>(), b in any::<u32>()) {
            prop_assume!(a != b);
            prop_assert_ne!(generate_key(&json!(a)), generate_key(&json!(b)));
        }
    }
}
