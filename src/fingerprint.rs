//! Canonical content fingerprints.
//!
//! Object keys are sorted at every nesting level (arrays keep their order), the result is
//! serialized as compact JSON and hashed with SHA-256. Two values that differ only in key order
//! fingerprint identically. This is the only drift-detection primitive the planner uses.
//!
//! ```rust
//! use guildforge::fingerprint::fingerprint;
//! use serde_json::json;
//!
//! let a = fingerprint(&json!({"name": "Ops", "hoist": true}));
//! let b = fingerprint(&json!({"hoist": true, "name": "Ops"}));
//! assert_eq!(a, b);
//! assert_eq!(a.as_str().len(), 64);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Lowercase hex SHA-256 digest of a canonicalized value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` hex characters (whole digest when `n` exceeds its length).
    pub fn short(&self, n: usize) -> &str {
        &self.0[..n.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Rebuild `value` with every object's keys in sorted order.
///
/// `serde_json::Map` only sorts when the `preserve_order` feature is off, and that feature is
/// unified across the dependency graph, so ordering is made explicit here.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(obj.len());
            for key in keys {
                out.insert(key.clone(), canonicalize(&obj[key.as_str()]));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Fingerprint an already-built JSON value.
pub fn fingerprint(value: &Value) -> Fingerprint {
    // Serializing a `Value` cannot fail: every key is already a string.
    let canonical = canonicalize(value).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    Fingerprint(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Fingerprint any serializable value.
///
/// Fails only for values serde_json cannot represent (maps with non-string keys), which is a
/// programming error in the caller's type.
pub fn fingerprint_of<T: Serialize + ?Sized>(value: &T) -> Result<Fingerprint, serde_json::Error> {
    Ok(fingerprint(&serde_json::to_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn nested_key_order_does_not_matter() {
        let a = json!({
            "policyKey": "P1",
            "rules": [{"principal": {"type": "role", "roleKey": "R1"}, "effect": "allow"}],
        });
        let b = json!({
            "rules": [{"effect": "allow", "principal": {"roleKey": "R1", "type": "role"}}],
            "policyKey": "P1",
        });
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!({"perms": ["ViewChannel", "SendMessages"]});
        let b = json!({"perms": ["SendMessages", "ViewChannel"]});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn tracked_field_change_changes_digest() {
        let base = json!({"name": "Ops", "color": 0x3366ff, "hoist": null});
        let recolored = json!({"name": "Ops", "color": 0x3366fe, "hoist": null});
        let unset = json!({"name": "Ops", "color": null, "hoist": null});
        assert_ne!(fingerprint(&base), fingerprint(&recolored));
        assert_ne!(fingerprint(&base), fingerprint(&unset));
    }

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        let fp = fingerprint(&json!({}));
        // sha256("{}")
        assert_eq!(
            fp.as_str(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
        assert_eq!(fp.short(8), "44136fa3");
        assert_eq!(fp.short(100).len(), 64);
    }

    #[test]
    fn fingerprint_of_matches_value_path() {
        let mut map = HashMap::new();
        map.insert("b", 2);
        map.insert("a", 1);
        let via_serde = fingerprint_of(&map).unwrap();
        assert_eq!(via_serde, fingerprint(&json!({"a": 1, "b": 2})));
    }

    #[test]
    fn non_string_keys_are_rejected() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], 1);
        assert!(fingerprint_of(&map).is_err());
    }
}
