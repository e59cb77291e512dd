//! Small shared helpers that don't belong to any single component.

use serde_json::Value;

/// Deterministic hash of a JSON value, used as the idempotency key for
/// ledger emissions: the same `fields` always hash to the same digest
/// regardless of which attempt produced it.
pub fn deterministic_hash(value: &Value) -> String {
    let canonical = canonicalize(value);
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Serializes a JSON value with object keys sorted, so semantically
/// identical payloads hash identically regardless of field order.
fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut parts = Vec::with_capacity(keys.len());
            for key in keys {
                let v = &map[key];
                parts.push(format!("{key:?}:{}", canonicalize(v)));
            }
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_is_order_independent() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(deterministic_hash(&a), deterministic_hash(&b));
    }

    #[test]
    fn hash_differs_for_different_content() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(deterministic_hash(&a), deterministic_hash(&b));
    }
}
