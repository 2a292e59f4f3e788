use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

/// Rebuilds `value` with every object's keys in sorted order. Array order is
/// significant and kept as is.
pub fn canonicalize_json_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => serde_json::Value::Array(
            values
                .iter()
                .map(canonicalize_json_value)
                .collect::<Vec<_>>(),
        ),
        serde_json::Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize_json_value(v));
            }
            serde_json::Value::Object(out)
        }
        scalar => scalar.clone(),
    }
}

pub fn canonical_json_string(value: &serde_json::Value) -> String {
    let canonical = canonicalize_json_value(value);
    serde_json::to_string(&canonical).unwrap_or_else(|_| "null".to_string())
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json_string(value).as_bytes())
}

/// Fingerprint of an ordered parameter tuple. Two tuples share a fingerprint
/// only when every position holds an equal value.
pub fn params_fingerprint(params: &[serde_json::Value]) -> String {
    hash_canonical_json(&serde_json::Value::Array(params.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_object_keys_recursively() {
        let value = json!({
            "b": 1,
            "a": {
                "d": 4,
                "c": 3
            }
        });

        assert_eq!(
            canonical_json_string(&value),
            r#"{"a":{"c":3,"d":4},"b":1}"#
        );
    }

    #[test]
    fn canonical_json_preserves_array_order() {
        let value = json!({"a":[{"b":2},{"a":1}]});
        assert_eq!(canonical_json_string(&value), r#"{"a":[{"b":2},{"a":1}]}"#);
    }

    #[test]
    fn sha256_hex_is_lowercase() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn params_fingerprint_requires_exact_tuple_equality() {
        let a = params_fingerprint(&[json!(true), json!(183)]);
        let b = params_fingerprint(&[json!(true), json!(183)]);
        let c = params_fingerprint(&[json!(true), json!(90)]);
        let swapped = params_fingerprint(&[json!(183), json!(true)]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, swapped);
    }
}
