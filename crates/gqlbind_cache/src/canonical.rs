//! Deterministic serialization and structural equality of data trees.

use serde_json::Value;
use std::fmt::Write;

/// Serializes `value` as JSON with object keys sorted at every level.
///
/// Two variable bags holding the same keys and values in a different
/// insertion order produce the same string.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
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
        Value::String(s) => write_string(s, out),
        other => {
            let _ = write!(out, "{}", other);
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display of a JSON string value is its escaped, quoted form.
    let _ = write!(out, "{}", Value::String(s.to_owned()));
}

/// Deep equality over data trees, comparing object fields by name.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            left.len() == right.len()
                && left
                    .iter()
                    .all(|(key, value)| right.get(key).is_some_and(|other| deep_equal(value, other)))
        }
        (Value::Array(left), Value::Array(right)) => {
            left.len() == right.len() && left.iter().zip(right).all(|(x, y)| deep_equal(x, y))
        }
        _ => a == b,
    }
}

/// Returns true for data that carries nothing: absent, `null` or `{}`.
pub fn is_empty_data(data: Option<&Value>) -> bool {
    match data {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"z": true, "y": null}], "c": "x"}});
        let b = json!({"a": {"c": "x", "d": [1, {"y": null, "z": true}]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":"x","d":[1,{"y":null,"z":true}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let v = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&v), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn test_canonical_json_keeps_array_order() {
        assert_ne!(canonical_json(&json!([1, 2])), canonical_json(&json!([2, 1])));
    }

    #[test]
    fn test_deep_equal() {
        assert!(deep_equal(
            &json!({"todos": [{"id": "1", "title": "a"}]}),
            &json!({"todos": [{"title": "a", "id": "1"}]})
        ));
        assert!(!deep_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
        assert!(!deep_equal(&json!([1, 2]), &json!([1, 2, 3])));
        assert!(!deep_equal(&json!({"a": null}), &json!({"b": null})));
    }

    #[test]
    fn test_is_empty_data() {
        assert!(is_empty_data(None));
        assert!(is_empty_data(Some(&json!({}))));
        assert!(is_empty_data(Some(&Value::Null)));
        assert!(!is_empty_data(Some(&json!({"todos": []}))));
    }
}
