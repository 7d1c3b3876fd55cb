// Canonical JSON: object keys sorted, null members dropped, compact separators

use serde::Serialize;
use serde_json::Value;

/// Canonical text of any serializable value
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_json(&value))
}

/// Canonical text of a parsed JSON value.
///
/// Keys are ordered by their UTF-8 bytes independent of how the map was built, so the
/// output does not depend on serde_json's `preserve_order` feature.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Copy of `value` with null object members removed at every depth
pub fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize_value(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        other => other.clone(),
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (index, (key, member)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                // Display of a string Value is its quoted, escaped JSON form
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(member, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_and_nulls_dropped() {
        let value = json!({"target": "all", "id": "1", "signature": null, "nested": {"b": 1, "a": null}});
        assert_eq!(
            canonical_json(&value),
            r#"{"id":"1","nested":{"b":1},"target":"all"}"#
        );
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [true, null, "q"], "z": "\u00e9"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"z": "é", "y": [true, null, "q"], "x": 1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"x":1,"y":[true,null,"q"],"z":"é"}"#);
    }

    #[test]
    fn test_strings_are_escaped() {
        let value = json!({"path": "C:\\Temp\\\"x\"", "line": "a\nb"});
        assert_eq!(
            canonical_json(&value),
            r#"{"line":"a\nb","path":"C:\\Temp\\\"x\""}"#
        );
    }

    #[test]
    fn test_canonicalize_value_matches_canonical_text() {
        let value = json!({"b": {"d": null, "c": 2}, "a": [1, {"z": null}]});
        let normalized = canonicalize_value(&value);
        assert_eq!(normalized, json!({"a": [1, {}], "b": {"c": 2}}));
        assert_eq!(canonical_json(&normalized), canonical_json(&value));
    }
}
