use serde_json::Value;

use crate::error::EncodingError;
use crate::types::{DELETED_FIELD, get_path, is_deleted};

/// Type tag constants. Their order defines the cross-type collation:
/// null < false < true < numbers < strings.
pub const TAG_NULL: char = '1';
pub const TAG_FALSE: char = '2';
pub const TAG_TRUE: char = '3';
pub const TAG_NUMBER: char = '4';
pub const TAG_STRING: char = '5';

/// Sorts after every encoded index string. Usable as an open upper bound.
pub const INDEX_MAX: &str = "\u{10FFFF}";

/// Append the encoding of one field value (type tag followed by payload).
pub fn encode_value_into(
    field: &str,
    value: &Value,
    out: &mut String,
) -> Result<(), EncodingError> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => {
            let n = n.as_f64().ok_or_else(|| EncodingError::UnsupportedValue {
                field: field.to_string(),
            })?;
            out.push(TAG_NUMBER);
            out.push_str(&super::number::encode_number(n)?);
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            super::string::encode_string_into(s, out);
        }
        Value::Array(_) | Value::Object(_) => {
            return Err(EncodingError::UnsupportedValue {
                field: field.to_string(),
            });
        }
    }
    Ok(())
}

/// Encode the given fields of a document, in order, into one sortable string.
///
/// Missing fields encode as null, except `_deleted` which encodes as `false`.
pub fn encode_fields(fields: &[String], doc: &Value) -> Result<String, EncodingError> {
    let mut out = String::new();
    for field in fields {
        if field == DELETED_FIELD {
            let value = Value::Bool(is_deleted(doc));
            encode_value_into(field, &value, &mut out)?;
        } else {
            let value = get_path(doc, field).unwrap_or(&Value::Null);
            encode_value_into(field, value, &mut out)?;
        }
    }
    Ok(out)
}

/// Encode a known prefix of an index's field values.
///
/// Every full index string whose leading fields equal `values` sorts strictly
/// after the returned string, so it works as an exclusive lower bound or as an
/// exclusive upper bound that stops right before those entries.
pub fn encode_prefix(fields: &[String], values: &[Value]) -> Result<String, EncodingError> {
    let mut out = String::new();
    for (field, value) in fields.iter().zip(values) {
        encode_value_into(field, value, &mut out)?;
    }
    Ok(out)
}

/// Upper bound covering every index string that starts with `values`.
pub fn encode_prefix_upper(fields: &[String], values: &[Value]) -> Result<String, EncodingError> {
    let mut out = encode_prefix(fields, values)?;
    out.push_str(INDEX_MAX);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cross_type_collation() {
        let values = [
            json!(null),
            json!(false),
            json!(true),
            json!(-5),
            json!(3.5),
            json!(""),
            json!("a"),
        ];
        let encoded: Vec<String> = values
            .iter()
            .map(|v| {
                let mut s = String::new();
                encode_value_into("f", v, &mut s).unwrap();
                s
            })
            .collect();
        for i in 0..encoded.len() - 1 {
            assert!(encoded[i] < encoded[i + 1], "{} < {}", values[i], values[i + 1]);
        }
    }

    #[test]
    fn test_tuple_ordering() {
        let idx = fields(&["age", "name"]);
        let a = encode_fields(&idx, &json!({"age": 9, "name": "zed"})).unwrap();
        let b = encode_fields(&idx, &json!({"age": 10, "name": "amy"})).unwrap();
        let c = encode_fields(&idx, &json!({"age": 10, "name": "bob"})).unwrap();
        assert!(a < b, "age 9 sorts before age 10 regardless of name");
        assert!(b < c);
    }

    #[test]
    fn test_string_field_does_not_bleed_into_next() {
        let idx = fields(&["name", "age"]);
        let short = encode_fields(&idx, &json!({"name": "ab", "age": 99})).unwrap();
        let long = encode_fields(&idx, &json!({"name": "abc", "age": 1})).unwrap();
        assert!(short < long);
    }

    #[test]
    fn test_missing_deleted_is_false() {
        let idx = fields(&["_deleted"]);
        let implicit = encode_fields(&idx, &json!({"id": "a"})).unwrap();
        let explicit = encode_fields(&idx, &json!({"id": "a", "_deleted": false})).unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn test_nested_path() {
        let idx = fields(&["_meta.lwt"]);
        let early = encode_fields(&idx, &json!({"_meta": {"lwt": 100}})).unwrap();
        let late = encode_fields(&idx, &json!({"_meta": {"lwt": 200}})).unwrap();
        assert!(early < late);
    }

    #[test]
    fn test_unsupported_values() {
        let idx = fields(&["tags"]);
        assert!(matches!(
            encode_fields(&idx, &json!({"tags": ["a"]})),
            Err(EncodingError::UnsupportedValue { .. })
        ));
    }

    #[test]
    fn test_prefix_bounds() {
        let idx = fields(&["_deleted", "_meta.lwt", "id"]);
        let doc = json!({"id": "x", "_deleted": true, "_meta": {"lwt": 150}});
        let full = encode_fields(&idx, &doc).unwrap();

        let lower = encode_prefix(&idx, &[json!(true), json!(100)]).unwrap();
        let at = encode_prefix(&idx, &[json!(true), json!(150)]).unwrap();
        let upper = encode_prefix_upper(&idx, &[json!(true), json!(150)]).unwrap();

        assert!(lower < full);
        assert!(at < full, "prefix bound stops right before matching entries");
        assert!(full < upper);
        assert!(full.as_str() < INDEX_MAX);
    }
}
