//! Content hashing for change detection.
//!
//! A record's `data_hash` is the MD5 of its declared hash fields, in declared
//! order, joined with `|`. Missing, null, empty and NaN values all hash as the
//! empty string; lists and objects hash as their JSON text with object keys
//! sorted, so the digest does not depend on map iteration order.

use md5::{Digest, Md5};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{IngestError, IngestResult};

/// Hash a serializable record over `fields`.
pub fn record_hash<T: Serialize>(record: &T, fields: &[&str]) -> IngestResult<String> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(hash_fields(&map, fields)),
        Ok(_) => Err(IngestError::Contract(
            "hashed record must serialize to an object".to_string(),
        )),
        Err(e) => Err(IngestError::Contract(format!("unserializable record: {}", e))),
    }
}

/// Hash an already-serialized record over `fields`.
pub fn hash_fields(record: &Map<String, Value>, fields: &[&str]) -> String {
    let joined = fields
        .iter()
        .map(|f| field_text(record.get(*f)))
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Md5::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

fn field_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => {
            if s == "NaN" {
                String::new()
            } else {
                s.clone()
            }
        }
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.is_nan() => String::new(),
            _ => n.to_string(),
        },
        Some(Value::Bool(b)) => b.to_string(),
        Some(v) => stable_json(v),
    }
}

/// JSON text with object keys sorted at every level.
pub fn stable_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), stable_json(&map[k])))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{}}}", body)
        }
        Value::Array(items) => {
            let body = items.iter().map(stable_json).collect::<Vec<_>>().join(",");
            format!("[{}]", body)
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn none_and_empty_hash_identically() {
        let fields = ["company_number", "locality"];
        let a = hash_fields(&map(json!({"company_number": "01234567", "locality": null})), &fields);
        let b = hash_fields(&map(json!({"company_number": "01234567", "locality": ""})), &fields);
        let c = hash_fields(&map(json!({"company_number": "01234567"})), &fields);
        let d = hash_fields(&map(json!({"company_number": "01234567", "locality": "NaN"})), &fields);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn declared_order_not_source_order() {
        let rec = map(json!({"b": "2", "a": "1"}));
        assert_eq!(hash_fields(&rec, &["a", "b"]), {
            let mut h = Md5::new();
            h.update(b"1|2");
            hex::encode(h.finalize())
        });
        assert_ne!(hash_fields(&rec, &["a", "b"]), hash_fields(&rec, &["b", "a"]));
    }

    #[test]
    fn fields_outside_the_list_do_not_matter() {
        let fields = ["company_number", "company_name"];
        let a = hash_fields(&map(json!({"company_number": "1", "company_name": "A", "x": 1})), &fields);
        let b = hash_fields(&map(json!({"company_number": "1", "company_name": "A", "x": 2})), &fields);
        assert_eq!(a, b);
    }

    #[test]
    fn nested_values_hash_independently_of_key_order() {
        let one: Value = serde_json::from_str(r#"{"z": 1, "a": {"y": [1, 2], "b": null}}"#).unwrap();
        let two: Value = serde_json::from_str(r#"{"a": {"b": null, "y": [1, 2]}, "z": 1}"#).unwrap();
        assert_eq!(stable_json(&one), stable_json(&two));
        assert_eq!(stable_json(&one), r#"{"a":{"b":null,"y":[1,2]},"z":1}"#);
    }

    #[test]
    fn structs_hash_through_serde() {
        #[derive(Serialize)]
        struct Row {
            company_number: String,
            sic_codes: Vec<String>,
        }
        let row = Row {
            company_number: "01234567".into(),
            sic_codes: vec!["62020".into()],
        };
        let h = record_hash(&row, &["company_number", "sic_codes"]).unwrap();
        let mut expected = Md5::new();
        expected.update(br#"01234567|["62020"]"#);
        assert_eq!(h, hex::encode(expected.finalize()));
        assert!(record_hash(&5, &["a"]).unwrap_err().is_contract_violation());
    }
}
