//! Records and their canonical keys.
//!
//! A record is a plain JSON object. Records are compared structurally, so two
//! records with the same nested content are equal regardless of how they were
//! built.

use crate::RecordKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A keyed document: field name to value.
pub type Record = Map<String, Value>;

/// How a local `set` combines new fields with an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Recursively merge nested objects (default)
    #[default]
    Deep,
    /// Overwrite top-level fields only
    Shallow,
    /// Replace the whole record
    None,
}

/// Render a single primary key value as a stable string.
///
/// Strings are used verbatim; every other value uses its compact JSON form.
pub fn scalar_key(value: &Value) -> Option<RecordKey> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Serialize an ordered tuple of primary key values.
pub fn compound_key(values: &[&Value]) -> Option<RecordKey> {
    if values.iter().any(|v| v.is_null()) {
        return None;
    }
    serde_json::to_string(values).ok()
}

/// Compute the canonical key of a record for the given primary key fields.
pub fn key_of(record: &Record, primary_keys: &[String]) -> Option<RecordKey> {
    match primary_keys {
        [single] => record.get(single).and_then(scalar_key),
        fields => {
            let values: Option<Vec<&Value>> = fields.iter().map(|f| record.get(f)).collect();
            compound_key(&values?)
        }
    }
}

/// Recover the primary key values encoded in a compound key.
pub fn decode_compound_key(key: &str) -> Option<Vec<Value>> {
    serde_json::from_str(key).ok()
}

/// Merge `changes` into `base`, field by field. `null` removes a field.
pub fn shallow_merge(base: &Record, changes: &Record) -> Record {
    let mut out = base.clone();
    for (field, value) in changes {
        if value.is_null() {
            out.remove(field);
        } else {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// Merge `changes` into `base`, recursing into nested objects. `null` removes
/// a field at any depth.
pub fn deep_merge(base: &Record, changes: &Record) -> Record {
    let mut out = base.clone();
    for (field, value) in changes {
        if value.is_null() {
            out.remove(field);
            continue;
        }
        if let (Some(Value::Object(existing)), Value::Object(nested)) = (out.get_mut(field), value)
        {
            *existing = deep_merge(existing, nested);
            continue;
        }
        out.insert(field.clone(), value.clone());
    }
    out
}

/// Apply `changes` to `base` according to `mode`.
pub fn merge(base: Option<&Record>, changes: &Record, mode: MergeMode) -> Record {
    match (base, mode) {
        (None, _) | (_, MergeMode::None) => changes
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        (Some(base), MergeMode::Shallow) => shallow_merge(base, changes),
        (Some(base), MergeMode::Deep) => deep_merge(base, changes),
    }
}

/// Convert a JSON value into a record, rejecting non-objects.
pub fn into_record(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    #[test]
    fn single_string_key_is_verbatim() {
        let r = rec(json!({"id": "abc", "v": 1}));
        assert_eq!(key_of(&r, &["id".into()]), Some("abc".to_string()));
    }

    #[test]
    fn single_numeric_key_is_json() {
        let r = rec(json!({"id": 42}));
        assert_eq!(key_of(&r, &["id".into()]), Some("42".to_string()));
    }

    #[test]
    fn missing_or_null_key() {
        let r = rec(json!({"id": null, "v": 1}));
        assert_eq!(key_of(&r, &["id".into()]), None);
        assert_eq!(key_of(&r, &["other".into()]), None);
    }

    #[test]
    fn compound_key_follows_field_order() {
        let pk = vec!["project_id".to_string(), "path".to_string()];
        let a = rec(json!({"path": "a.txt", "project_id": "p1"}));
        let b = rec(json!({"project_id": "p1", "path": "a.txt", "size": 3}));

        let key = key_of(&a, &pk).unwrap();
        assert_eq!(key, r#"["p1","a.txt"]"#);
        assert_eq!(key_of(&b, &pk).unwrap(), key);
        assert_eq!(
            decode_compound_key(&key).unwrap(),
            vec![json!("p1"), json!("a.txt")]
        );
    }

    #[test]
    fn compound_key_with_missing_part() {
        let pk = vec!["a".to_string(), "b".to_string()];
        assert_eq!(key_of(&rec(json!({"a": 1})), &pk), None);
    }

    #[test]
    fn deep_merge_recurses() {
        let base = rec(json!({"id": "x", "settings": {"theme": "dark", "font": 12}}));
        let changes = rec(json!({"settings": {"font": 14}}));
        let merged = merge(Some(&base), &changes, MergeMode::Deep);
        assert_eq!(
            Value::Object(merged),
            json!({"id": "x", "settings": {"theme": "dark", "font": 14}})
        );
    }

    #[test]
    fn shallow_merge_overwrites() {
        let base = rec(json!({"id": "x", "settings": {"theme": "dark", "font": 12}}));
        let changes = rec(json!({"settings": {"font": 14}}));
        let merged = merge(Some(&base), &changes, MergeMode::Shallow);
        assert_eq!(
            Value::Object(merged),
            json!({"id": "x", "settings": {"font": 14}})
        );
    }

    #[test]
    fn replace_drops_old_fields() {
        let base = rec(json!({"id": "x", "a": 1, "b": 2}));
        let changes = rec(json!({"id": "x", "b": 3}));
        let merged = merge(Some(&base), &changes, MergeMode::None);
        assert_eq!(Value::Object(merged), json!({"id": "x", "b": 3}));
    }

    #[test]
    fn null_removes_field() {
        let base = rec(json!({"id": "x", "a": 1, "nested": {"k": 1, "j": 2}}));
        let changes = rec(json!({"a": null, "nested": {"k": null}}));
        let merged = merge(Some(&base), &changes, MergeMode::Deep);
        assert_eq!(Value::Object(merged), json!({"id": "x", "nested": {"j": 2}}));
    }

    #[test]
    fn structural_equality() {
        let a = rec(json!({"id": "x", "tags": ["a", "b"], "meta": {"z": 1, "y": 2}}));
        let b = rec(json!({"meta": {"y": 2, "z": 1}, "tags": ["a", "b"], "id": "x"}));
        assert_eq!(a, b);
    }
}
