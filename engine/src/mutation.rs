//! Planning of local mutations.
//!
//! [`plan_set`] validates a `set` request against the query descriptor and
//! computes the record that should end up in local state. It does not touch
//! the store, so the caller decides when to commit the result.

use crate::record::merge;
use crate::store::DualState;
use crate::{error::Result, Error, MergeMode, Record, RecordKey, TableQuery};
use serde_json::Value;

/// A validated local change, ready to be written to local state.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSet {
    pub key: RecordKey,
    pub record: Record,
}

/// Validate `changes` and compute the next local value for the target record.
///
/// Returns `Ok(None)` if the change would leave the record as it is.
pub fn plan_set(
    query: &TableQuery,
    state: &DualState,
    changes: &Record,
    mode: MergeMode,
) -> Result<Option<PlannedSet>> {
    let schema = query.schema();
    for (field, value) in changes {
        if !query.is_settable(field) {
            return Err(Error::FieldNotSettable {
                table: query.table().to_string(),
                field: field.clone(),
            });
        }
        if let Some(def) = schema.field(field) {
            def.validate(value)?;
        }
    }

    let mut changes = changes.clone();
    let key = resolve_key(query, state, &mut changes)?;
    let current = state.get_local(&key);

    if current.is_none() {
        if let Some(missing) = query
            .required()
            .iter()
            .find(|f| changes.get(*f).map_or(true, Value::is_null))
        {
            return Err(Error::MissingRequiredField {
                field: missing.clone(),
                key,
            });
        }
    }

    let mut next = merge(current, &changes, mode);
    // a replacement or a partial update must still carry the primary key
    for (field, value) in query.pk_values(&key, current.or(Some(&changes))) {
        next.entry(field).or_insert(value);
    }

    if current == Some(&next) {
        return Ok(None);
    }
    Ok(Some(PlannedSet { key, record: next }))
}

fn resolve_key(query: &TableQuery, state: &DualState, changes: &mut Record) -> Result<RecordKey> {
    if let Some(key) = query.key_of(changes) {
        return Ok(key);
    }

    if let Some(compute) = query.schema().computed_key {
        if let Some(values) = compute(changes) {
            for (field, value) in query.primary_keys().iter().zip(values) {
                changes.insert(field.clone(), value);
            }
            if let Some(key) = query.key_of(changes) {
                return Ok(key);
            }
        }
    }

    if !query.has_compound_key() {
        if let Some(key) = state.local().keys().next() {
            return Ok(key.clone());
        }
    }

    Err(Error::MissingPrimaryKey(query.primary_keys().join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::into_record;
    use crate::{FieldDef, FieldType, Schema, TableSchema};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn rec(value: Value) -> Record {
        into_record(value).unwrap()
    }

    fn schema() -> Schema {
        Schema::new()
            .with_table(
                TableSchema::new("accounts", ["account_id"])
                    .with_field(FieldDef::new("account_id", FieldType::String))
                    .with_field(FieldDef::new("name", FieldType::String))
                    .with_field(FieldDef::new("settings", FieldType::Json))
                    .with_field(FieldDef::new("created", FieldType::Timestamp))
                    .settable(["name", "settings"])
                    .required(["account_id", "name"]),
            )
            .with_table(
                TableSchema::new("cursors", ["project_id", "path"])
                    .with_field(FieldDef::new("pos", FieldType::Int))
                    .settable(["project_id", "path", "pos"]),
            )
            .with_table(
                TableSchema::new("hashes", ["hash"])
                    .with_field(FieldDef::new("blob", FieldType::String))
                    .settable(["hash", "blob"])
                    .computed_key(|r| {
                        let blob = r.get("blob")?.as_str()?;
                        Some(vec![json!(format!("h{}", blob.len()))])
                    }),
            )
    }

    fn state_with(query: &TableQuery, rows: Vec<Value>) -> DualState {
        let mut state = DualState::new();
        let mut map = BTreeMap::new();
        for row in rows {
            let row = rec(row);
            map.insert(query.key_of(&row).unwrap(), row);
        }
        state.adopt(map);
        state
    }

    fn accounts() -> TableQuery {
        TableQuery::parse(&json!("accounts"), &schema()).unwrap()
    }

    #[test]
    fn create_record() {
        let q = accounts();
        let state = state_with(&q, vec![]);
        let planned = plan_set(
            &q,
            &state,
            &rec(json!({"account_id": "x", "name": "Ann"})),
            MergeMode::Deep,
        )
        .unwrap()
        .unwrap();

        assert_eq!(planned.key, "x");
        assert_eq!(Value::Object(planned.record), json!({"account_id": "x", "name": "Ann"}));
    }

    #[test]
    fn rejects_unsettable_field() {
        let q = accounts();
        let state = state_with(&q, vec![]);
        let result = plan_set(
            &q,
            &state,
            &rec(json!({"account_id": "x", "created": 5})),
            MergeMode::Deep,
        );
        assert!(matches!(result, Err(Error::FieldNotSettable { field, .. }) if field == "created"));
    }

    #[test]
    fn rejects_wrong_type() {
        let q = accounts();
        let state = state_with(&q, vec![]);
        let result = plan_set(
            &q,
            &state,
            &rec(json!({"account_id": "x", "name": 12})),
            MergeMode::Deep,
        );
        assert!(matches!(result, Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn new_record_needs_required_fields() {
        let q = accounts();
        let state = state_with(&q, vec![]);
        let result = plan_set(&q, &state, &rec(json!({"account_id": "x"})), MergeMode::Deep);
        assert!(matches!(
            result,
            Err(Error::MissingRequiredField { field, key }) if field == "name" && key == "x"
        ));
    }

    #[test]
    fn single_key_shorthand_updates_existing_record() {
        let q = accounts();
        let state = state_with(&q, vec![json!({"account_id": "me", "name": "Ann"})]);
        let planned = plan_set(&q, &state, &rec(json!({"name": "Bea"})), MergeMode::Deep)
            .unwrap()
            .unwrap();
        assert_eq!(planned.key, "me");
        assert_eq!(planned.record["name"], "Bea");
        assert_eq!(planned.record["account_id"], "me");
    }

    #[test]
    fn missing_key_without_records_fails() {
        let q = accounts();
        let state = state_with(&q, vec![]);
        let result = plan_set(&q, &state, &rec(json!({"name": "Bea"})), MergeMode::Deep);
        assert!(matches!(result, Err(Error::MissingPrimaryKey(_))));
    }

    #[test]
    fn compound_key_requires_all_parts() {
        let q = TableQuery::parse(&json!("cursors"), &schema()).unwrap();
        let state = state_with(&q, vec![json!({"project_id": "p", "path": "a", "pos": 1})]);
        let result = plan_set(&q, &state, &rec(json!({"pos": 3})), MergeMode::Deep);
        assert!(matches!(result, Err(Error::MissingPrimaryKey(_))));
    }

    #[test]
    fn computed_key_is_used() {
        let q = TableQuery::parse(&json!("hashes"), &schema()).unwrap();
        let state = state_with(&q, vec![]);
        let planned = plan_set(&q, &state, &rec(json!({"blob": "abc"})), MergeMode::Deep)
            .unwrap()
            .unwrap();
        assert_eq!(planned.key, "h3");
        assert_eq!(planned.record["hash"], "h3");
    }

    #[test]
    fn unchanged_value_is_noop() {
        let q = accounts();
        let state = state_with(&q, vec![json!({"account_id": "me", "name": "Ann"})]);
        let planned = plan_set(
            &q,
            &state,
            &rec(json!({"account_id": "me", "name": "Ann"})),
            MergeMode::Deep,
        )
        .unwrap();
        assert!(planned.is_none());
    }

    #[test]
    fn merge_modes() {
        let q = accounts();
        let state = state_with(
            &q,
            vec![json!({"account_id": "me", "name": "Ann", "settings": {"a": 1, "b": 2}})],
        );
        let changes = rec(json!({"account_id": "me", "settings": {"b": 3}}));

        let deep = plan_set(&q, &state, &changes, MergeMode::Deep).unwrap().unwrap();
        assert_eq!(deep.record["settings"], json!({"a": 1, "b": 3}));
        assert_eq!(deep.record["name"], "Ann");

        let shallow = plan_set(&q, &state, &changes, MergeMode::Shallow)
            .unwrap()
            .unwrap();
        assert_eq!(shallow.record["settings"], json!({"b": 3}));
        assert_eq!(shallow.record["name"], "Ann");

        let replaced = plan_set(&q, &state, &changes, MergeMode::None).unwrap().unwrap();
        assert_eq!(
            Value::Object(replaced.record),
            json!({"account_id": "me", "settings": {"b": 3}})
        );
    }
}
