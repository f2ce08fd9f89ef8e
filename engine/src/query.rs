//! Query descriptors.
//!
//! A [`TableQuery`] is the canonical form of a single-table query: which table,
//! which fields are projected, how records are keyed and which fields the
//! client may write. It is built once from a query description and never
//! changes afterwards.
//!
//! Two query forms are accepted:
//!
//! - a bare table name, `"accounts"`, which projects every declared field;
//! - an object with one table key whose value is a sequence of field
//!   templates, `{"accounts": [{"account_id": null, "name": null}]}`.

use crate::record::{decode_compound_key, key_of};
use crate::{error::Result, Error, Record, RecordKey, Schema, TableName, TableSchema};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Canonical single-table query.
#[derive(Debug, Clone)]
pub struct TableQuery {
    table: TableName,
    template: Record,
    fields: Vec<String>,
    primary_keys: Vec<String>,
    settable: BTreeSet<String>,
    required: BTreeSet<String>,
    anonymous: bool,
    schema: TableSchema,
}

impl TableQuery {
    /// Parse a query description against the catalog.
    pub fn parse(input: &Value, schema: &Schema) -> Result<Self> {
        let (table, body) = match input {
            Value::String(name) => (name.clone(), None),
            Value::Array(_) => return Err(Error::QueryIsSequence),
            Value::Object(obj) => match obj.len() {
                0 => return Err(Error::InvalidQuery("query names no table".into())),
                1 => {
                    let (name, body) = obj.iter().next().ok_or(Error::MultipleTables(0))?;
                    (name.clone(), Some(body))
                }
                n => return Err(Error::MultipleTables(n)),
            },
            other => {
                return Err(Error::InvalidQuery(format!(
                    "expected a table name or object, got {other}"
                )))
            }
        };

        let table_schema = schema
            .get_table(&table)
            .ok_or_else(|| Error::UnknownTable(table.clone()))?;

        let mut template = match body {
            None => all_fields(table_schema),
            Some(Value::Array(templates)) => {
                if templates.iter().any(|t| !t.is_object()) {
                    return Err(Error::InvalidQueryBody(table));
                }
                match templates.first() {
                    Some(Value::Object(first)) => first.clone(),
                    _ => all_fields(table_schema),
                }
            }
            Some(_) => return Err(Error::InvalidQueryBody(table)),
        };

        for pk in &table_schema.primary_key {
            match template.get(pk) {
                None => {
                    template.insert(pk.clone(), Value::Null);
                }
                Some(Value::Array(_)) | Some(Value::Object(_)) => {
                    return Err(Error::InvalidPrimaryKey(pk.clone()));
                }
                Some(_) => {}
            }
        }

        let fields: Vec<String> = template.keys().cloned().collect();
        let settable: BTreeSet<String> = table_schema
            .settable
            .iter()
            .filter(|f| template.contains_key(*f))
            .cloned()
            .collect();
        let required = table_schema
            .required
            .iter()
            .filter(|f| settable.contains(*f))
            .cloned()
            .collect();

        tracing::debug!(
            table = %table,
            fields = fields.len(),
            primary_keys = ?table_schema.primary_key,
            "Parsed table query"
        );

        Ok(Self {
            table,
            template,
            fields,
            primary_keys: table_schema.primary_key.clone(),
            settable,
            required,
            anonymous: table_schema.anonymous,
            schema: table_schema.clone(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Projected field names.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Primary key fields, in key order.
    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn has_compound_key(&self) -> bool {
        self.primary_keys.len() > 1
    }

    pub fn settable(&self) -> &BTreeSet<String> {
        &self.settable
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn is_settable(&self, field: &str) -> bool {
        self.settable.contains(field)
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// Whether clients may write to this table at all.
    pub fn is_writable(&self) -> bool {
        self.schema.is_writable()
    }

    /// Schema of the queried table.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Canonical key of a record, `None` if a primary key field is missing.
    pub fn key_of(&self, record: &Record) -> Option<RecordKey> {
        key_of(record, &self.primary_keys)
    }

    /// Primary key field values for a canonical key.
    ///
    /// Compound keys are decoded from the key itself; for single keys the
    /// value is read from `record` when available so non-string keys keep
    /// their original type.
    pub fn pk_values(&self, key: &str, record: Option<&Record>) -> Record {
        let mut out = Map::new();
        if self.has_compound_key() {
            if let Some(values) = decode_compound_key(key) {
                for (field, value) in self.primary_keys.iter().zip(values) {
                    out.insert(field.clone(), value);
                }
            }
        } else if let Some(field) = self.primary_keys.first() {
            let value = record
                .and_then(|r| r.get(field))
                .cloned()
                .unwrap_or_else(|| Value::String(key.to_string()));
            out.insert(field.clone(), value);
        }
        out
    }

    /// The canonical `{table: [template]}` form sent to the transport.
    pub fn to_value(&self) -> Value {
        let mut query = Map::new();
        query.insert(
            self.table.clone(),
            Value::Array(vec![Value::Object(self.template.clone())]),
        );
        Value::Object(query)
    }
}

fn all_fields(table: &TableSchema) -> Record {
    table
        .fields
        .iter()
        .map(|f| (f.name.clone(), Value::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType};
    use serde_json::json;

    fn test_schema() -> Schema {
        Schema::new()
            .with_table(
                TableSchema::new("accounts", ["account_id"])
                    .with_field(FieldDef::new("name", FieldType::String))
                    .with_field(FieldDef::new("email", FieldType::String))
                    .with_field(FieldDef::new("created", FieldType::Timestamp))
                    .settable(["name", "email"])
                    .required(["account_id", "email"])
                    .anonymous(true),
            )
            .with_table(
                TableSchema::new("file_use", ["project_id", "path"])
                    .with_field(FieldDef::new("users", FieldType::Json))
                    .settable(["project_id", "path", "users"]),
            )
            .with_table(TableSchema::new("stats", ["id"]))
    }

    #[test]
    fn bare_table_name_projects_all_fields() {
        let q = TableQuery::parse(&json!("accounts"), &test_schema()).unwrap();
        assert_eq!(q.table(), "accounts");
        assert_eq!(q.fields().len(), 4);
        assert_eq!(q.primary_keys(), ["account_id"]);
        assert!(q.is_anonymous());
    }

    #[test]
    fn primary_key_is_injected() {
        let q = TableQuery::parse(&json!({"accounts": [{"name": null}]}), &test_schema()).unwrap();
        assert!(q.fields().contains(&"account_id".to_string()));
        assert_eq!(
            q.to_value(),
            json!({"accounts": [{"account_id": null, "name": null}]})
        );
    }

    #[test]
    fn settable_is_restricted_to_projection() {
        let q = TableQuery::parse(
            &json!({"accounts": [{"account_id": null, "name": null}]}),
            &test_schema(),
        )
        .unwrap();
        assert!(q.is_settable("name"));
        assert!(!q.is_settable("email"));
        assert!(q.required().contains("account_id"));
        assert!(!q.required().contains("email"));
    }

    #[test]
    fn rejects_multiple_tables() {
        let result = TableQuery::parse(
            &json!({"accounts": [{}], "stats": [{}]}),
            &test_schema(),
        );
        assert!(matches!(result, Err(Error::MultipleTables(2))));
    }

    #[test]
    fn rejects_top_level_sequence() {
        let result = TableQuery::parse(&json!([{"accounts": [{}]}]), &test_schema());
        assert!(matches!(result, Err(Error::QueryIsSequence)));
    }

    #[test]
    fn rejects_unknown_table() {
        let result = TableQuery::parse(&json!({"nope": [{}]}), &test_schema());
        assert!(matches!(result, Err(Error::UnknownTable(t)) if t == "nope"));
    }

    #[test]
    fn rejects_non_sequence_body() {
        let result = TableQuery::parse(&json!({"accounts": {"name": null}}), &test_schema());
        assert!(matches!(result, Err(Error::InvalidQueryBody(_))));

        let result = TableQuery::parse(&json!({"accounts": ["name"]}), &test_schema());
        assert!(matches!(result, Err(Error::InvalidQueryBody(_))));
    }

    #[test]
    fn rejects_structured_primary_key_template() {
        let result = TableQuery::parse(
            &json!({"accounts": [{"account_id": ["a", "b"]}]}),
            &test_schema(),
        );
        assert!(matches!(result, Err(Error::InvalidPrimaryKey(f)) if f == "account_id"));
    }

    #[test]
    fn rejects_empty_object() {
        let result = TableQuery::parse(&json!({}), &test_schema());
        assert!(matches!(result, Err(Error::InvalidQuery(_))));
    }

    #[test]
    fn compound_key_round_trips_pk_values() {
        let q = TableQuery::parse(&json!("file_use"), &test_schema()).unwrap();
        let record = crate::record::into_record(json!({"project_id": "p", "path": "a.md"})).unwrap();
        let key = q.key_of(&record).unwrap();

        let pk = q.pk_values(&key, None);
        assert_eq!(Value::Object(pk), json!({"project_id": "p", "path": "a.md"}));
    }

    #[test]
    fn single_key_pk_values_keep_type() {
        let q = TableQuery::parse(&json!("stats"), &test_schema()).unwrap();
        let record = crate::record::into_record(json!({"id": 7})).unwrap();
        let key = q.key_of(&record).unwrap();
        assert_eq!(key, "7");
        assert_eq!(Value::Object(q.pk_values(&key, Some(&record))), json!({"id": 7}));
        assert!(!q.is_writable());
    }
}
