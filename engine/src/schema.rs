//! Table schemas as published by the catalog service.
//!
//! A schema declares which tables exist, their fields, their primary keys and
//! which fields clients may write. The engine only reads schemas; it never
//! changes them.

use crate::{error::Result, Error, Record, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Derives primary-key values (in primary-key order) from the other fields of
/// a record, for tables whose keys are computed server-side.
pub type ComputedKeyFn = fn(&Record) -> Option<Vec<Value>>;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }

    /// Validate a value against this field's type. `null` is always accepted
    /// since it clears the field.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            _ if value.is_null() => true,
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64() || value.is_string(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Schema for a single table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Primary key fields, in key order
    pub primary_key: Vec<String>,
    /// Declared fields, in declaration order
    pub fields: Vec<FieldDef>,
    /// Fields clients may set
    pub settable: BTreeSet<String>,
    /// Settable fields that must be given when a record is created
    pub required: BTreeSet<String>,
    /// Whether anonymous clients may read the table
    pub anonymous: bool,
    /// Change notifications are batched over this interval when set
    #[serde(default, with = "duration_millis")]
    pub throttle: Option<Duration>,
    /// Initial reads may be served from a standby, racing the changefeed
    pub standby: bool,
    #[serde(skip)]
    pub computed_key: Option<ComputedKeyFn>,
}

impl TableSchema {
    /// Create a table schema with the given primary key fields.
    ///
    /// Primary key fields are declared as `Json` fields if not declared later.
    pub fn new<I, S>(name: impl Into<TableName>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let primary_key: Vec<String> = primary_key.into_iter().map(Into::into).collect();
        let fields = primary_key
            .iter()
            .map(|pk| FieldDef::new(pk.clone(), FieldType::Json))
            .collect();
        Self {
            name: name.into(),
            primary_key,
            fields,
            settable: BTreeSet::new(),
            required: BTreeSet::new(),
            anonymous: false,
            throttle: None,
            standby: false,
            computed_key: None,
        }
    }

    /// Declare a field, replacing any previous declaration with that name.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Mark fields as settable by clients.
    pub fn settable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.settable.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Mark fields as required on create. Required fields are also settable.
    pub fn required<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            self.settable.insert(field.clone());
            self.required.insert(field);
        }
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = Some(interval);
        self
    }

    pub fn standby(mut self, standby: bool) -> Self {
        self.standby = standby;
        self
    }

    pub fn computed_key(mut self, f: ComputedKeyFn) -> Self {
        self.computed_key = Some(f);
        self
    }

    /// Get a field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether clients may write to this table at all.
    pub fn is_writable(&self) -> bool {
        !self.settable.is_empty()
    }
}

/// All tables known to the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Table schemas by name
    pub tables: HashMap<TableName, TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Get a table schema by name.
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
