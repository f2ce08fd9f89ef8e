//! Edge case tests for tablesync-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use serde_json::{json, Value};
use tablesync_engine::record::{decode_compound_key, deep_merge, into_record};
use tablesync_engine::save::SavePlan;
use tablesync_engine::{
    DualState, Error, FieldDef, FieldType, Reconciler, Record, Schema, TableQuery, TableSchema,
};

fn create_test_schema() -> Schema {
    Schema::new()
        .with_table(
            TableSchema::new("items", ["id"])
                .with_field(FieldDef::new("name", FieldType::String))
                .with_field(FieldDef::new("count", FieldType::Int))
                .with_field(FieldDef::new("data", FieldType::Json))
                .settable(["id", "name", "count", "data"]),
        )
        .with_table(
            TableSchema::new("pairs", ["left", "right"])
                .with_field(FieldDef::new("value", FieldType::Json))
                .settable(["left", "right", "value"]),
        )
}

fn rec(value: Value) -> Record {
    into_record(value).unwrap()
}

fn query(name: &str) -> TableQuery {
    TableQuery::parse(&json!(name), &create_test_schema()).unwrap()
}

fn loaded(query: &TableQuery, rows: Vec<Value>) -> DualState {
    let mut state = DualState::new();
    Reconciler::new(query, &mut state).apply_snapshot(rows.into_iter().map(rec).collect());
    state
}

// ============================================================================
// Key Edge Cases
// ============================================================================

#[test]
fn empty_string_key() {
    let q = query("items");
    let state = loaded(&q, vec![json!({"id": "", "name": "blank"})]);

    assert_eq!(state.get_local("").unwrap()["name"], "blank");
}

#[test]
fn unicode_keys() {
    let q = query("items");
    let ids = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Hello\nWorld\tTab",
    ];
    let rows = ids.iter().map(|id| json!({"id": id})).collect();
    let state = loaded(&q, rows);

    assert_eq!(state.len(), ids.len());
    for id in ids {
        assert!(state.get_local(id).is_some(), "missing {id:?}");
    }
}

#[test]
fn numeric_keys_use_compact_json() {
    let q = query("items");
    assert_eq!(q.key_of(&rec(json!({"id": 42}))).as_deref(), Some("42"));
    assert_eq!(q.key_of(&rec(json!({"id": 1.5}))).as_deref(), Some("1.5"));
    assert_eq!(q.key_of(&rec(json!({"id": true}))).as_deref(), Some("true"));
}

#[test]
fn null_key_is_no_key() {
    let q = query("items");
    assert_eq!(q.key_of(&rec(json!({"id": null}))), None);

    let state = loaded(&q, vec![json!({"id": null}), json!({"name": "no id"}), json!({"id": "ok"})]);
    assert_eq!(state.len(), 1);
}

#[test]
fn compound_key_with_special_characters() {
    let q = query("pairs");
    let key = q
        .key_of(&rec(json!({"left": "a,\"b\"", "right": "[c]"})))
        .unwrap();

    assert_eq!(
        decode_compound_key(&key).unwrap(),
        vec![json!("a,\"b\""), json!("[c]")]
    );
    let pk = q.pk_values(&key, None);
    assert_eq!(pk["left"], "a,\"b\"");
    assert_eq!(pk["right"], "[c]");
}

#[test]
fn compound_key_order_matters() {
    let q = query("pairs");
    let ab = q.key_of(&rec(json!({"left": "a", "right": "b"}))).unwrap();
    let ba = q.key_of(&rec(json!({"left": "b", "right": "a"}))).unwrap();
    assert_ne!(ab, ba);
}

#[test]
fn compound_key_with_mixed_types() {
    let q = query("pairs");
    let key = q.key_of(&rec(json!({"left": 7, "right": "x"}))).unwrap();
    assert_eq!(key, r#"[7,"x"]"#);
    assert_eq!(q.pk_values(&key, None)["left"], 7);
}

// ============================================================================
// Value Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let def = FieldDef::new("count", FieldType::Int);
    assert!(def.validate(&json!(i64::MAX)).is_ok());
    assert!(def.validate(&json!(i64::MIN)).is_ok());
    assert!(def.validate(&json!(u64::MAX)).is_ok());
    assert!(matches!(
        def.validate(&json!(1.5)),
        Err(Error::TypeMismatch { .. })
    ));
}

#[test]
fn deeply_nested_json_merges() {
    let base = rec(json!({"data": {"a": {"b": {"c": {"d": 1, "e": 2}}}}}));
    let changes = rec(json!({"data": {"a": {"b": {"c": {"d": 10}}}}}));

    let merged = deep_merge(&base, &changes);
    assert_eq!(merged["data"], json!({"a": {"b": {"c": {"d": 10, "e": 2}}}}));
}

#[test]
fn null_in_deep_merge_removes_nested_field() {
    let base = rec(json!({"data": {"keep": 1, "drop": 2}}));
    let changes = rec(json!({"data": {"drop": null}}));

    assert_eq!(deep_merge(&base, &changes)["data"], json!({"keep": 1}));
}

#[test]
fn arrays_are_replaced_not_merged() {
    let base = rec(json!({"data": [1, 2, 3]}));
    let changes = rec(json!({"data": [4]}));
    assert_eq!(deep_merge(&base, &changes)["data"], json!([4]));
}

#[test]
fn structural_equality_ignores_field_order() {
    let q = query("items");
    let mut state = loaded(&q, vec![json!({"id": "a", "data": {"x": 1, "y": 2}})]);
    let result = Reconciler::new(&q, &mut state)
        .apply_snapshot(vec![rec(json!({"data": {"y": 2, "x": 1}, "id": "a"}))]);

    assert!(result.changed.is_empty());
    assert!(!state.has_uncommitted_changes());
}

// ============================================================================
// Reconciliation Edge Cases
// ============================================================================

#[test]
fn empty_resync_deletes_clean_records() {
    let q = query("items");
    let mut state = loaded(&q, vec![json!({"id": "a"}), json!({"id": "b"})]);
    state.set_local("b".into(), rec(json!({"id": "b", "name": "edited"})));

    let result = Reconciler::new(&q, &mut state).apply_snapshot(vec![]);

    assert_eq!(result.changed, vec!["a"]);
    assert!(result.needs_save);
    assert_eq!(state.len(), 1);
    assert!(state.get_local("b").is_some());
}

#[test]
fn duplicate_rows_in_snapshot_keep_last() {
    let q = query("items");
    let state = loaded(
        &q,
        vec![json!({"id": "a", "name": "first"}), json!({"id": "a", "name": "second"})],
    );
    assert_eq!(state.len(), 1);
    assert_eq!(state.get_local("a").unwrap()["name"], "second");
}

#[test]
fn update_without_key_is_ignored() {
    let q = query("items");
    let mut state = loaded(&q, vec![json!({"id": "a"})]);
    let result = Reconciler::new(&q, &mut state).apply_update(Some(rec(json!({"name": "x"}))), None);

    assert!(result.changed.is_empty());
    assert_eq!(state.len(), 1);
}

#[test]
fn delete_of_unknown_key_is_noop() {
    let q = query("items");
    let mut state = loaded(&q, vec![json!({"id": "a"})]);
    let result = Reconciler::new(&q, &mut state).apply_update(None, Some(rec(json!({"id": "zzz"}))));

    assert!(result.changed.is_empty());
    assert!(!result.needs_save);
}

#[test]
fn many_records_snapshot() {
    let q = query("items");
    let rows: Vec<Value> = (0..5000).map(|i| json!({"id": format!("r{i:05}"), "count": i})).collect();
    let mut state = loaded(&q, rows.clone());
    assert_eq!(state.len(), 5000);

    let result = Reconciler::new(&q, &mut state).apply_snapshot(rows.into_iter().map(rec).collect());
    assert!(result.changed.is_empty());
}

#[test]
fn many_dirty_keys_are_planned_in_order() {
    let q = query("items");
    let mut state = loaded(&q, vec![]);
    for i in (0..200).rev() {
        let id = format!("k{i:03}");
        state.set_local(id.clone(), rec(json!({"id": id, "count": i})));
    }

    let plan = SavePlan::build(&q, &state);
    assert_eq!(plan.writes.len(), 200);
    assert_eq!(plan.writes[0].0, "k000");
    assert_eq!(plan.writes[199].0, "k199");
}

// ============================================================================
// Query Edge Cases
// ============================================================================

#[test]
fn query_construction_errors() {
    let schema = create_test_schema();
    let cases = [
        (json!(["items"]), Error::QueryIsSequence),
        (json!({"items": [{}], "pairs": [{}]}), Error::MultipleTables(2)),
        (json!({"ghosts": [{}]}), Error::UnknownTable("ghosts".into())),
        (json!({"items": {"id": null}}), Error::InvalidQueryBody("items".into())),
        (json!({"items": [{"id": [1]}]}), Error::InvalidPrimaryKey("id".into())),
    ];

    for (input, expected) in cases {
        let err = TableQuery::parse(&input, &schema).unwrap_err();
        assert!(err.is_construction());
        assert_eq!(err, expected, "for {input}");
    }
}

#[test]
fn projection_without_primary_key_gets_it_injected() {
    let q = TableQuery::parse(&json!({"pairs": [{"value": null}]}), &create_test_schema()).unwrap();
    assert_eq!(q.fields(), ["left", "right", "value"]);
    assert_eq!(q.to_value(), json!({"pairs": [{"left": null, "right": null, "value": null}]}));
}

#[test]
fn field_names_with_special_characters() {
    let schema = Schema::new().with_table(
        TableSchema::new("odd", ["key with spaces"])
            .with_field(FieldDef::new("dotted.name", FieldType::String)),
    );
    let q = TableQuery::parse(&json!("odd"), &schema).unwrap();
    let key = q.key_of(&rec(json!({"key with spaces": "k", "dotted.name": "v"})));
    assert_eq!(key.as_deref(), Some("k"));
}
