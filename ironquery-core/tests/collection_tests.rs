// collection_tests.rs
// Load -> find -> update -> aggregate against a product catalog file

use chrono::Utc;
use ironquery_core::value::record_to_json;
use ironquery_core::{
    format, ingest, Collection, FieldPath, Predicate, QueryError, Stage, Update, Value,
};
use serde_json::{json, Value as JsonValue};
use std::io::Write;
use tempfile::NamedTempFile;

const CATALOG: &str = r#"[
    {"product_id": "ELEC001", "name": "Laptop", "category": "Electronics", "price": 40000, "stock": 5,
     "reviews": [{"user": "ann", "rating": 5}, {"user": "bob", "rating": 4}]},
    {"product_id": "ELEC002", "name": "Phone", "category": "Electronics", "price": 60000, "stock": 2,
     "reviews": [{"user": "cid", "rating": 3}]},
    {"product_id": "BOOK001", "name": "Novel", "category": "Books", "price": 500, "stock": 10}
]"#;

/// Helper to load the catalog through a real file
fn load_catalog() -> Collection {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CATALOG.as_bytes()).unwrap();

    let records = ingest::load_json_array(file.path()).unwrap();
    let collection = Collection::new("products");
    let result = collection.insert_many(records);
    assert_eq!(result.inserted_count, 3);
    collection
}

fn render(records: &[ironquery_core::Record]) -> Vec<JsonValue> {
    records.iter().map(record_to_json).collect()
}

#[test]
fn test_ids_assigned_on_ingestion() {
    let collection = load_catalog();
    let ids: Vec<Value> = collection
        .snapshot()
        .iter()
        .map(|r| r.get("_id").cloned().unwrap())
        .collect();
    assert_eq!(ids, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn test_push_review_then_slice_last_two() {
    let collection = load_catalog();
    let before = Utc::now();

    let review = Value::from_json(&json!({"user": "dee", "rating": 2}));
    let updated = collection
        .apply_update("product_id", &Value::from("ELEC001"), &Update::new().push("reviews", review))
        .unwrap();

    let stamped = match updated.get("last_modified") {
        Some(Value::Timestamp(ts)) => *ts,
        other => panic!("expected timestamp, got {:?}", other),
    };
    assert!(stamped >= before && stamped <= Utc::now());

    let out = collection
        .aggregate_stages(vec![
            Stage::Match(Predicate::eq("product_id", "ELEC001")),
            Stage::slice("reviews", -2),
        ])
        .unwrap();

    assert_eq!(out.len(), 1);
    assert_eq!(
        record_to_json(&out[0])["reviews"],
        json!([{"user": "bob", "rating": 4}, {"user": "dee", "rating": 2}])
    );
}

#[test]
fn test_json_update_and_slice_projection() {
    let collection = load_catalog();
    collection
        .apply_update(
            "product_id",
            &Value::from("ELEC002"),
            &Update::from_json(&json!({
                "$push": {"reviews": {"user": "eve", "rating": 5}},
                "$set": {"stock": 1}
            }))
            .unwrap(),
        )
        .unwrap();

    let out = collection
        .find_json(
            &json!({"product_id": "ELEC002"}),
            Some(&json!({"_id": 0, "stock": 1, "reviews": {"$slice": -1}})),
        )
        .unwrap();
    assert_eq!(
        render(&out),
        vec![json!({"stock": 1, "reviews": [{"user": "eve", "rating": 5}]})]
    );
}

#[test]
fn test_update_missing_target_is_not_found() {
    let collection = load_catalog();
    let err = collection
        .apply_update("product_id", &Value::from("TOY001"), &Update::new().set("stock", 0))
        .unwrap_err();
    match err {
        QueryError::NotFound { field, id } => {
            assert_eq!(field, "product_id");
            assert!(id.contains("TOY001"));
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
    // Nothing was stamped
    assert!(collection
        .snapshot()
        .iter()
        .all(|r| r.get("last_modified").is_none()));
}

#[test]
fn test_duplicate_identifier_updates_first_match_only() {
    let collection = load_catalog();
    collection.insert_one(
        ironquery_core::value::record_from_json(&json!({"product_id": "ELEC001", "name": "Laptop (dup)"}))
            .unwrap(),
    );

    let updated = collection
        .apply_update("product_id", &Value::from("ELEC001"), &Update::new().set("stock", 0))
        .unwrap();
    assert_eq!(updated.get("name"), Some(&Value::from("Laptop")));

    let snapshot = collection.snapshot();
    let dup = snapshot
        .iter()
        .find(|r| r.get("name") == Some(&Value::from("Laptop (dup)")))
        .unwrap();
    assert!(dup.get("stock").is_none());
    assert!(dup.get("last_modified").is_none());
}

#[test]
fn test_per_category_price_report() {
    let collection = load_catalog();
    let out = collection
        .aggregate_json(&json!([
            {"$group": {
                "_id": "$category",
                "avg_price": {"$avg": "$price"},
                "total_stock": {"$sum": "$stock"},
                "count": {"$sum": 1}
            }},
            {"$sort": {"avg_price": -1}}
        ]))
        .unwrap();

    assert_eq!(
        render(&out),
        vec![
            json!({"_id": "Electronics", "avg_price": 50000.0, "total_stock": 7, "count": 2}),
            json!({"_id": "Books", "avg_price": 500.0, "total_stock": 10, "count": 1}),
        ]
    );
}

#[test]
fn test_top_rated_products() {
    let collection = load_catalog();
    let out = collection
        .aggregate_json(&json!([
            {"$addFields": {"avg_rating": {"$round": [{"$avg": {"$ifNull": ["$reviews.rating", []]}}, 1]}}},
            {"$match": {"avg_rating": {"$gte": 4.0}}},
            {"$project": {"_id": 0, "name": 1, "avg_rating": 1}}
        ]))
        .unwrap();
    assert_eq!(render(&out), vec![json!({"name": "Laptop", "avg_rating": 4.5})]);
}

#[test]
fn test_snapshot_taken_before_update_is_unchanged() {
    let collection = load_catalog();
    let snapshot = collection.snapshot();

    collection
        .update_one(&Predicate::eq("name", "Novel"), &Update::new().inc("stock", -1))
        .unwrap();

    let novel_stock = |records: &[ironquery_core::Record]| {
        records
            .iter()
            .find(|r| r.get("name") == Some(&Value::from("Novel")))
            .and_then(|r| FieldPath::from("stock").lookup(r))
    };
    assert_eq!(novel_stock(snapshot.as_slice()), Some(Value::Int(10)));
    assert_eq!(novel_stock(collection.snapshot().as_slice()), Some(Value::Int(9)));
}

#[test]
fn test_formatted_output_renders_timestamps() {
    let collection = load_catalog();
    let updated = collection
        .apply_update("product_id", &Value::from("BOOK001"), &Update::new().set("stock", 11))
        .unwrap();
    let text = format::pretty(&[updated]).unwrap();
    let parsed: JsonValue = serde_json::from_str(&text).unwrap();
    assert!(parsed[0]["last_modified"]["$date"].is_string());
}
