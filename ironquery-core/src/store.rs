// ironquery-core/src/store.rs
//! Ordered in-memory record store
//!
//! Readers take an `Arc` snapshot and iterate it without holding the lock.
//! Writers take the write lock and publish a new vector; `Arc::make_mut`
//! copies only when a snapshot is still alive, so a running `$group` or
//! `$sort` keeps seeing the records it started with.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::IdStrategy;
use crate::error::Result;
use crate::path::FieldPath;
use crate::update::Update;
use crate::value::{Record, Value};
use crate::{log_debug, log_trace};

/// Result of a bulk insert
#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
    pub inserted_count: usize,
}

struct StoreInner {
    records: Arc<Vec<Record>>,
    /// Largest integer `_id` seen, for auto-increment
    last_id: i64,
}

pub struct RecordStore {
    inner: RwLock<StoreInner>,
    id_strategy: IdStrategy,
}

impl RecordStore {
    pub fn new(id_strategy: IdStrategy) -> Self {
        RecordStore {
            inner: RwLock::new(StoreInner {
                records: Arc::new(Vec::new()),
                last_id: 0,
            }),
            id_strategy,
        }
    }

    pub fn id_strategy(&self) -> IdStrategy {
        self.id_strategy
    }

    /// Append one record, assigning `_id` when absent; returns the id
    pub fn insert(&self, record: Record) -> Value {
        let mut result = self.insert_many(vec![record]);
        result.inserted_ids.pop().unwrap_or(Value::Null)
    }

    /// Append records in order under a single write
    pub fn insert_many(&self, records: Vec<Record>) -> InsertManyResult {
        if records.is_empty() {
            return InsertManyResult {
                inserted_ids: Vec::new(),
                inserted_count: 0,
            };
        }

        let mut inner = self.inner.write();
        let mut last_id = inner.last_id;
        let mut inserted_ids = Vec::with_capacity(records.len());
        let mut prepared = Vec::with_capacity(records.len());

        for mut record in records {
            let id = match record.get("_id") {
                Some(Value::Int(n)) => {
                    last_id = last_id.max(*n);
                    Value::Int(*n)
                }
                Some(existing) => existing.clone(),
                None => {
                    let id = match self.id_strategy {
                        IdStrategy::AutoIncrement => {
                            last_id = last_id.saturating_add(1);
                            Value::Int(last_id)
                        }
                        IdStrategy::ObjectId => Value::String(Uuid::new_v4().to_string()),
                    };
                    record.insert("_id".to_string(), id.clone());
                    id
                }
            };
            inserted_ids.push(id);
            prepared.push(record);
        }

        inner.last_id = last_id;
        Arc::make_mut(&mut inner.records).extend(prepared);
        log_debug!(
            "Inserted {} records ({} total)",
            inserted_ids.len(),
            inner.records.len()
        );

        InsertManyResult {
            inserted_count: inserted_ids.len(),
            inserted_ids,
        }
    }

    /// Immutable view of the records at this instant
    pub fn snapshot(&self) -> Arc<Vec<Record>> {
        Arc::clone(&self.inner.read().records)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Update the first record accepted by `select`
    ///
    /// The update and the audit timestamp are applied to a copy; the store
    /// changes only if both succeed. `Ok(None)` when nothing matched.
    pub fn update_first<F>(
        &self,
        select: F,
        update: &Update,
        audit_field: &FieldPath,
    ) -> Result<Option<Record>>
    where
        F: Fn(&Record) -> bool,
    {
        let mut inner = self.inner.write();
        let position = match inner.records.iter().position(|r| select(r)) {
            Some(position) => position,
            None => return Ok(None),
        };

        let mut record = inner.records[position].clone();
        update.apply(&mut record)?;
        audit_field.assign(&mut record, Value::Timestamp(Utc::now()))?;

        Arc::make_mut(&mut inner.records)[position] = record.clone();
        log_trace!("Updated record at position {}", position);
        Ok(Some(record))
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        RecordStore::new(IdStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::record;

    #[test]
    fn test_auto_increment_ids_continue_after_explicit() {
        let store = RecordStore::new(IdStrategy::AutoIncrement);
        let result = store.insert_many(vec![
            record([("name", Value::from("a"))]),
            record([("_id", Value::Int(10)), ("name", Value::from("b"))]),
            record([("name", Value::from("c"))]),
        ]);
        assert_eq!(result.inserted_count, 3);
        assert_eq!(
            result.inserted_ids,
            vec![Value::Int(1), Value::Int(10), Value::Int(11)]
        );
        assert_eq!(store.insert(record([("name", Value::from("d"))])), Value::Int(12));
    }

    #[test]
    fn test_object_id_strategy() {
        let store = RecordStore::new(IdStrategy::ObjectId);
        let id = store.insert(Record::new());
        let id = id.as_str().unwrap();
        assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 4);
    }

    #[test]
    fn test_empty_insert_many() {
        let store = RecordStore::default();
        assert_eq!(store.insert_many(vec![]).inserted_count, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let store = RecordStore::default();
        store.insert(record([("n", Value::Int(1))]));
        let before = store.snapshot();

        store.insert(record([("n", Value::Int(2))]));
        store
            .update_first(|_| true, &Update::new().set("n", 99), &FieldPath::from("last_modified"))
            .unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].get("n"), Some(&Value::Int(1)));
        assert_eq!(store.len(), 2);
        assert_eq!(store.snapshot()[0].get("n"), Some(&Value::Int(99)));
    }

    #[test]
    fn test_update_first_stamps_audit_field() {
        let store = RecordStore::default();
        store.insert(record([("sku", Value::from("A"))]));
        let updated = store
            .update_first(
                |r| r.get("sku") == Some(&Value::from("A")),
                &Update::new().set("stock", 3),
                &FieldPath::from("meta.updated"),
            )
            .unwrap()
            .unwrap();
        assert!(matches!(
            FieldPath::from("meta.updated").lookup(&updated),
            Some(Value::Timestamp(_))
        ));
    }

    #[test]
    fn test_failed_update_leaves_store_untouched() {
        let store = RecordStore::default();
        store.insert(record([("name", Value::from("x"))]));
        let err = store.update_first(
            |_| true,
            &Update::new().push("name", 1),
            &FieldPath::from("last_modified"),
        );
        assert!(err.is_err());
        assert!(store.snapshot()[0].get("last_modified").is_none());
    }

    #[test]
    fn test_update_without_match() {
        let store = RecordStore::default();
        store.insert(Record::new());
        let result = store
            .update_first(|_| false, &Update::new().set("a", 1), &FieldPath::from("last_modified"))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_store_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RecordStore>();
    }
}
