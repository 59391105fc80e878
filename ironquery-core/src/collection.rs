// ironquery-core/src/collection.rs
//! Collection facade: insert, find, aggregate, update

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::aggregation::{Pipeline, Stage};
use crate::config::EngineConfig;
use crate::error::{QueryError, Result};
use crate::find_options::{FindOptions, Projection};
use crate::path::FieldPath;
use crate::query::Predicate;
use crate::store::{InsertManyResult, RecordStore};
use crate::update::Update;
use crate::value::{Record, Value};
use crate::{log_debug, log_info};

pub struct Collection {
    pub name: String,
    store: RecordStore,
    config: EngineConfig,
    audit_field: FieldPath,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        let config = EngineConfig::default();
        Collection {
            name: name.to_string(),
            store: RecordStore::new(config.id_strategy),
            audit_field: FieldPath::from(config.audit_field.as_str()),
            config,
        }
    }

    pub fn with_config(name: &str, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Collection {
            name: name.to_string(),
            store: RecordStore::new(config.id_strategy),
            audit_field: FieldPath::parse(&config.audit_field)?,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========== INSERT OPERATIONS ==========

    pub fn insert_one(&self, record: Record) -> Value {
        self.store.insert(record)
    }

    pub fn insert_many(&self, records: Vec<Record>) -> InsertManyResult {
        self.store.insert_many(records)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn snapshot(&self) -> Arc<Vec<Record>> {
        self.store.snapshot()
    }

    // ========== QUERY OPERATIONS ==========

    /// Find records matching `filter`, optionally projected
    pub fn find(&self, filter: &Predicate, projection: Option<&Projection>) -> Result<Vec<Record>> {
        let mut options = FindOptions::new();
        if let Some(projection) = projection {
            options = options.with_projection(projection.clone());
        }
        self.find_with_options(filter, &options)
    }

    /// Find with projection, sort, skip and limit
    pub fn find_with_options(&self, filter: &Predicate, options: &FindOptions) -> Result<Vec<Record>> {
        log_debug!("find() called with filter: {:?}", filter);
        let pipeline = Pipeline::new(options.to_stages(filter))?;
        self.aggregate(&pipeline)
    }

    /// Find from MongoDB-style filter and projection documents
    pub fn find_json(&self, filter: &JsonValue, projection: Option<&JsonValue>) -> Result<Vec<Record>> {
        let filter = Predicate::from_json(filter)?;
        let projection = projection.map(Projection::from_json).transpose()?;
        self.find(&filter, projection.as_ref())
    }

    pub fn count(&self, filter: &Predicate) -> usize {
        self.store.snapshot().iter().filter(|r| filter.matches(r)).count()
    }

    // ========== AGGREGATION ==========

    /// Run a pipeline over a snapshot of the collection
    pub fn aggregate(&self, pipeline: &Pipeline) -> Result<Vec<Record>> {
        let snapshot = self.store.snapshot();
        pipeline.execute_iter(snapshot.iter().cloned())
    }

    pub fn aggregate_json(&self, pipeline: &JsonValue) -> Result<Vec<Record>> {
        self.aggregate(&Pipeline::from_json(pipeline)?)
    }

    /// Convenience for typed stage lists
    pub fn aggregate_stages(&self, stages: Vec<Stage>) -> Result<Vec<Record>> {
        self.aggregate(&Pipeline::new(stages)?)
    }

    // ========== UPDATE OPERATIONS ==========

    /// Update the first record whose `key_field` equals `id`
    ///
    /// Identifier uniqueness is not enforced: when several records carry the
    /// same id only the first in insertion order is modified.
    pub fn apply_update(&self, key_field: &str, id: &Value, update: &Update) -> Result<Record> {
        update.validate()?;
        let key = FieldPath::parse(key_field)?;

        let updated = self
            .store
            .update_first(|r| key.lookup(r).as_ref() == Some(id), update, &self.audit_field)?;

        match updated {
            Some(record) => {
                log_info!("Updated record {} = {} in '{}'", key_field, id, self.name);
                Ok(record)
            }
            None => Err(QueryError::NotFound {
                field: key_field.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// Update the first record matching `filter`
    pub fn update_one(&self, filter: &Predicate, update: &Update) -> Result<Record> {
        update.validate()?;
        self.store
            .update_first(|r| filter.matches(r), update, &self.audit_field)?
            .ok_or_else(|| QueryError::NotFound {
                field: "filter".to_string(),
                id: format!("{:?}", filter),
            })
    }
}
