// ironquery-core/src/lib.rs
// Embeddable document query/aggregation engine - pure Rust API

pub mod aggregation;
pub mod collection;
pub mod config;
pub mod error;
pub mod expr;
pub mod find_options;
pub mod format;
pub mod ingest;
pub mod logging;
pub mod path;
pub mod query;
pub mod store;
pub mod update;
pub mod value;

// Public exports
pub use aggregation::{Accumulator, GroupStage, Pipeline, SortDirection, Stage};
pub use collection::Collection;
pub use config::{EngineConfig, IdStrategy};
pub use error::{QueryError, Result};
pub use expr::Expr;
pub use find_options::{FindOptions, ProjectField, Projection};
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use path::FieldPath;
pub use query::Predicate;
pub use store::{InsertManyResult, RecordStore};
pub use update::{Update, UpdateOp};
pub use value::{Record, Value};
