// ironquery-core/src/error.rs
//! Error types for the query engine
//!
//! Per-record evaluation failures (`TypeMismatch`) are contained by the
//! pipeline stages that produce derived fields. Everything else is surfaced
//! to the caller unchanged.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    /// Operator applied to operands of incompatible types
    #[error("Type mismatch in {operator}: expected {expected}, found {found}")]
    TypeMismatch {
        operator: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// Malformed query: an operator name nobody registered
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// Invalid stage parameter, detected before execution
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Update target absent
    #[error("No record with {field} = {id}")]
    NotFound { field: String, id: String },

    /// Structurally invalid query document
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Pipeline failure, located at a stage (and record, when one was involved)
    #[error("Stage {index} ({stage}){}: {source}", .record.map(|r| format!(" at record {}", r)).unwrap_or_default())]
    Stage {
        index: usize,
        stage: &'static str,
        record: Option<usize>,
        #[source]
        source: Box<QueryError>,
    },

    /// Ingestion rejected the input
    #[error("Ingestion failed: {0}")]
    Ingest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueryError {
    pub(crate) fn type_mismatch(
        operator: &'static str,
        expected: &'static str,
        found: &'static str,
    ) -> Self {
        QueryError::TypeMismatch {
            operator,
            expected,
            found,
        }
    }

    /// Wrap an error with the pipeline position it came from
    pub(crate) fn at_stage(self, index: usize, stage: &'static str, record: Option<usize>) -> Self {
        QueryError::Stage {
            index,
            stage,
            record,
            source: Box::new(self),
        }
    }

    /// True for errors a pipeline contains per record instead of aborting
    pub fn is_recoverable(&self) -> bool {
        matches!(self, QueryError::TypeMismatch { .. } | QueryError::NotFound { .. })
    }

    /// The innermost error beneath any stage wrappers
    pub fn root_cause(&self) -> &QueryError {
        match self {
            QueryError::Stage { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
