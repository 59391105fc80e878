//! Engine configuration
//!
//! Loaded from a JSON file (every key optional) and overlaid by environment
//! variables:
//! - `IRONQUERY_LOG`: log level
//! - `IRONQUERY_ID_STRATEGY`: `auto_increment` or `object_id`
//! - `IRONQUERY_AUDIT_FIELD`: field stamped with the update time

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};
use crate::logging::{self, LogLevel, LOG_ENV_VAR};

pub const ID_STRATEGY_ENV_VAR: &str = "IRONQUERY_ID_STRATEGY";
pub const AUDIT_FIELD_ENV_VAR: &str = "IRONQUERY_AUDIT_FIELD";

/// How the store fills in `_id` for records ingested without one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// 1, 2, 3... continuing after the largest integer `_id` seen
    #[default]
    AutoIncrement,
    /// Random UUID v4 string
    ObjectId,
}

impl FromStr for IdStrategy {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "auto_increment" => Ok(IdStrategy::AutoIncrement),
            "object_id" => Ok(IdStrategy::ObjectId),
            other => Err(QueryError::Config(format!("unknown id strategy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub id_strategy: IdStrategy,
    pub audit_field: String,
    /// Left alone when unset, so embedders keep their own level
    pub log_level: Option<LogLevel>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            id_strategy: IdStrategy::AutoIncrement,
            audit_field: "last_modified".to_string(),
            log_level: None,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Overlay values from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from any variable lookup
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup(LOG_ENV_VAR) {
            let level = level
                .parse::<LogLevel>()
                .map_err(|e| QueryError::Config(format!("{}: {}", LOG_ENV_VAR, e)))?;
            self.log_level = Some(level);
        }
        if let Some(strategy) = lookup(ID_STRATEGY_ENV_VAR) {
            self.id_strategy = strategy.parse()?;
        }
        if let Some(field) = lookup(AUDIT_FIELD_ENV_VAR) {
            self.audit_field = field;
        }
        self.validate()
    }

    /// Set the global log level when one is configured
    pub fn apply_logging(&self) {
        if let Some(level) = self.log_level {
            logging::set_log_level(level);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let field = self.audit_field.as_str();
        if field.is_empty() || field.starts_with('$') || field.split('.').any(str::is_empty) {
            return Err(QueryError::Config(format!(
                "audit_field '{}' is not a valid field path",
                field
            )));
        }
        if field == "_id" || field.starts_with("_id.") {
            return Err(QueryError::Config("audit_field cannot target _id".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.id_strategy, IdStrategy::AutoIncrement);
        assert_eq!(config.audit_field, "last_modified");
        assert_eq!(config.log_level, None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"id_strategy": "object_id"}"#).unwrap();
        assert_eq!(config.id_strategy, IdStrategy::ObjectId);
        assert_eq!(config.audit_field, "last_modified");
    }

    #[test]
    fn test_unknown_keys_and_bad_values_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"audit": "x"}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"id_strategy": "uuid"}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"audit_field": ""}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"audit_field": "_id"}"#).is_err());
    }

    #[test]
    fn test_env_overlay() {
        let mut config = EngineConfig::default();
        config
            .apply_env_from(env(&[
                (LOG_ENV_VAR, "debug"),
                (ID_STRATEGY_ENV_VAR, "object_id"),
                (AUDIT_FIELD_ENV_VAR, "meta.updated_at"),
            ]))
            .unwrap();
        assert_eq!(config.log_level, Some(LogLevel::Debug));
        assert_eq!(config.id_strategy, IdStrategy::ObjectId);
        assert_eq!(config.audit_field, "meta.updated_at");
    }

    #[test]
    fn test_env_overlay_rejects_garbage() {
        let mut config = EngineConfig::default();
        assert!(config.apply_env_from(env(&[(LOG_ENV_VAR, "loud")])).is_err());
        assert!(config.apply_env_from(env(&[(ID_STRATEGY_ENV_VAR, "random")])).is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"audit_field": "updated", "log_level": "info"}}"#).unwrap();
        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.audit_field, "updated");
        assert_eq!(config.log_level, Some(LogLevel::Info));

        assert!(matches!(
            EngineConfig::from_json_file("/nonexistent/ironquery.json"),
            Err(QueryError::Io(_))
        ));
    }
}
