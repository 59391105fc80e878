// ironquery-core/src/find_options.rs
// Find query options: projection, sort, limit, skip

use serde_json::Value as JsonValue;

use crate::aggregation::{SortDirection, Stage};
use crate::error::{QueryError, Result};
use crate::expr::Expr;
use crate::path::FieldPath;
use crate::query::Predicate;
use crate::value::{Record, Value};

/// One projection entry
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Include,       // 1
    Exclude,       // 0
    Compute(Expr), // "$field" or {"$op": ...}
    Slice(i64),    // {"$slice": n}
}

/// Record reshaping for find queries and the `$project` stage
///
/// Inclusion mode (any `Include` or `Compute` entry): only listed fields are
/// kept, `_id` is kept unless explicitly excluded, included fields missing
/// from the input are omitted and computed fields are always emitted.
/// Exclusion mode: every field is copied except the excluded ones.
/// `Slice` entries work in both modes.
///
/// Included paths that run through an array are rebuilt as nested records,
/// not as an array of sub-records: `{"reviews.rating": 1}` over
/// `reviews: [{rating: 5}, {rating: 3}]` yields `{reviews: {rating: [5, 3]}}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Projection {
    fields: Vec<(FieldPath, ProjectField)>,
}

impl Projection {
    pub fn new(fields: Vec<(FieldPath, ProjectField)>) -> Result<Self> {
        let projection = Projection { fields };
        projection.validate()?;
        Ok(projection)
    }

    /// Inclusion projection over the given fields
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Projection {
            fields: fields
                .into_iter()
                .map(|f| (FieldPath::from(f.as_ref()), ProjectField::Include))
                .collect(),
        }
    }

    /// Add an entry, re-checking the mode rules
    pub fn with_field(mut self, path: &str, field: ProjectField) -> Result<Self> {
        self.fields.push((FieldPath::parse(path)?, field));
        self.validate()?;
        Ok(self)
    }

    pub fn fields(&self) -> &[(FieldPath, ProjectField)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_inclusion(&self) -> bool {
        self.fields
            .iter()
            .any(|(_, f)| matches!(f, ProjectField::Include | ProjectField::Compute(_)))
    }

    fn excludes_id(&self) -> bool {
        self.fields
            .iter()
            .any(|(path, f)| path.head() == "_id" && path.is_simple() && *f == ProjectField::Exclude)
    }

    pub fn validate(&self) -> Result<()> {
        let has_non_id_exclusions = self
            .fields
            .iter()
            .any(|(path, f)| *f == ProjectField::Exclude && path.to_string() != "_id");
        if self.is_inclusion() && has_non_id_exclusions {
            return Err(QueryError::Config(
                "Projection cannot mix inclusion and exclusion (except _id)".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse `{"name": 1, "_id": 0, "reviews": {"$slice": -2}, "avg": {"$avg": "$r"}}`
    pub fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| QueryError::InvalidQuery("Projection must be an object".to_string()))?;

        let mut fields = Vec::with_capacity(obj.len());
        for (field, value) in obj {
            let entry = match value {
                JsonValue::Bool(true) => ProjectField::Include,
                JsonValue::Bool(false) => ProjectField::Exclude,
                JsonValue::Number(n) if n.as_f64() == Some(0.0) => ProjectField::Exclude,
                JsonValue::Number(_) => ProjectField::Include,
                JsonValue::Object(map) if map.len() == 1 && map.contains_key("$slice") => {
                    let count = map["$slice"].as_i64().ok_or_else(|| {
                        QueryError::InvalidQuery(format!("$slice on '{}' requires an integer", field))
                    })?;
                    ProjectField::Slice(count)
                }
                expr => ProjectField::Compute(Expr::from_json(expr)?),
            };
            fields.push((FieldPath::parse(field)?, entry));
        }

        Projection::new(fields)
    }

    /// Build the projected copy of `record`
    pub fn apply(&self, record: &Record) -> Result<Record> {
        if !self.is_inclusion() {
            let mut out = record.clone();
            for (path, field) in &self.fields {
                match field {
                    ProjectField::Exclude => {
                        path.remove(&mut out);
                    }
                    ProjectField::Slice(count) => slice_field(&mut out, path, *count),
                    ProjectField::Include | ProjectField::Compute(_) => {}
                }
            }
            return Ok(out);
        }

        let mut out = Record::new();
        if !self.excludes_id() {
            if let Some(id) = record.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (path, field) in &self.fields {
            let value = match field {
                ProjectField::Exclude => continue,
                ProjectField::Include => match path.lookup(record) {
                    Some(v) => v,
                    None => continue,
                },
                ProjectField::Slice(count) => match path.lookup(record) {
                    Some(Value::Array(items)) => Value::Array(slice_array(&items, *count)),
                    Some(other) => other,
                    None => continue,
                },
                ProjectField::Compute(expr) => expr.evaluate_or_null(record, path)?,
            };
            path.assign_each(&mut out, value)?;
        }
        Ok(out)
    }
}

/// First `count` elements, or the last `|count|` when negative
pub(crate) fn slice_array(items: &[Value], count: i64) -> Vec<Value> {
    let n = usize::try_from(count.unsigned_abs())
        .unwrap_or(usize::MAX)
        .min(items.len());
    if count < 0 {
        items[items.len() - n..].to_vec()
    } else {
        items[..n].to_vec()
    }
}

/// Slice an array field in place; non-array and missing fields are untouched
///
/// A path through an array of records slices the field in every element.
pub(crate) fn slice_field(record: &mut Record, path: &FieldPath, count: i64) {
    path.for_each_mut(record, |value| {
        if let Value::Array(items) = value {
            *items = slice_array(items, count);
        }
    });
}

/// Options for find queries
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub projection: Option<Projection>,

    /// Sort keys in priority order
    pub sort: Option<Vec<(FieldPath, SortDirection)>>,

    /// Limit: maximum number of records to return
    pub limit: Option<usize>,

    /// Skip: number of records to skip (for pagination)
    pub skip: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_sort(mut self, sort: Vec<(FieldPath, SortDirection)>) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Equivalent pipeline: match, sort, skip, limit, project
    pub fn to_stages(&self, filter: &Predicate) -> Vec<Stage> {
        let mut stages = vec![Stage::Match(filter.clone())];
        if let Some(sort) = self.sort.as_ref().filter(|s| !s.is_empty()) {
            stages.push(Stage::Sort(sort.clone()));
        }
        if let Some(skip) = self.skip {
            stages.push(Stage::Skip(i64::try_from(skip).unwrap_or(i64::MAX)));
        }
        if let Some(limit) = self.limit {
            stages.push(Stage::Limit(i64::try_from(limit).unwrap_or(i64::MAX)));
        }
        if let Some(projection) = self.projection.as_ref().filter(|p| !p.is_empty()) {
            stages.push(Stage::Project(projection.clone()));
        }
        stages
    }
}
