// src/aggregation.rs
// Aggregation pipeline implementation

use std::cmp::Ordering;

use ahash::AHashMap;
use serde_json::Value as JsonValue;

use crate::error::{QueryError, Result};
use crate::expr::{checked_add, Expr};
use crate::find_options::{slice_field, Projection};
use crate::path::FieldPath;
use crate::query::Predicate;
use crate::value::{canonical_key, total_cmp, Record, Value};
use crate::{log_debug, log_trace, log_warn};

/// Lazily evaluated record stream flowing between stages
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record>> + 'a>;

const STAGE_NAMES: [&str; 9] = [
    "$addFields",
    "$set",
    "$match",
    "$group",
    "$project",
    "$sort",
    "$limit",
    "$skip",
    "$slice",
];

/// Pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    /// New fields, each evaluated against the incoming record
    AddFields(Vec<(FieldPath, Expr)>),
    Match(Predicate),
    Group(GroupStage),
    Project(Projection),
    Sort(Vec<(FieldPath, SortDirection)>),
    Limit(i64),
    Skip(i64),
    /// Keep the first `count` (or last `|count|`) elements of an array field
    Slice { field: FieldPath, count: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// $group stage - partition by key and accumulate per partition
#[derive(Debug, Clone)]
pub struct GroupStage {
    key: Expr,
    accumulators: Vec<(String, Accumulator)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Avg(Expr),
    Sum(Expr),
    Count,
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Push(Expr),
}

/// Running state of one accumulator within one group
#[derive(Debug)]
enum AccumulatorState {
    Avg { total: f64, count: usize },
    Sum(Value),
    Count(i64),
    Min(Option<Value>),
    Max(Option<Value>),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
}

/// Aggregation pipeline
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

/// Executor state: stages left to apply over a stream, or the final records
enum ExecState<'a> {
    Ready { next: usize, stream: RecordStream<'a> },
    Done(Vec<Record>),
}

// ============================================================================
// STAGES
// ============================================================================

impl Stage {
    pub fn add_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: AsRef<str>,
    {
        Stage::AddFields(
            fields
                .into_iter()
                .map(|(name, expr)| (FieldPath::from(name.as_ref()), expr))
                .collect(),
        )
    }

    pub fn sort<S: AsRef<str>>(keys: Vec<(S, SortDirection)>) -> Self {
        Stage::Sort(
            keys.into_iter()
                .map(|(field, dir)| (FieldPath::from(field.as_ref()), dir))
                .collect(),
        )
    }

    pub fn slice(field: &str, count: i64) -> Self {
        Stage::Slice {
            field: FieldPath::from(field),
            count,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::AddFields(_) => "$addFields",
            Stage::Match(_) => "$match",
            Stage::Group(_) => "$group",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Slice { .. } => "$slice",
        }
    }

    /// Check stage parameters; run for every stage before any record is read
    pub fn validate(&self) -> Result<()> {
        match self {
            Stage::Limit(n) if *n < 0 => Err(QueryError::Config(format!(
                "$limit must be non-negative, got {}",
                n
            ))),
            Stage::Skip(n) if *n < 0 => Err(QueryError::Config(format!(
                "$skip must be non-negative, got {}",
                n
            ))),
            Stage::Sort(keys) if keys.is_empty() => Err(QueryError::Config(
                "$sort requires at least one key".to_string(),
            )),
            Stage::Project(projection) => projection.validate(),
            Stage::Group(group) => group.validate(),
            _ => Ok(()),
        }
    }

    /// Parse a single `{"$stage": spec}` document
    pub fn from_json(stage_json: &JsonValue) -> Result<Self> {
        let obj = stage_json
            .as_object()
            .ok_or_else(|| QueryError::InvalidQuery("Stage must be an object".to_string()))?;

        let (stage_name, spec) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => {
                return Err(QueryError::InvalidQuery(
                    "Each stage must have exactly one operator".to_string(),
                ))
            }
        };

        match stage_name.as_str() {
            "$addFields" | "$set" => {
                let fields = spec.as_object().ok_or_else(|| {
                    QueryError::InvalidQuery(format!("{} must be an object", stage_name))
                })?;
                let mut parsed = Vec::with_capacity(fields.len());
                for (name, expr) in fields {
                    parsed.push((FieldPath::parse(name)?, Expr::from_json(expr)?));
                }
                Ok(Stage::AddFields(parsed))
            }
            "$match" => Ok(Stage::Match(Predicate::from_json(spec)?)),
            "$group" => Ok(Stage::Group(GroupStage::from_json(spec)?)),
            "$project" => Ok(Stage::Project(Projection::from_json(spec)?)),
            "$sort" => Ok(Stage::Sort(parse_sort(spec)?)),
            "$limit" => Ok(Stage::Limit(integer_param("$limit", spec)?)),
            "$skip" => Ok(Stage::Skip(integer_param("$skip", spec)?)),
            "$slice" => match spec.as_object().map(|m| (m.len(), m.iter().next())) {
                Some((1, Some((field, count)))) => Ok(Stage::Slice {
                    field: FieldPath::parse(field)?,
                    count: integer_param("$slice", count)?,
                }),
                _ => Err(QueryError::InvalidQuery(
                    "$slice takes a single {field: count}".to_string(),
                )),
            },
            _ => Err(QueryError::UnknownOperator(stage_name.clone())),
        }
    }

    /// Wrap the upstream stream with this stage
    fn apply<'a>(&'a self, index: usize, input: RecordStream<'a>) -> Result<RecordStream<'a>> {
        let name = self.name();
        let located = move |record: usize| move |err: QueryError| err.at_stage(index, name, Some(record));

        Ok(match self {
            Stage::AddFields(fields) => Box::new(input.enumerate().map(move |(i, item)| {
                item.and_then(|record| add_fields(fields, record).map_err(located(i)))
            })),
            Stage::Match(predicate) => Box::new(input.filter(move |item| match item {
                Ok(record) => predicate.matches(record),
                Err(_) => true,
            })),
            Stage::Project(projection) => Box::new(input.enumerate().map(move |(i, item)| {
                item.and_then(|record| projection.apply(&record).map_err(located(i)))
            })),
            Stage::Slice { field, count } => Box::new(input.map(move |item| {
                item.map(|mut record| {
                    slice_field(&mut record, field, *count);
                    record
                })
            })),
            Stage::Limit(n) => Box::new(input.take(usize::try_from(*n).unwrap_or(0))),
            Stage::Skip(n) => {
                let mut remaining = usize::try_from(*n).unwrap_or(0);
                // Upstream errors are never skipped
                Box::new(input.filter(move |item| {
                    if item.is_ok() && remaining > 0 {
                        remaining -= 1;
                        false
                    } else {
                        true
                    }
                }))
            }
            Stage::Group(group) => {
                let records = input.collect::<Result<Vec<_>>>()?;
                Box::new(group.execute(index, records)?.into_iter().map(Ok))
            }
            Stage::Sort(keys) => {
                let records = input.collect::<Result<Vec<_>>>()?;
                Box::new(sort_records(records, keys).into_iter().map(Ok))
            }
        })
    }
}

fn integer_param(stage: &str, spec: &JsonValue) -> Result<i64> {
    spec.as_i64()
        .ok_or_else(|| QueryError::InvalidQuery(format!("{} requires an integer, got {}", stage, spec)))
}

/// Parse `{"field": 1, "other": -1}` into sort keys
pub fn parse_sort(spec: &JsonValue) -> Result<Vec<(FieldPath, SortDirection)>> {
    let obj = spec
        .as_object()
        .ok_or_else(|| QueryError::InvalidQuery("$sort must be an object".to_string()))?;

    let mut keys = Vec::with_capacity(obj.len());
    for (field, value) in obj {
        let direction = match value.as_i64() {
            Some(1) => SortDirection::Ascending,
            Some(-1) => SortDirection::Descending,
            _ => {
                return Err(QueryError::Config(format!(
                    "Sort direction for '{}' must be 1 or -1",
                    field
                )))
            }
        };
        keys.push((FieldPath::parse(field)?, direction));
    }
    Ok(keys)
}

fn add_fields(fields: &[(FieldPath, Expr)], record: Record) -> Result<Record> {
    // Every expression sees the incoming record, not fields added alongside it
    let mut computed = Vec::with_capacity(fields.len());
    for (path, expr) in fields {
        computed.push((path, expr.evaluate_or_null(&record, path)?));
    }

    let mut out = record;
    for (path, value) in computed {
        path.assign_each(&mut out, value)?;
    }
    Ok(out)
}

/// Stable multi-key sort; missing fields sort as Null
fn sort_records(records: Vec<Record>, keys: &[(FieldPath, SortDirection)]) -> Vec<Record> {
    let mut keyed: Vec<(Vec<Value>, Record)> = records
        .into_iter()
        .map(|record| {
            let values = keys.iter().map(|(path, _)| path.resolve(&record)).collect();
            (values, record)
        })
        .collect();

    keyed.sort_by(|(a, _), (b, _)| {
        for ((left, right), (_, direction)) in a.iter().zip(b.iter()).zip(keys) {
            let cmp = match direction {
                SortDirection::Ascending => total_cmp(left, right),
                SortDirection::Descending => total_cmp(right, left),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    });

    keyed.into_iter().map(|(_, record)| record).collect()
}

// ============================================================================
// GROUP
// ============================================================================

impl GroupStage {
    pub fn new(key: Expr) -> Self {
        GroupStage {
            key,
            accumulators: Vec::new(),
        }
    }

    pub fn accumulate(mut self, name: &str, accumulator: Accumulator) -> Self {
        self.accumulators.push((name.to_string(), accumulator));
        self
    }

    fn validate(&self) -> Result<()> {
        for (i, (name, _)) in self.accumulators.iter().enumerate() {
            if name.is_empty() || name == "_id" || name.contains('.') {
                return Err(QueryError::Config(format!(
                    "Invalid $group output field '{}'",
                    name
                )));
            }
            if self.accumulators[..i].iter().any(|(other, _)| other == name) {
                return Err(QueryError::Config(format!(
                    "Duplicate $group output field '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| QueryError::InvalidQuery("$group must be an object".to_string()))?;

        let key = obj
            .get("_id")
            .ok_or_else(|| QueryError::InvalidQuery("Group stage must have _id field".to_string()))?;

        let mut group = GroupStage::new(Expr::from_json(key)?);
        for (field, value) in obj {
            if field == "_id" {
                continue; // Already parsed
            }
            group = group.accumulate(field, Accumulator::from_json(value)?);
        }
        Ok(group)
    }

    /// Partition by key (first-seen order) and fold each partition
    fn execute(&self, index: usize, records: Vec<Record>) -> Result<Vec<Record>> {
        let key_field = FieldPath::from("_id");
        let mut slots: AHashMap<String, usize> = AHashMap::new();
        let mut groups: Vec<(Value, Vec<AccumulatorState>)> = Vec::new();

        for (i, record) in records.iter().enumerate() {
            let key = self
                .key
                .evaluate_or_null(record, &key_field)
                .map_err(|e| e.at_stage(index, "$group", Some(i)))?;

            let slot = *slots.entry(canonical_key(&key)).or_insert_with(|| {
                groups.push((key, self.accumulators.iter().map(|(_, a)| a.initial_state()).collect()));
                groups.len() - 1
            });

            for ((name, accumulator), state) in self.accumulators.iter().zip(groups[slot].1.iter_mut()) {
                let value = match accumulator.input() {
                    Some(expr) => match expr.evaluate(record) {
                        Ok(v) => v,
                        Err(err) if err.is_recoverable() => {
                            log_warn!("Accumulator '{}' ignored record {}: {}", name, i, err);
                            continue;
                        }
                        Err(err) => return Err(err.at_stage(index, "$group", Some(i))),
                    },
                    None => Value::Null,
                };
                state.update(value);
            }
        }

        log_trace!("$group produced {} groups from {} records", groups.len(), records.len());

        Ok(groups
            .into_iter()
            .map(|(key, states)| {
                let mut out = Record::new();
                out.insert("_id".to_string(), key);
                for ((name, _), state) in self.accumulators.iter().zip(states) {
                    out.insert(name.clone(), state.finish());
                }
                out
            })
            .collect())
    }
}

impl Accumulator {
    fn from_json(spec: &JsonValue) -> Result<Self> {
        let obj = spec
            .as_object()
            .ok_or_else(|| QueryError::InvalidQuery("Accumulator must be an object".to_string()))?;

        let (op, value) = match obj.iter().next() {
            Some(entry) if obj.len() == 1 => entry,
            _ => {
                return Err(QueryError::InvalidQuery(
                    "Accumulator must have exactly one operator".to_string(),
                ))
            }
        };

        match op.as_str() {
            "$count" => Ok(Accumulator::Count),
            "$sum" => Ok(Accumulator::Sum(Expr::from_json(value)?)),
            "$avg" => Ok(Accumulator::Avg(Expr::from_json(value)?)),
            "$min" => Ok(Accumulator::Min(Expr::from_json(value)?)),
            "$max" => Ok(Accumulator::Max(Expr::from_json(value)?)),
            "$first" => Ok(Accumulator::First(Expr::from_json(value)?)),
            "$last" => Ok(Accumulator::Last(Expr::from_json(value)?)),
            "$push" => Ok(Accumulator::Push(Expr::from_json(value)?)),
            _ => Err(QueryError::UnknownOperator(op.clone())),
        }
    }

    fn input(&self) -> Option<&Expr> {
        match self {
            Accumulator::Count => None,
            Accumulator::Avg(e)
            | Accumulator::Sum(e)
            | Accumulator::Min(e)
            | Accumulator::Max(e)
            | Accumulator::First(e)
            | Accumulator::Last(e)
            | Accumulator::Push(e) => Some(e),
        }
    }

    fn initial_state(&self) -> AccumulatorState {
        match self {
            Accumulator::Avg(_) => AccumulatorState::Avg { total: 0.0, count: 0 },
            Accumulator::Sum(_) => AccumulatorState::Sum(Value::Int(0)),
            Accumulator::Count => AccumulatorState::Count(0),
            Accumulator::Min(_) => AccumulatorState::Min(None),
            Accumulator::Max(_) => AccumulatorState::Max(None),
            Accumulator::First(_) => AccumulatorState::First(None),
            Accumulator::Last(_) => AccumulatorState::Last(Value::Null),
            Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
        }
    }
}

impl AccumulatorState {
    fn update(&mut self, value: Value) {
        match self {
            // Non-numeric inputs are skipped by avg and sum
            AccumulatorState::Avg { total, count } => {
                if let Some(n) = value.as_f64() {
                    *total += n;
                    *count += 1;
                }
            }
            AccumulatorState::Sum(acc) => {
                if value.is_number() {
                    *acc = checked_add(acc, &value);
                }
            }
            AccumulatorState::Count(n) => *n += 1,
            AccumulatorState::Min(best) => keep_extremum(best, value, Ordering::Less),
            AccumulatorState::Max(best) => keep_extremum(best, value, Ordering::Greater),
            AccumulatorState::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            AccumulatorState::Last(last) => *last = value,
            AccumulatorState::Push(items) => items.push(value),
        }
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Avg { count: 0, .. } => Value::Null,
            AccumulatorState::Avg { total, count } => Value::Float(total / count as f64),
            AccumulatorState::Sum(v) => v,
            AccumulatorState::Count(n) => Value::Int(n),
            AccumulatorState::Min(v) | AccumulatorState::Max(v) | AccumulatorState::First(v) => {
                v.unwrap_or(Value::Null)
            }
            AccumulatorState::Last(v) => v,
            AccumulatorState::Push(items) => Value::Array(items),
        }
    }
}

fn keep_extremum(best: &mut Option<Value>, value: Value, wins: Ordering) {
    if value.is_null() {
        return;
    }
    let replace = match best {
        Some(current) => total_cmp(&value, current) == wins,
        None => true,
    };
    if replace {
        *best = Some(value);
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

impl Pipeline {
    /// Build a pipeline, validating every stage before anything runs
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        for (index, stage) in stages.iter().enumerate() {
            stage
                .validate()
                .map_err(|e| e.at_stage(index, stage.name(), None))?;
        }
        Ok(Pipeline { stages })
    }

    /// Create pipeline from JSON array
    pub fn from_json(pipeline_json: &JsonValue) -> Result<Self> {
        let stages_array = pipeline_json
            .as_array()
            .ok_or_else(|| QueryError::InvalidQuery("Pipeline must be an array".to_string()))?;

        let mut stages = Vec::with_capacity(stages_array.len());
        for (index, stage_json) in stages_array.iter().enumerate() {
            let stage = Stage::from_json(stage_json)
                .map_err(|e| e.at_stage(index, stage_label(stage_json), None))?;
            stages.push(stage);
        }

        Pipeline::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Execute pipeline on records
    pub fn execute(&self, records: Vec<Record>) -> Result<Vec<Record>> {
        self.execute_iter(records)
    }

    /// Execute pipeline over any record source
    ///
    /// Stages are chained lazily; `$group` and `$sort` drain their upstream
    /// when reached. The first failure stops the run and carries the stage
    /// index (and record position when one was involved).
    pub fn execute_iter<'a, I>(&'a self, records: I) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = Record>,
        I::IntoIter: 'a,
    {
        log_debug!("Executing pipeline with {} stages", self.stages.len());

        let mut state = ExecState::Ready {
            next: 0,
            stream: Box::new(records.into_iter().map(Ok)),
        };

        loop {
            state = match state {
                ExecState::Ready { next, stream } => match self.stages.get(next) {
                    Some(stage) => ExecState::Ready {
                        next: next + 1,
                        stream: stage.apply(next, stream)?,
                    },
                    None => ExecState::Done(stream.collect::<Result<Vec<_>>>()?),
                },
                ExecState::Done(records) => return Ok(records),
            };
        }
    }
}

fn stage_label(stage_json: &JsonValue) -> &'static str {
    stage_json
        .as_object()
        .and_then(|obj| obj.keys().next())
        .and_then(|key| STAGE_NAMES.iter().find(|name| **name == key.as_str()))
        .copied()
        .unwrap_or("$unknown")
}

// ============================================================================
// TESTS
// ============================================================================
