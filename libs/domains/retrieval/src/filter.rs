//! Metadata filtering for query post-processing
//!
//! A filter is a JSON object. Each top-level key is matched against the
//! record's metadata either by containment (the JSONB `@>` rule: objects
//! match as subsets, arrays must contain every filter element, scalars
//! compare equal) or, when the value is an object made only of `$`-keys,
//! by operators:
//!
//! ```text
//! {"department": "permits"}                    containment
//! {"tags": ["housing"]}                        array containment
//! {"id": {"$nin": ["a", "b"]}}                 exclusion
//! {"chunk_index": {"$in": [0, 1]}}             membership
//! {"reviewed": {"$exists": false}}             presence
//! ```

use serde_json::Value;

use crate::error::{RetrievalError, RetrievalResult};
use crate::models::Metadata;

#[derive(Debug, Clone, PartialEq)]
enum Operator {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Contains(Value),
    Ops(Vec<Operator>),
}

/// Parsed metadata filter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<(String, Condition)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a filter document
    pub fn from_value(value: Value) -> RetrievalResult<Self> {
        let Value::Object(map) = value else {
            return Err(RetrievalError::InvalidArgument(
                "Metadata filter must be a JSON object".to_string(),
            ));
        };

        let mut filter = Self::new();
        for (key, value) in map {
            let condition = match value {
                Value::Object(ref ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                    Condition::Ops(parse_operators(&key, ops)?)
                }
                other => Condition::Contains(other),
            };
            filter.conditions.push((key, condition));
        }
        Ok(filter)
    }

    /// Add a containment condition
    pub fn contains(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push((key.into(), Condition::Contains(value.into())));
        self
    }

    /// Exclude records whose `key` equals any of `values`
    pub fn not_in(mut self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions
            .push((key.into(), Condition::Ops(vec![Operator::Nin(values)])));
        self
    }

    /// Keep records whose `key` equals one of `values`
    pub fn one_of(mut self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions
            .push((key.into(), Condition::Ops(vec![Operator::In(values)])));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Check whether a record's metadata satisfies every condition
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.conditions.iter().all(|(key, condition)| {
            let field = metadata.get(key);
            match condition {
                Condition::Contains(expected) => {
                    field.is_some_and(|actual| contains(actual, expected))
                }
                Condition::Ops(ops) => ops.iter().all(|op| apply(op, field)),
            }
        })
    }
}

fn parse_operators(key: &str, ops: &serde_json::Map<String, Value>) -> RetrievalResult<Vec<Operator>> {
    ops.iter()
        .map(|(op, arg)| match op.as_str() {
            "$eq" => Ok(Operator::Eq(arg.clone())),
            "$ne" => Ok(Operator::Ne(arg.clone())),
            "$in" => list_arg(key, op, arg).map(Operator::In),
            "$nin" => list_arg(key, op, arg).map(Operator::Nin),
            "$exists" => arg.as_bool().map(Operator::Exists).ok_or_else(|| {
                RetrievalError::InvalidArgument(format!("'{}': $exists expects a boolean", key))
            }),
            other => Err(RetrievalError::InvalidArgument(format!(
                "'{}': unsupported filter operator {}",
                key, other
            ))),
        })
        .collect()
}

fn list_arg(key: &str, op: &str, arg: &Value) -> RetrievalResult<Vec<Value>> {
    arg.as_array().cloned().ok_or_else(|| {
        RetrievalError::InvalidArgument(format!("'{}': {} expects an array", key, op))
    })
}

fn apply(op: &Operator, field: Option<&Value>) -> bool {
    match op {
        Operator::Eq(expected) => field.is_some_and(|v| json_eq(v, expected)),
        Operator::Ne(expected) => !field.is_some_and(|v| json_eq(v, expected)),
        Operator::In(values) => field.is_some_and(|v| values.iter().any(|x| json_eq(v, x))),
        Operator::Nin(values) => !field.is_some_and(|v| values.iter().any(|x| json_eq(v, x))),
        Operator::Exists(wanted) => field.is_some() == *wanted,
    }
}

/// Equality with numeric normalisation (`42 == 42.0`)
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// JSONB-style containment: does `actual` contain `expected`?
fn contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| contains(a, v))),
        (Value::Array(actual), Value::Array(expected)) => expected
            .iter()
            .all(|e| actual.iter().any(|a| contains(a, e))),
        // a scalar filter value matches an array holding it
        (Value::Array(actual), scalar) if !scalar.is_object() => {
            actual.iter().any(|a| json_eq(a, scalar))
        }
        _ => json_eq(actual, expected),
    }
}
