use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::FactGatheringError;

/// Recursive value produced by gatherers. Serializes pointwise to JSON:
/// integers, floats, booleans, strings, arrays and objects. Objects keep the
/// insertion order of their keys.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    List(Vec<FactValue>),
    Map(IndexMap<String, FactValue>),
}

impl FactValue {
    /// Resolves a dotted path below this value, see [`get_value`].
    pub fn get(&self, path: &str) -> Result<&FactValue, FactGatheringError> {
        get_value(self, path)
    }
}

impl From<i64> for FactValue {
    fn from(value: i64) -> Self {
        FactValue::Int(value)
    }
}

impl From<f64> for FactValue {
    fn from(value: f64) -> Self {
        FactValue::Float(value)
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        FactValue::Bool(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        FactValue::String(value.to_owned())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        FactValue::String(value)
    }
}

impl From<Vec<FactValue>> for FactValue {
    fn from(value: Vec<FactValue>) -> Self {
        FactValue::List(value)
    }
}

impl From<IndexMap<String, FactValue>> for FactValue {
    fn from(value: IndexMap<String, FactValue>) -> Self {
        FactValue::Map(value)
    }
}

impl TryFrom<serde_json::Value> for FactValue {
    type Error = FactGatheringError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match value {
            Value::Null => Err(FactGatheringError::parse("null is not a valid fact value")),
            Value::Bool(b) => Ok(FactValue::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(FactValue::Int(i)),
                None => n
                    .as_f64()
                    .map(FactValue::Float)
                    .ok_or_else(|| FactGatheringError::parse(format!("invalid number {}", n))),
            },
            Value::String(s) => Ok(FactValue::String(s)),
            Value::Array(items) => items
                .into_iter()
                .map(FactValue::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(FactValue::List),
            Value::Object(entries) => entries
                .into_iter()
                .map(|(key, value)| FactValue::try_from(value).map(|v| (key, v)))
                .collect::<Result<IndexMap<_, _>, _>>()
                .map(FactValue::Map),
        }
    }
}

/// Interprets a raw string: integer first, then a case-insensitive boolean,
/// then a finite float, otherwise the string itself.
pub fn parse_string_to_value(raw: &str) -> FactValue {
    if let Ok(int) = raw.parse::<i64>() {
        return FactValue::Int(int);
    }

    if raw.eq_ignore_ascii_case("true") {
        return FactValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return FactValue::Bool(false);
    }

    match raw.parse::<f64>() {
        Ok(float) if float.is_finite() => FactValue::Float(float),
        _ => FactValue::String(raw.to_owned()),
    }
}

/// Walks `path` (dot separated) below `root`. Map nodes are indexed by key,
/// list nodes by integer position. An empty path yields `root`.
pub fn get_value<'a>(root: &'a FactValue, path: &str) -> Result<&'a FactValue, FactGatheringError> {
    if path.is_empty() {
        return Ok(root);
    }

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            FactValue::Map(entries) => entries.get(segment).ok_or_else(|| {
                FactGatheringError::value_not_found(format!(
                    "requested field value not found: {}",
                    segment
                ))
            })?,
            FactValue::List(items) => {
                let index = segment.parse::<usize>().map_err(|_| {
                    FactGatheringError::value_not_found(format!(
                        "invalid list index {} in path {}",
                        segment, path
                    ))
                })?;
                items.get(index).ok_or_else(|| {
                    FactGatheringError::value_not_found(format!(
                        "list index {} out of range in path {}, list has {} elements",
                        index,
                        path,
                        items.len()
                    ))
                })?
            }
            _ => {
                return Err(FactGatheringError::value_not_found(format!(
                    "requested field value not found: {}, {} is a scalar value",
                    path, segment
                )))
            }
        };
    }

    Ok(current)
}
