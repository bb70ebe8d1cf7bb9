//! Typed values accepted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::{StoreError, StoreResult};

/// Semantic type recorded next to every stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  String,
  Number,
  Boolean,
  Object,
  Array,
  Date,
}

impl DataType {
  pub fn as_str(&self) -> &'static str {
    match self {
      DataType::String => "string",
      DataType::Number => "number",
      DataType::Boolean => "boolean",
      DataType::Object => "object",
      DataType::Array => "array",
      DataType::Date => "date",
    }
  }
}

/// A value as the caller sees it. Dates are persisted as epoch millis and
/// restored as dates.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreValue {
  String(String),
  Number(f64),
  Boolean(bool),
  Object(Map<String, Value>),
  Array(Vec<Value>),
  Date(DateTime<Utc>),
}

impl StoreValue {
  pub fn data_type(&self) -> DataType {
    match self {
      StoreValue::String(_) => DataType::String,
      StoreValue::Number(_) => DataType::Number,
      StoreValue::Boolean(_) => DataType::Boolean,
      StoreValue::Object(_) => DataType::Object,
      StoreValue::Array(_) => DataType::Array,
      StoreValue::Date(_) => DataType::Date,
    }
  }

  /// JSON form written to storage.
  pub fn to_json(&self) -> StoreResult<Value> {
    Ok(match self {
      StoreValue::String(s) => Value::String(s.clone()),
      StoreValue::Number(n) => Value::Number(
        Number::from_f64(*n)
          .ok_or_else(|| StoreError::UnsupportedValue(format!("non-finite number {}", n)))?,
      ),
      StoreValue::Boolean(b) => Value::Bool(*b),
      StoreValue::Object(map) => Value::Object(map.clone()),
      StoreValue::Array(items) => Value::Array(items.clone()),
      StoreValue::Date(date) => Value::Number(date.timestamp_millis().into()),
    })
  }

  /// Classify an arbitrary JSON value. `null` has no stored representation.
  pub fn from_json(value: Value) -> StoreResult<Self> {
    match value {
      Value::Null => Err(StoreError::UnsupportedValue("null".to_string())),
      Value::Bool(b) => Ok(StoreValue::Boolean(b)),
      Value::Number(n) => n
        .as_f64()
        .map(StoreValue::Number)
        .ok_or_else(|| StoreError::UnsupportedValue(format!("number {}", n))),
      Value::String(s) => Ok(StoreValue::String(s)),
      Value::Array(items) => Ok(StoreValue::Array(items)),
      Value::Object(map) => Ok(StoreValue::Object(map)),
    }
  }

  /// Rebuild the caller's value from its stored JSON and recorded type.
  pub(crate) fn restore(value: Value, data_type: DataType) -> StoreResult<Self> {
    let mismatch = |found: &Value| StoreError::TypeMismatch {
      expected: data_type.as_str(),
      found: json_kind(found),
    };

    match data_type {
      DataType::String => match value {
        Value::String(s) => Ok(StoreValue::String(s)),
        other => Ok(StoreValue::String(other.to_string())),
      },
      DataType::Number => match &value {
        Value::Number(n) => n.as_f64().map(StoreValue::Number).ok_or_else(|| mismatch(&value)),
        Value::String(s) => s
          .trim()
          .parse::<f64>()
          .map(StoreValue::Number)
          .map_err(|_| mismatch(&value)),
        _ => Err(mismatch(&value)),
      },
      DataType::Boolean => match value {
        Value::Bool(b) => Ok(StoreValue::Boolean(b)),
        other => Err(mismatch(&other)),
      },
      DataType::Date => {
        let millis = match &value {
          Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
          Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.timestamp_millis()),
          _ => None,
        };
        millis
          .and_then(DateTime::from_timestamp_millis)
          .map(StoreValue::Date)
          .ok_or_else(|| mismatch(&value))
      }
      DataType::Object => match value {
        Value::Object(map) => Ok(StoreValue::Object(map)),
        other => Err(mismatch(&other)),
      },
      DataType::Array => match value {
        Value::Array(items) => Ok(StoreValue::Array(items)),
        other => Err(mismatch(&other)),
      },
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      StoreValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      StoreValue::Number(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      StoreValue::Boolean(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_date(&self) -> Option<DateTime<Utc>> {
    match self {
      StoreValue::Date(d) => Some(*d),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&Map<String, Value>> {
    match self {
      StoreValue::Object(map) => Some(map),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[Value]> {
    match self {
      StoreValue::Array(items) => Some(items),
      _ => None,
    }
  }
}

/// Approximate footprint of a stored value: UTF-16 strings at 2 bytes per
/// unit, numbers as 64-bit floats, booleans as one byte.
pub(crate) fn stored_size(value: &Value) -> u64 {
  match value {
    Value::String(s) => s.encode_utf16().count() as u64 * 2,
    Value::Number(_) => 8,
    Value::Bool(_) => 1,
    other => other.to_string().encode_utf16().count() as u64 * 2,
  }
}

fn json_kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

impl From<&str> for StoreValue {
  fn from(s: &str) -> Self {
    StoreValue::String(s.to_string())
  }
}

impl From<String> for StoreValue {
  fn from(s: String) -> Self {
    StoreValue::String(s)
  }
}

impl From<f64> for StoreValue {
  fn from(n: f64) -> Self {
    StoreValue::Number(n)
  }
}

impl From<i64> for StoreValue {
  fn from(n: i64) -> Self {
    StoreValue::Number(n as f64)
  }
}

impl From<i32> for StoreValue {
  fn from(n: i32) -> Self {
    StoreValue::Number(f64::from(n))
  }
}

impl From<u32> for StoreValue {
  fn from(n: u32) -> Self {
    StoreValue::Number(f64::from(n))
  }
}

impl From<bool> for StoreValue {
  fn from(b: bool) -> Self {
    StoreValue::Boolean(b)
  }
}

impl From<DateTime<Utc>> for StoreValue {
  fn from(d: DateTime<Utc>) -> Self {
    StoreValue::Date(d)
  }
}

impl From<Map<String, Value>> for StoreValue {
  fn from(map: Map<String, Value>) -> Self {
    StoreValue::Object(map)
  }
}

impl From<Vec<Value>> for StoreValue {
  fn from(items: Vec<Value>) -> Self {
    StoreValue::Array(items)
  }
}

impl TryFrom<Value> for StoreValue {
  type Error = StoreError;

  fn try_from(value: Value) -> Result<Self, Self::Error> {
    StoreValue::from_json(value)
  }
}
