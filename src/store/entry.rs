//! Persisted entry layout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::value::DataType;
use crate::error::StoreResult;

/// Informational priority recorded with each entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  Low,
  #[default]
  Normal,
  High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
  pub data_type: DataType,
  pub encrypted: bool,
  /// Epoch millis
  pub created_at: i64,
  /// Lifetime in millis
  #[serde(default)]
  pub ttl: Option<u64>,
  #[serde(default)]
  pub priority: Priority,
  pub size: u64,
}

impl EntryMetadata {
  pub fn expires_at(&self) -> Option<i64> {
    self
      .ttl
      .map(|ttl| self.created_at.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)))
  }

  /// Expired once `now` is strictly past `created_at + ttl`.
  pub fn is_expired(&self, now: i64) -> bool {
    self.expires_at().is_some_and(|at| now > at)
  }
}

/// One stored key. When `metadata.encrypted` is set, `value` is a JSON
/// string holding an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
  pub value: Value,
  pub metadata: EntryMetadata,
}

impl StorageEntry {
  pub fn to_json(&self) -> StoreResult<String> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn from_json(raw: &str) -> StoreResult<Self> {
    Ok(serde_json::from_str(raw)?)
  }
}
