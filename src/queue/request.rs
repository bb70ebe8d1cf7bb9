use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::ApiRequest;

/// A request waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
  pub id: Uuid,
  #[serde(flatten)]
  pub request: ApiRequest,
  /// Epoch millis when queued
  pub timestamp: i64,
  /// Failed delivery attempts so far
  pub retry_count: u32,
}

impl QueuedRequest {
  pub fn new(request: ApiRequest, timestamp: i64) -> Self {
    Self {
      id: Uuid::new_v4(),
      request,
      timestamp,
      retry_count: 0,
    }
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
  /// Entries discarded after exhausting their retries
  pub dropped: usize,
  pub remaining: usize,
  /// Another drain was already running; nothing was done.
  pub skipped: bool,
}

impl DrainReport {
  pub(crate) fn skipped(remaining: usize) -> Self {
    Self {
      remaining,
      skipped: true,
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
  Queued { id: Uuid },
  /// Pushed out by the size bound
  Evicted { id: Uuid },
  Delivered { id: Uuid },
  Retried { id: Uuid, retry_count: u32 },
  Dropped { id: Uuid },
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn request_fields_are_flattened() {
    let queued = QueuedRequest::new(ApiRequest::post("/watchlist", json!({"id": 7})), 1_000);
    let raw = serde_json::to_value(&queued).unwrap();
    assert_eq!(raw["method"], json!("POST"));
    assert_eq!(raw["url"], json!("/watchlist"));
    assert_eq!(raw["body"], json!({"id": 7}));
    assert_eq!(raw["retryCount"], json!(0));
    assert_eq!(raw["timestamp"], json!(1_000));

    let back: QueuedRequest = serde_json::from_value(raw).unwrap();
    assert_eq!(back, queued);
  }
}
