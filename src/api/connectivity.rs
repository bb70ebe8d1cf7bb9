//! Network reachability.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::error::{ApiError, ApiResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Answers whether the API is reachable and publishes changes.
#[async_trait]
pub trait Connectivity: Send + Sync {
  /// Check now and publish the result.
  async fn probe(&self) -> bool;

  /// Receives every published status.
  fn subscribe(&self) -> watch::Receiver<bool>;

  /// Last published status, without probing.
  fn is_online(&self) -> bool {
    *self.subscribe().borrow()
  }
}

/// Probes by sending `HEAD` to the API base URL. Any HTTP answer, whatever
/// its status, counts as online.
pub struct HttpConnectivity {
  client: reqwest::Client,
  url: Url,
  status: watch::Sender<bool>,
}

impl HttpConnectivity {
  pub fn new(base_url: &str) -> ApiResult<Self> {
    let url =
      Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    let client = reqwest::Client::builder()
      .timeout(PROBE_TIMEOUT)
      .build()
      .map_err(|e| ApiError::Transport(format!("Failed to build HTTP client: {}", e)))?;
    let (status, _) = watch::channel(true);
    Ok(Self {
      client,
      url,
      status,
    })
  }
}

#[async_trait]
impl Connectivity for HttpConnectivity {
  async fn probe(&self) -> bool {
    let online = match self.client.head(self.url.clone()).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(error = %e, "Connectivity probe failed");
        false
      }
    };
    self.status.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
    online
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.status.subscribe()
  }
}

/// Connectivity switched by hand, for embedding and tests.
pub struct ManualConnectivity {
  status: watch::Sender<bool>,
}

impl ManualConnectivity {
  pub fn new(online: bool) -> Self {
    let (status, _) = watch::channel(online);
    Self { status }
  }

  pub fn set_online(&self, online: bool) {
    self.status.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
  }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
  async fn probe(&self) -> bool {
    *self.status.borrow()
  }

  fn subscribe(&self) -> watch::Receiver<bool> {
    self.status.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn manual_connectivity_publishes_changes() {
    let connectivity = ManualConnectivity::new(false);
    let mut rx = connectivity.subscribe();
    assert!(!connectivity.probe().await);

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow());
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn unchanged_status_is_not_republished() {
    let connectivity = ManualConnectivity::new(true);
    let rx = connectivity.subscribe();
    connectivity.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }

  #[tokio::test]
  async fn unreachable_host_is_offline() {
    // Port 9 on localhost is not expected to accept connections.
    let connectivity = HttpConnectivity::new("http://127.0.0.1:9/").unwrap();
    assert!(!connectivity.probe().await);
    assert!(!connectivity.is_online());
  }
}
