//! API client with offline queueing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connectivity::{Connectivity, HttpConnectivity};
use super::transport::{HttpTransport, RequestSender};
use super::types::{ApiEvent, ApiRequest, ApiResponse, ClientStats, HttpMethod};
use crate::config::{ApiConfig, Config, QueueConfig};
use crate::error::{ApiError, ApiResult};
use crate::queue::{DrainReport, RequestQueue};
use crate::store::{KvBackend, LocalStore, SetOptions, StoreValue};

/// Store key of the bearer token attached to requests.
pub const AUTH_TOKEN_KEY: &str = "auth_token";
/// Store key of the token exchanged for a new bearer token on 401.
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

const REFRESH_ENDPOINT: &str = "/auth/refresh";
const REQUEST_ID_HEADER: &str = "X-Request-ID";
const REQUEST_TIMESTAMP_HEADER: &str = "X-Request-Timestamp";
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSettings {
  /// Resends allowed after a 429
  pub max_rate_limit_retries: u32,
  /// Wait used when a 429 carries no usable `Retry-After`
  pub default_retry_after: Duration,
  /// Period of the background queue drain
  pub drain_interval: Duration,
}

impl Default for ClientSettings {
  fn default() -> Self {
    Self {
      max_rate_limit_retries: 3,
      default_retry_after: Duration::from_secs(5),
      drain_interval: Duration::from_secs(30),
    }
  }
}

impl ClientSettings {
  pub fn from_config(api: &ApiConfig, queue: &QueueConfig) -> Self {
    Self {
      max_rate_limit_retries: api.max_rate_limit_retries,
      default_retry_after: Duration::from_secs(api.default_retry_after_secs),
      drain_interval: queue.drain_interval(),
    }
  }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
  #[serde(default)]
  success: bool,
  token: Option<String>,
}

/// Sends API requests, queueing them while offline.
///
/// Requests made without connectivity are stored in the `RequestQueue` and
/// replayed by `process_queue`, either on demand or from the task started
/// by `spawn_background`.
pub struct ApiClient<B: KvBackend> {
  transport: Arc<dyn RequestSender>,
  connectivity: Arc<dyn Connectivity>,
  store: LocalStore<B>,
  queue: Arc<RequestQueue<B>>,
  settings: ClientSettings,
  static_token: Option<String>,
  last_checked: Arc<AtomicI64>,
  events: broadcast::Sender<ApiEvent>,
}

impl<B: KvBackend> Clone for ApiClient<B> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      connectivity: Arc::clone(&self.connectivity),
      store: self.store.clone(),
      queue: Arc::clone(&self.queue),
      settings: self.settings,
      static_token: self.static_token.clone(),
      last_checked: Arc::clone(&self.last_checked),
      events: self.events.clone(),
    }
  }
}

impl<B: KvBackend> ApiClient<B> {
  pub fn new(
    store: LocalStore<B>,
    queue: Arc<RequestQueue<B>>,
    transport: Arc<dyn RequestSender>,
    connectivity: Arc<dyn Connectivity>,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      transport,
      connectivity,
      store,
      queue,
      settings: ClientSettings::default(),
      static_token: None,
      last_checked: Arc::new(AtomicI64::new(0)),
      events,
    }
  }

  /// Client over reqwest using `config`. `NEXUS_API_TOKEN`, when set, is
  /// used whenever the store holds no auth token.
  pub fn http(
    store: LocalStore<B>,
    queue: Arc<RequestQueue<B>>,
    config: &Config,
  ) -> ApiResult<Self> {
    let transport = HttpTransport::new(&config.api)?;
    let connectivity = HttpConnectivity::new(&config.api.base_url)?;
    Ok(
      Self::new(store, queue, Arc::new(transport), Arc::new(connectivity))
        .with_settings(ClientSettings::from_config(&config.api, &config.queue))
        .with_static_token(Config::api_token_from_env()),
    )
  }

  pub fn with_settings(mut self, settings: ClientSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_static_token(mut self, token: Option<String>) -> Self {
    self.static_token = token;
    self
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ApiEvent> {
    self.events.subscribe()
  }

  pub fn queue(&self) -> &Arc<RequestQueue<B>> {
    &self.queue
  }

  /// Probe connectivity now and record when it happened.
  pub async fn check_network(&self) -> bool {
    let online = self.connectivity.probe().await;
    self
      .last_checked
      .store(self.store.clock().now_millis(), Ordering::SeqCst);
    online
  }

  /// Send `request`, or queue it when the network is unavailable.
  pub async fn request(&self, request: ApiRequest) -> ApiResult<ApiResponse> {
    if !self.check_network().await {
      return Err(self.defer(request));
    }

    match self.dispatch(&request).await {
      Ok(response) => {
        self.emit(ApiEvent::RequestSucceeded {
          method: request.method,
          url: request.url.clone(),
          status: response.status,
        });
        Ok(response)
      }
      Err(ApiError::Transport(message)) => {
        if !self.check_network().await {
          return Err(self.defer(request));
        }
        self.report_failure(&request, &message);
        Err(ApiError::Transport(message))
      }
      Err(e) => {
        self.report_failure(&request, &e.to_string());
        Err(e)
      }
    }
  }

  pub async fn get(&self, endpoint: &str) -> ApiResult<ApiResponse> {
    self.request(ApiRequest::get(endpoint)).await
  }

  pub async fn post(&self, endpoint: &str, body: Value) -> ApiResult<ApiResponse> {
    self.request(ApiRequest::post(endpoint, body)).await
  }

  pub async fn put(&self, endpoint: &str, body: Value) -> ApiResult<ApiResponse> {
    self
      .request(ApiRequest::new(HttpMethod::Put, endpoint).with_body(body))
      .await
  }

  pub async fn patch(&self, endpoint: &str, body: Value) -> ApiResult<ApiResponse> {
    self
      .request(ApiRequest::new(HttpMethod::Patch, endpoint).with_body(body))
      .await
  }

  pub async fn delete(&self, endpoint: &str) -> ApiResult<ApiResponse> {
    self
      .request(ApiRequest::new(HttpMethod::Delete, endpoint))
      .await
  }

  /// Run `requests` concurrently. Outcomes are returned in input order.
  pub async fn batch(&self, requests: Vec<ApiRequest>) -> Vec<ApiResult<ApiResponse>> {
    join_all(requests.into_iter().map(|request| self.request(request))).await
  }

  /// Replay queued requests if the network is up.
  pub async fn process_queue(&self) -> DrainReport {
    if self.queue.is_empty() {
      return DrainReport::default();
    }
    if !self.check_network().await {
      debug!("Offline, leaving {} requests queued", self.queue.len());
      return DrainReport::skipped(self.queue.len());
    }
    self.queue.drain(&Replay(self)).await
  }

  /// Drain the queue every `drain_interval` and whenever connectivity
  /// comes back. The task ends when the connectivity source goes away.
  pub fn spawn_background(&self) -> JoinHandle<()> {
    let client = self.clone();
    let mut status = self.connectivity.subscribe();
    let mut was_online = *status.borrow_and_update();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(client.settings.drain_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            client.process_queue().await;
          }
          changed = status.changed() => {
            if changed.is_err() {
              debug!("Connectivity source closed, stopping background drain");
              break;
            }
            let online = *status.borrow_and_update();
            if online == was_online {
              continue;
            }
            was_online = online;
            info!(online, "Network status changed");
            client.emit(ApiEvent::NetworkStatusChanged { online });
            if online {
              client.process_queue().await;
            }
          }
        }
      }
    })
  }

  pub fn stats(&self) -> ClientStats {
    ClientStats {
      queue_size: self.queue.len(),
      is_online: self.connectivity.is_online(),
      last_checked: self.last_checked.load(Ordering::SeqCst),
    }
  }

  /// Send without queueing: auth headers, rate-limit waits and a single
  /// token refresh on 401.
  async fn dispatch(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
    let mut rate_limited = 0;
    let mut refreshed = false;

    loop {
      let prepared = self.prepare(request);
      let response = self.transport.send(&prepared).await?;
      if response.is_success() {
        return Ok(response);
      }

      match response.status {
        429 => {
          let wait = response
            .header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_retry_after);
          if rate_limited >= self.settings.max_rate_limit_retries {
            return Err(ApiError::RateLimited {
              retry_after_secs: wait.as_secs(),
            });
          }
          rate_limited += 1;
          warn!(url = %request.url, "Rate limited, retrying in {}s", wait.as_secs());
          tokio::time::sleep(wait).await;
        }
        401 if !refreshed => {
          refreshed = true;
          if !self.refresh_auth_token().await {
            self.emit(ApiEvent::AuthenticationFailed);
            return Err(ApiError::Unauthorized);
          }
        }
        401 => {
          self.emit(ApiEvent::AuthenticationFailed);
          return Err(ApiError::Unauthorized);
        }
        status => {
          return Err(ApiError::Status {
            status,
            body: response.body_text(),
          });
        }
      }
    }
  }

  fn prepare(&self, request: &ApiRequest) -> ApiRequest {
    let mut prepared = request.clone();
    if let Some(token) = self.auth_token() {
      prepared
        .headers
        .insert("Authorization".to_string(), format!("Bearer {}", token));
    }
    prepared
      .headers
      .insert(REQUEST_ID_HEADER.to_string(), Uuid::new_v4().to_string());
    prepared.headers.insert(
      REQUEST_TIMESTAMP_HEADER.to_string(),
      self.store.clock().now_millis().to_string(),
    );
    prepared
  }

  fn auth_token(&self) -> Option<String> {
    match self.store.get(AUTH_TOKEN_KEY) {
      Ok(Some(StoreValue::String(token))) => Some(token),
      Ok(_) => self.static_token.clone(),
      Err(e) => {
        warn!(error = %e, "Failed to read auth token");
        self.static_token.clone()
      }
    }
  }

  async fn refresh_auth_token(&self) -> bool {
    let refresh_token = match self.store.get(REFRESH_TOKEN_KEY) {
      Ok(Some(StoreValue::String(token))) => token,
      Ok(_) => {
        debug!("No refresh token available");
        return false;
      }
      Err(e) => {
        warn!(error = %e, "Failed to read refresh token");
        return false;
      }
    };

    let request = ApiRequest::post(REFRESH_ENDPOINT, json!({ "refreshToken": refresh_token }));
    let response = match self.transport.send(&self.prepare(&request)).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        warn!(status = response.status, "Token refresh rejected");
        return false;
      }
      Err(e) => {
        warn!(error = %e, "Token refresh failed");
        return false;
      }
    };

    match response.json::<RefreshResponse>() {
      Ok(RefreshResponse {
        success: true,
        token: Some(token),
      }) => match self.store.set(AUTH_TOKEN_KEY, token, SetOptions::default()) {
        Ok(()) => {
          info!("Auth token refreshed");
          true
        }
        Err(e) => {
          warn!(error = %e, "Failed to save refreshed auth token");
          false
        }
      },
      _ => {
        warn!("Token refresh response did not contain a token");
        false
      }
    }
  }

  fn defer(&self, request: ApiRequest) -> ApiError {
    let queued_id = self.queue.enqueue(request);
    info!(id = %queued_id, "Network unavailable, request queued");
    ApiError::NetworkUnavailable { queued_id }
  }

  fn report_failure(&self, request: &ApiRequest, error: &str) {
    warn!(method = %request.method, url = %request.url, error, "Request failed");
    self.emit(ApiEvent::RequestFailed {
      method: request.method,
      url: request.url.clone(),
      error: error.to_string(),
    });
  }

  fn emit(&self, event: ApiEvent) {
    let _ = self.events.send(event);
  }
}

/// Delivers queued requests through the full pipeline without re-queueing.
struct Replay<'a, B: KvBackend>(&'a ApiClient<B>);

#[async_trait]
impl<'a, B: KvBackend> RequestSender for Replay<'a, B> {
  async fn send(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
    self.0.dispatch(request).await
  }
}
