//! HTTP transport for API requests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::types::{ApiRequest, ApiResponse};
use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult};

/// Sends a single request and returns whatever the server answered.
///
/// Implementations report an `Err` only when no response was received.
/// Status handling (auth refresh, rate limits) happens above this layer.
#[async_trait]
pub trait RequestSender: Send + Sync {
  async fn send(&self, request: &ApiRequest) -> ApiResult<ApiResponse>;
}

/// reqwest-backed transport resolving endpoints against a base URL.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig) -> ApiResult<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;
    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| ApiError::Transport(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client, base_url })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }
}

#[async_trait]
impl RequestSender for HttpTransport {
  async fn send(&self, request: &ApiRequest) -> ApiResult<ApiResponse> {
    let url = resolve_url(&self.base_url, &request.url)?;
    debug!(method = %request.method, url = %url, "Sending request");

    let mut builder = self
      .client
      .request(request.method.into(), url)
      .header(CONTENT_TYPE, "application/json")
      .header(ACCEPT, "application/json");
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let text = response
      .text()
      .await
      .map_err(|e| ApiError::Transport(format!("Failed to read response body: {}", e)))?;

    Ok(ApiResponse {
      status,
      headers,
      body: parse_body(text),
    })
  }
}

/// Absolute URLs pass through; anything else is appended to `base`.
pub(crate) fn resolve_url(base: &Url, url: &str) -> ApiResult<Url> {
  if let Ok(absolute) = Url::parse(url) {
    return Ok(absolute);
  }
  let joined = format!(
    "{}/{}",
    base.as_str().trim_end_matches('/'),
    url.trim_start_matches('/')
  );
  Url::parse(&joined).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", joined, e)))
}

fn parse_body(text: String) -> Value {
  if text.trim().is_empty() {
    return Value::Null;
  }
  serde_json::from_str(&text).unwrap_or(Value::String(text))
}
