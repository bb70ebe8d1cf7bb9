use std::collections::BTreeMap;
use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Patch => "PATCH",
      HttpMethod::Delete => "DELETE",
    }
  }
}

impl fmt::Display for HttpMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<HttpMethod> for reqwest::Method {
  fn from(method: HttpMethod) -> Self {
    match method {
      HttpMethod::Get => reqwest::Method::GET,
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

/// An outgoing call. `url` is either absolute or an endpoint path relative
/// to the configured base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
  pub method: HttpMethod,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<Value>,
}

impl ApiRequest {
  pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(HttpMethod::Get, url)
  }

  pub fn post(url: impl Into<String>, body: Value) -> Self {
    Self::new(HttpMethod::Post, url).with_body(body)
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

/// A received response. Header names are lower-cased; bodies that are not
/// JSON are kept as a string.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Value,
}

impl ApiResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body,
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  pub fn json<T: DeserializeOwned>(&self) -> ApiResult<T> {
    Ok(serde_json::from_value(self.body.clone())?)
  }

  /// Body rendered for error messages.
  pub(crate) fn body_text(&self) -> String {
    match &self.body {
      Value::String(s) => s.clone(),
      Value::Null => String::new(),
      other => other.to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
  pub queue_size: usize,
  pub is_online: bool,
  /// Epoch millis of the last connectivity probe, 0 if none ran
  pub last_checked: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiEvent {
  RequestSucceeded { method: HttpMethod, url: String, status: u16 },
  RequestFailed { method: HttpMethod, url: String, error: String },
  AuthenticationFailed,
  NetworkStatusChanged { online: bool },
}
