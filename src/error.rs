//! Error types for the encryptor, the key-value store and the API client.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("Encryption failed: {0}")]
  Encryption(String),

  #[error("Decryption failed: {0}")]
  Decryption(String),

  #[error("Invalid encrypted string format: {0}")]
  MalformedEnvelope(String),

  #[error("Key material unavailable: {0}")]
  KeyUnavailable(String),

  #[error("Secret store error: {0}")]
  SecretStore(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("Storage backend error: {0}")]
  Backend(String),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error(transparent)]
  Crypto(#[from] CryptoError),

  #[error("Stored {found} cannot be read as {expected}")]
  TypeMismatch {
    expected: &'static str,
    found: &'static str,
  },

  #[error("Unsupported value: {0}")]
  UnsupportedValue(String),

  #[error("Invalid import document: {0}")]
  InvalidImport(String),
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::Backend(e.to_string())
  }
}

#[derive(Debug, Error)]
pub enum ApiError {
  /// The device is offline; the request sits in the queue under `queued_id`.
  #[error("Network unavailable, request {queued_id} queued for offline processing")]
  NetworkUnavailable { queued_id: Uuid },

  #[error("Transport error: {0}")]
  Transport(String),

  #[error("HTTP {status}: {body}")]
  Status { status: u16, body: String },

  #[error("Rate limited, retry after {retry_after_secs}s")]
  RateLimited { retry_after_secs: u64 },

  #[error("Authentication failed")]
  Unauthorized,

  #[error("Invalid URL: {0}")]
  InvalidUrl(String),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl ApiError {
  /// True when the request was deferred rather than failed.
  pub fn is_deferred(&self) -> bool {
    matches!(self, ApiError::NetworkUnavailable { .. })
  }
}

pub type CryptoResult<T> = std::result::Result<T, CryptoError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
pub type ApiResult<T> = std::result::Result<T, ApiError>;
