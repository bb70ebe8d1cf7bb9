//! Backend trait for the key-value store.

use crate::error::StoreResult;

/// Raw persistence for serialized entries.
///
/// Backends store opaque strings; entry encoding, encryption and expiry
/// are handled by `LocalStore`. Metadata lives in a separate namespace so
/// that bookkeeping never shows up in `keys()`.
pub trait KvBackend: Send + Sync + 'static {
  fn get_raw(&self, key: &str) -> StoreResult<Option<String>>;

  fn put_raw(&self, key: &str, entry: &str) -> StoreResult<()>;

  /// Returns whether the key existed.
  fn delete_raw(&self, key: &str) -> StoreResult<bool>;

  fn contains(&self, key: &str) -> StoreResult<bool>;

  /// All keys, sorted.
  fn keys(&self) -> StoreResult<Vec<String>>;

  fn count(&self) -> StoreResult<usize>;

  /// Remove every entry. Metadata is kept.
  fn clear(&self) -> StoreResult<()>;

  fn get_meta(&self, key: &str) -> StoreResult<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> StoreResult<()>;
}
