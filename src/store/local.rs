//! Typed key-value store with encryption, TTL and a read-through cache.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::entry::{EntryMetadata, Priority, StorageEntry};
use super::traits::KvBackend;
use super::value::{stored_size, DataType, StoreValue};
use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::crypto::Encryptor;
use crate::error::{StoreError, StoreResult};

/// Prefix for the namespaced cache helpers.
pub const CACHE_PREFIX: &str = "cache_";
pub const USER_DATA_KEY: &str = "otakus_user_data";
pub const APP_SETTINGS_KEY: &str = "otakus_app_settings";
/// Only export documents with this version are accepted by `import`.
pub const EXPORT_VERSION: &str = "1.0";

const STATS_META_KEY: &str = "storage_stats";
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const EVENT_CAPACITY: usize = 64;

/// Per-write options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOptions {
  pub encrypt: bool,
  pub ttl: Option<Duration>,
  pub priority: Priority,
}

impl Default for SetOptions {
  fn default() -> Self {
    Self {
      encrypt: true,
      ttl: None,
      priority: Priority::Normal,
    }
  }
}

impl SetOptions {
  pub fn unencrypted() -> Self {
    Self {
      encrypt: false,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = Some(ttl);
    self
  }

  pub fn with_priority(mut self, priority: Priority) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_encrypt(mut self, encrypt: bool) -> Self {
    self.encrypt = encrypt;
    self
  }
}

/// Store-wide behaviour fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
  /// When false, values are written in the clear regardless of `SetOptions`.
  pub encryption: bool,
  pub cleanup_on_open: bool,
}

impl Default for StoreOptions {
  fn default() -> Self {
    Self {
      encryption: true,
      cleanup_on_open: true,
    }
  }
}

impl From<&StorageConfig> for StoreOptions {
  fn from(config: &StorageConfig) -> Self {
    Self {
      encryption: config.encryption,
      cleanup_on_open: config.cleanup_on_open,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
  pub total_items: usize,
  /// Sum of entry sizes, see `EntryMetadata::size`
  pub total_size: u64,
  /// Epoch millis of the last expiry sweep, 0 if none ran
  pub last_cleanup: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
  Set { key: String },
  Deleted { key: String },
  Expired { key: String },
  Cleared,
}

/// Portable dump of the store produced by `export`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
  pub version: String,
  pub export_date: DateTime<Utc>,
  pub total_items: usize,
  pub data: Map<String, Value>,
}

struct CachedValue {
  value: StoreValue,
  expires_at: Option<i64>,
}

struct StoreInner<B: KvBackend> {
  backend: B,
  encryptor: Arc<Encryptor>,
  clock: Arc<dyn Clock>,
  encryption: bool,
  cache: Mutex<HashMap<String, CachedValue>>,
  stats: Mutex<StorageStats>,
  events: broadcast::Sender<StoreEvent>,
}

/// Key-value store over a `KvBackend`.
///
/// Writes go through to the backend before the cache is touched, so a
/// completed `set`, `get` or `delete` leaves both in agreement. Cloning is
/// cheap and clones share state.
pub struct LocalStore<B: KvBackend> {
  inner: Arc<StoreInner<B>>,
}

impl<B: KvBackend> Clone for LocalStore<B> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<B: KvBackend> LocalStore<B> {
  /// Open a store with default options and the system clock.
  pub fn new(backend: B, encryptor: Arc<Encryptor>) -> StoreResult<Self> {
    Self::with_options(
      backend,
      encryptor,
      StoreOptions::default(),
      Arc::new(SystemClock),
    )
  }

  pub fn with_options(
    backend: B,
    encryptor: Arc<Encryptor>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
  ) -> StoreResult<Self> {
    let mut stats = match backend.get_meta(STATS_META_KEY)? {
      Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "Discarding unreadable storage statistics");
        StorageStats::default()
      }),
      None => StorageStats::default(),
    };
    stats.total_items = backend.count()?;

    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let store = Self {
      inner: Arc::new(StoreInner {
        backend,
        encryptor,
        clock,
        encryption: options.encryption,
        cache: Mutex::new(HashMap::new()),
        stats: Mutex::new(stats),
        events,
      }),
    };

    if options.cleanup_on_open {
      store.purge_expired()?;
    }
    Ok(store)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.inner.events.subscribe()
  }

  pub fn clock(&self) -> Arc<dyn Clock> {
    Arc::clone(&self.inner.clock)
  }

  pub fn encryptor(&self) -> &Arc<Encryptor> {
    &self.inner.encryptor
  }

  /// Store `value` under `key`, replacing any previous entry.
  pub fn set(
    &self,
    key: &str,
    value: impl Into<StoreValue>,
    options: SetOptions,
  ) -> StoreResult<()> {
    let value = value.into();
    let data_type = value.data_type();
    let prepared = value.to_json()?;
    // Cache what a later read from the backend would return.
    let value = StoreValue::restore(prepared.clone(), data_type)?;

    let encrypted = self.inner.encryption && options.encrypt && data_type != DataType::Number;
    let stored = if encrypted {
      let plaintext = serde_json::to_string(&prepared)?;
      Value::String(self.inner.encryptor.encrypt(&plaintext)?)
    } else {
      prepared
    };

    let metadata = EntryMetadata {
      data_type,
      encrypted,
      created_at: self.inner.clock.now_millis(),
      ttl: options
        .ttl
        .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
      priority: options.priority,
      size: stored_size(&stored),
    };
    let expires_at = metadata.expires_at();
    let size = metadata.size;
    let entry = StorageEntry {
      value: stored,
      metadata,
    };

    let previous_size = self.entry_size(key);
    self.inner.backend.put_raw(key, &entry.to_json()?)?;
    self
      .inner
      .cache
      .lock()
      .insert(key.to_string(), CachedValue { value, expires_at });
    self.adjust_stats(size as i64 - previous_size as i64);

    debug!(key, encrypted, size, "Stored value");
    self.emit(StoreEvent::Set {
      key: key.to_string(),
    });

    if let Some(ttl) = options.ttl {
      self.schedule_expiry(key, ttl);
    }
    Ok(())
  }

  /// Read `key`. Expired entries are deleted and reported as absent.
  pub fn get(&self, key: &str) -> StoreResult<Option<StoreValue>> {
    let now = self.inner.clock.now_millis();
    if let Some(cached) = self.inner.cache.lock().get(key) {
      if !cached.expires_at.is_some_and(|at| now > at) {
        return Ok(Some(cached.value.clone()));
      }
    }

    let Some(raw) = self.inner.backend.get_raw(key)? else {
      self.inner.cache.lock().remove(key);
      return Ok(None);
    };

    let entry = StorageEntry::from_json(&raw)?;
    if entry.metadata.is_expired(now) {
      debug!(key, "Entry expired on read");
      self.remove(key, StoreEvent::Expired {
        key: key.to_string(),
      })?;
      return Ok(None);
    }

    let expires_at = entry.metadata.expires_at();
    let value = self.decode(entry)?;
    self.inner.cache.lock().insert(
      key.to_string(),
      CachedValue {
        value: value.clone(),
        expires_at,
      },
    );
    Ok(Some(value))
  }

  /// Like `get`, but returns `default` on absence and on any error.
  pub fn get_or(&self, key: &str, default: impl Into<StoreValue>) -> StoreValue {
    match self.get(key) {
      Ok(Some(value)) => value,
      Ok(None) => default.into(),
      Err(e) => {
        warn!(key, error = %e, "Failed to read stored value, using default");
        default.into()
      }
    }
  }

  /// Remove `key`. Returns whether it existed.
  pub fn delete(&self, key: &str) -> StoreResult<bool> {
    self.remove(key, StoreEvent::Deleted {
      key: key.to_string(),
    })
  }

  /// True when an entry exists, expired or not.
  pub fn has(&self, key: &str) -> StoreResult<bool> {
    self.inner.backend.contains(key)
  }

  pub fn keys(&self) -> StoreResult<Vec<String>> {
    self.inner.backend.keys()
  }

  pub fn clear(&self) -> StoreResult<()> {
    self.inner.backend.clear()?;
    self.inner.cache.lock().clear();
    {
      let mut stats = self.inner.stats.lock();
      stats.total_items = 0;
      stats.total_size = 0;
    }
    self.persist_stats();
    info!("Store cleared");
    self.emit(StoreEvent::Cleared);
    Ok(())
  }

  pub fn stats(&self) -> StoreResult<StorageStats> {
    let count = self.inner.backend.count()?;
    let mut stats = self.inner.stats.lock();
    stats.total_items = count;
    Ok(stats.clone())
  }

  /// Serialize `value` as JSON and store it.
  pub fn set_json<T: Serialize + ?Sized>(
    &self,
    key: &str,
    value: &T,
    options: SetOptions,
  ) -> StoreResult<()> {
    let value = StoreValue::from_json(serde_json::to_value(value)?)?;
    self.set(key, value, options)
  }

  pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
    match self.get(key)? {
      Some(value) => Ok(Some(serde_json::from_value(value.to_json()?)?)),
      None => Ok(None),
    }
  }

  /// Cache `value` under `cache_<key>`, unencrypted and low priority.
  /// `ttl` defaults to one hour.
  pub fn cache_set(
    &self,
    key: &str,
    value: impl Into<StoreValue>,
    ttl: Option<Duration>,
  ) -> StoreResult<()> {
    let options = SetOptions::unencrypted()
      .with_ttl(ttl.unwrap_or(DEFAULT_CACHE_TTL))
      .with_priority(Priority::Low);
    self.set(&cache_key(key), value, options)
  }

  pub fn cache_get(&self, key: &str) -> StoreResult<Option<StoreValue>> {
    self.get(&cache_key(key))
  }

  pub fn cache_delete(&self, key: &str) -> StoreResult<bool> {
    self.delete(&cache_key(key))
  }

  pub fn save_user_data<T: Serialize + ?Sized>(&self, data: &T) -> StoreResult<()> {
    self.set_json(
      USER_DATA_KEY,
      data,
      SetOptions::default().with_priority(Priority::High),
    )
  }

  pub fn user_data<T: DeserializeOwned>(&self) -> StoreResult<Option<T>> {
    self.get_json(USER_DATA_KEY)
  }

  pub fn save_app_settings<T: Serialize + ?Sized>(&self, settings: &T) -> StoreResult<()> {
    self.set_json(APP_SETTINGS_KEY, settings, SetOptions::unencrypted())
  }

  /// Saved settings, or an empty object.
  pub fn app_settings(&self) -> StoreResult<Value> {
    Ok(
      self
        .get_json(APP_SETTINGS_KEY)?
        .unwrap_or_else(|| Value::Object(Map::new())),
    )
  }

  /// Delete every expired entry. Returns how many were removed.
  pub fn purge_expired(&self) -> StoreResult<usize> {
    let now = self.inner.clock.now_millis();
    let mut removed = 0;

    for key in self.inner.backend.keys()? {
      let Some(raw) = self.inner.backend.get_raw(&key)? else {
        continue;
      };
      let entry = match StorageEntry::from_json(&raw) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(key = %key, error = %e, "Skipping unreadable entry during cleanup");
          continue;
        }
      };
      if entry.metadata.is_expired(now)
        && self.remove(&key, StoreEvent::Expired { key: key.clone() })?
      {
        removed += 1;
      }
    }

    self.inner.stats.lock().last_cleanup = now;
    self.persist_stats();
    if removed > 0 {
      info!("Cache cleanup: {} items removed", removed);
    }
    Ok(removed)
  }

  /// Dump all readable entries except `cache_` keys.
  pub fn export(&self) -> StoreResult<ExportDocument> {
    let keys = self.inner.backend.keys()?;
    let mut data = Map::new();

    for key in &keys {
      if key.starts_with(CACHE_PREFIX) {
        continue;
      }
      match self.get(key) {
        Ok(Some(value)) => {
          data.insert(key.clone(), value.to_json()?);
        }
        Ok(None) => {}
        Err(e) => warn!(key = %key, error = %e, "Skipping unreadable entry during export"),
      }
    }

    Ok(ExportDocument {
      version: EXPORT_VERSION.to_string(),
      export_date: Utc::now(),
      total_items: keys.len(),
      data,
    })
  }

  /// Load every value of `document` with default options. Returns the
  /// number of keys imported.
  pub fn import(&self, document: &ExportDocument) -> StoreResult<usize> {
    if document.version != EXPORT_VERSION {
      return Err(StoreError::InvalidImport(format!(
        "unsupported version {:?}",
        document.version
      )));
    }

    let mut imported = 0;
    for (key, value) in &document.data {
      let value = match StoreValue::from_json(value.clone()) {
        Ok(value) => value,
        Err(e) => {
          warn!(key = %key, error = %e, "Skipping value during import");
          continue;
        }
      };
      self.set(key, value, SetOptions::default())?;
      imported += 1;
    }

    info!("Imported {} items", imported);
    Ok(imported)
  }

  /// Parse and import a JSON export document.
  pub fn import_json(&self, json: &str) -> StoreResult<usize> {
    let document: ExportDocument =
      serde_json::from_str(json).map_err(|e| StoreError::InvalidImport(e.to_string()))?;
    self.import(&document)
  }

  /// Rotate the master key and re-encrypt every live encrypted entry under
  /// the new key. Returns how many entries were rewritten.
  ///
  /// All entries are decrypted before the key changes, so an unreadable
  /// entry aborts the rotation without touching anything. A write failure
  /// after the key changed is not rolled back: entries not yet rewritten
  /// stay under the old key and can no longer be read.
  pub fn rotate_encryption_key(&self) -> StoreResult<usize> {
    let now = self.inner.clock.now_millis();
    let mut pending = Vec::new();
    for key in self.inner.backend.keys()? {
      let Some(raw) = self.inner.backend.get_raw(&key)? else {
        continue;
      };
      let entry = StorageEntry::from_json(&raw)?;
      if !entry.metadata.encrypted || entry.metadata.is_expired(now) {
        continue;
      }
      let metadata = entry.metadata.clone();
      pending.push((key, self.decode(entry)?, metadata));
    }

    self.inner.encryptor.rotate_master_key()?;
    self.inner.cache.lock().clear();

    for (done, (key, value, metadata)) in pending.iter().enumerate() {
      let ttl = metadata
        .expires_at()
        .map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0)));
      let options = SetOptions {
        encrypt: true,
        ttl,
        priority: metadata.priority,
      };
      if let Err(e) = self.set(key, value.clone(), options) {
        error!(
          key = %key,
          error = %e,
          "Key rotated but {} of {} entries were not re-encrypted",
          pending.len() - done,
          pending.len()
        );
        return Err(e);
      }
    }

    info!("Re-encrypted {} entries under the new key", pending.len());
    Ok(pending.len())
  }

  fn decode(&self, entry: StorageEntry) -> StoreResult<StoreValue> {
    let value = if entry.metadata.encrypted {
      let envelope = entry.value.as_str().ok_or(StoreError::TypeMismatch {
        expected: "encrypted string",
        found: "non-string value",
      })?;
      let plaintext = self.inner.encryptor.decrypt(envelope)?;
      serde_json::from_str(&plaintext)?
    } else {
      entry.value
    };
    StoreValue::restore(value, entry.metadata.data_type)
  }

  fn remove(&self, key: &str, event: StoreEvent) -> StoreResult<bool> {
    let size = self.entry_size(key);
    let existed = self.inner.backend.delete_raw(key)?;
    self.inner.cache.lock().remove(key);
    if existed {
      self.adjust_stats(-(size as i64));
      self.emit(event);
    }
    Ok(existed)
  }

  /// Recorded size of the persisted entry, 0 when absent or unreadable.
  fn entry_size(&self, key: &str) -> u64 {
    match self.inner.backend.get_raw(key) {
      Ok(Some(raw)) => StorageEntry::from_json(&raw)
        .map(|entry| entry.metadata.size)
        .unwrap_or(0),
      _ => 0,
    }
  }

  fn adjust_stats(&self, delta: i64) {
    let count = self.inner.backend.count();
    {
      let mut stats = self.inner.stats.lock();
      stats.total_size = stats.total_size.saturating_add_signed(delta);
      if let Ok(count) = count {
        stats.total_items = count;
      }
    }
    self.persist_stats();
  }

  fn persist_stats(&self) {
    let stats = self.inner.stats.lock().clone();
    let result = serde_json::to_string(&stats)
      .map_err(StoreError::from)
      .and_then(|raw| self.inner.backend.set_meta(STATS_META_KEY, &raw));
    if let Err(e) = result {
      warn!(error = %e, "Failed to persist storage statistics");
    }
  }

  fn emit(&self, event: StoreEvent) {
    // No subscribers is fine.
    let _ = self.inner.events.send(event);
  }

  /// Remove `key` once `ttl` has passed, unless it was rewritten since.
  fn schedule_expiry(&self, key: &str, ttl: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
      debug!(key, "No runtime, expiry will happen on read");
      return;
    };

    let inner: Weak<StoreInner<B>> = Arc::downgrade(&self.inner);
    let key = key.to_string();
    handle.spawn(async move {
      // One extra millisecond so the deadline has strictly passed.
      tokio::time::sleep(ttl + Duration::from_millis(1)).await;
      let Some(inner) = inner.upgrade() else {
        return;
      };
      let store = LocalStore { inner };
      if let Err(e) = store.expire_if_due(&key) {
        warn!(key = %key, error = %e, "Scheduled expiry failed");
      }
    });
  }

  fn expire_if_due(&self, key: &str) -> StoreResult<()> {
    let Some(raw) = self.inner.backend.get_raw(key)? else {
      return Ok(());
    };
    let entry = StorageEntry::from_json(&raw)?;
    if entry.metadata.is_expired(self.inner.clock.now_millis()) {
      self.remove(key, StoreEvent::Expired {
        key: key.to_string(),
      })?;
    }
    Ok(())
  }
}

fn cache_key(key: &str) -> String {
  format!("{}{}", CACHE_PREFIX, key)
}
