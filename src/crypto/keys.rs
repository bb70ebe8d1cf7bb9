//! Secret storage for the device identity and master key.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::envelope::{KEY_LENGTH, SALT_LENGTH};
use crate::error::{CryptoError, CryptoResult};

/// Slot holding the hex-encoded 32-byte master key.
pub const MASTER_KEY_SLOT: &str = "otakus_master_key";
/// Slot holding the device identifier.
pub const DEVICE_ID_SLOT: &str = "otakus_device_id";

/// Derived keys kept per master key before the cache is reset.
const DERIVED_KEY_CACHE_LIMIT: usize = 256;

/// Persistent home for long-lived secrets.
pub trait SecretStore: Send + Sync {
  fn get(&self, slot: &str) -> CryptoResult<Option<String>>;
  fn set(&self, slot: &str, value: &str) -> CryptoResult<()>;
  fn delete(&self, slot: &str) -> CryptoResult<()>;
}

/// Where the active master key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
  /// Loaded from or written to the secret store.
  Persistent,
  /// Generated for this process only; data encrypted now is lost on restart.
  Ephemeral,
}

/// Stores each slot as a file in a private directory.
pub struct FileSecretStore {
  dir: PathBuf,
}

impl FileSecretStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  fn slot_path(&self, slot: &str) -> PathBuf {
    self.dir.join(slot)
  }
}

impl SecretStore for FileSecretStore {
  fn get(&self, slot: &str) -> CryptoResult<Option<String>> {
    match fs::read_to_string(self.slot_path(slot)) {
      Ok(value) => Ok(Some(value.trim().to_string())),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(CryptoError::SecretStore(format!(
        "failed to read slot {}: {}",
        slot, e
      ))),
    }
  }

  fn set(&self, slot: &str, value: &str) -> CryptoResult<()> {
    fs::create_dir_all(&self.dir).map_err(|e| {
      CryptoError::SecretStore(format!(
        "failed to create secrets directory {}: {}",
        self.dir.display(),
        e
      ))
    })?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
      use std::os::unix::fs::OpenOptionsExt;
      options.mode(0o600);
    }

    let mut file = options
      .open(self.slot_path(slot))
      .map_err(|e| CryptoError::SecretStore(format!("failed to open slot {}: {}", slot, e)))?;
    file
      .write_all(value.as_bytes())
      .map_err(|e| CryptoError::SecretStore(format!("failed to write slot {}: {}", slot, e)))
  }

  fn delete(&self, slot: &str) -> CryptoResult<()> {
    match fs::remove_file(self.slot_path(slot)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(CryptoError::SecretStore(format!(
        "failed to delete slot {}: {}",
        slot, e
      ))),
    }
  }
}

/// In-process secret store.
#[derive(Default)]
pub struct MemorySecretStore {
  slots: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SecretStore for MemorySecretStore {
  fn get(&self, slot: &str) -> CryptoResult<Option<String>> {
    Ok(self.slots.lock().get(slot).cloned())
  }

  fn set(&self, slot: &str, value: &str) -> CryptoResult<()> {
    self.slots.lock().insert(slot.to_string(), value.to_string());
    Ok(())
  }

  fn delete(&self, slot: &str) -> CryptoResult<()> {
    self.slots.lock().remove(slot);
    Ok(())
  }
}

/// The active master key together with the keys derived from it.
///
/// Derived keys live here rather than on the encryptor so that replacing
/// the material on rotation drops them all at once.
pub(crate) struct KeyMaterial {
  pub master: Zeroizing<[u8; KEY_LENGTH]>,
  pub device_id: String,
  pub source: KeySource,
  derived: Mutex<HashMap<[u8; SALT_LENGTH], Zeroizing<[u8; KEY_LENGTH]>>>,
}

impl KeyMaterial {
  pub fn new(master: Zeroizing<[u8; KEY_LENGTH]>, device_id: String, source: KeySource) -> Self {
    Self {
      master,
      device_id,
      source,
      derived: Mutex::new(HashMap::new()),
    }
  }

  /// Fresh random key and a temporary device id, never persisted.
  pub fn ephemeral() -> CryptoResult<Self> {
    let master = random_key()?;
    let suffix = hex::encode(random_bytes::<5>()?);
    let device_id = format!("temp_{}_{}", chrono::Utc::now().timestamp_millis(), suffix);
    Ok(Self::new(master, device_id, KeySource::Ephemeral))
  }

  pub fn cached_key(&self, salt: &[u8; SALT_LENGTH]) -> Option<Zeroizing<[u8; KEY_LENGTH]>> {
    self.derived.lock().get(salt).cloned()
  }

  pub fn remember_key(&self, salt: [u8; SALT_LENGTH], key: Zeroizing<[u8; KEY_LENGTH]>) {
    let mut derived = self.derived.lock();
    if derived.len() >= DERIVED_KEY_CACHE_LIMIT {
      derived.clear();
    }
    derived.insert(salt, key);
  }

  #[cfg(test)]
  pub fn cached_key_count(&self) -> usize {
    self.derived.lock().len()
  }
}

pub(crate) fn random_bytes<const N: usize>() -> CryptoResult<[u8; N]> {
  let mut buf = [0u8; N];
  getrandom::getrandom(&mut buf)
    .map_err(|e| CryptoError::Encryption(format!("random number generation failed: {}", e)))?;
  Ok(buf)
}

pub(crate) fn random_key() -> CryptoResult<Zeroizing<[u8; KEY_LENGTH]>> {
  Ok(Zeroizing::new(random_bytes::<KEY_LENGTH>()?))
}

/// SHA-256 over time, randomness and platform, hex-encoded.
pub(crate) fn generate_device_id() -> CryptoResult<String> {
  let nonce = random_bytes::<16>()?;
  let seed = format!(
    "{}-{}-{}",
    chrono::Utc::now().timestamp_millis(),
    hex::encode(nonce),
    std::env::consts::OS
  );
  Ok(hex::encode(Sha256::digest(seed.as_bytes())))
}

pub(crate) fn decode_master_key(stored: &str) -> CryptoResult<Zeroizing<[u8; KEY_LENGTH]>> {
  let bytes = Zeroizing::new(
    hex::decode(stored)
      .map_err(|e| CryptoError::KeyUnavailable(format!("stored master key is not hex: {}", e)))?,
  );
  if bytes.len() != KEY_LENGTH {
    return Err(CryptoError::KeyUnavailable(format!(
      "stored master key has {} bytes, expected {}",
      bytes.len(),
      KEY_LENGTH
    )));
  }
  let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
  key.copy_from_slice(&bytes);
  Ok(key)
}
