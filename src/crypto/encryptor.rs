//! AES-256-GCM encryption of stored values under a device master key.
//!
//! Every call draws a fresh salt and IV. The per-value key is
//! HKDF-SHA256(master key, salt), so any holder of the master key can
//! decrypt any envelope.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::envelope::{Envelope, IV_LENGTH, KEY_LENGTH, SALT_LENGTH, TAG_LENGTH};
use super::keys::{
  decode_master_key, generate_device_id, random_bytes, random_key, KeyMaterial, KeySource,
  SecretStore, DEVICE_ID_SLOT, MASTER_KEY_SLOT,
};
use crate::error::{CryptoError, CryptoResult};

/// HKDF info string binding derived keys to this use.
const KEY_INFO: &[u8] = b"otakus-nexus/storage/v1";

/// An encrypted binary payload with hex-encoded components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
  pub salt: String,
  pub iv: String,
  pub tag: String,
  pub data: String,
  /// Plaintext length in bytes
  pub size: usize,
  /// Ciphertext plus tag length in bytes
  pub encrypted_size: usize,
}

/// Encrypts and decrypts strings, serde values and byte blobs.
///
/// Key material is loaded lazily on first use. Reads share the key behind a
/// read lock; `rotate_master_key` takes the write lock.
pub struct Encryptor {
  secrets: Arc<dyn SecretStore>,
  allow_ephemeral: bool,
  keys: RwLock<Option<Arc<KeyMaterial>>>,
}

impl Encryptor {
  /// Create an encryptor backed by `secrets`.
  ///
  /// With `allow_ephemeral`, a failing secret store degrades to a
  /// process-only key instead of an error. `key_source` reports which
  /// mode is active.
  pub fn new(secrets: Arc<dyn SecretStore>, allow_ephemeral: bool) -> Self {
    Self {
      secrets,
      allow_ephemeral,
      keys: RwLock::new(None),
    }
  }

  /// Load or create the key material now rather than on first use.
  pub fn initialize(&self) -> CryptoResult<KeySource> {
    Ok(self.material()?.source)
  }

  pub fn key_source(&self) -> CryptoResult<KeySource> {
    Ok(self.material()?.source)
  }

  pub fn device_id(&self) -> CryptoResult<String> {
    Ok(self.material()?.device_id.clone())
  }

  /// Encrypt a non-empty string into a `salt:iv:ciphertext:tag` envelope.
  pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
    if plaintext.is_empty() {
      return Err(CryptoError::Encryption(
        "plaintext must be a non-empty string".to_string(),
      ));
    }
    Ok(self.seal(plaintext.as_bytes())?.to_string())
  }

  pub fn decrypt(&self, envelope: &str) -> CryptoResult<String> {
    let envelope = Envelope::parse(envelope)?;
    let plaintext = self.open(&envelope)?;
    String::from_utf8(plaintext)
      .map_err(|e| CryptoError::Decryption(format!("plaintext is not UTF-8: {}", e)))
  }

  pub fn encrypt_object<T: Serialize + ?Sized>(&self, value: &T) -> CryptoResult<String> {
    let json = serde_json::to_string(value)
      .map_err(|e| CryptoError::Encryption(format!("serialization failed: {}", e)))?;
    self.encrypt(&json)
  }

  pub fn decrypt_object<T: DeserializeOwned>(&self, envelope: &str) -> CryptoResult<T> {
    let json = self.decrypt(envelope)?;
    serde_json::from_str(&json)
      .map_err(|e| CryptoError::Decryption(format!("deserialization failed: {}", e)))
  }

  /// True when `envelope` decrypts to exactly `expected`.
  pub fn verify_integrity(&self, envelope: &str, expected: &str) -> bool {
    match self.decrypt(envelope) {
      Ok(plaintext) => plaintext == expected,
      Err(e) => {
        debug!(error = %e, "Integrity check failed");
        false
      }
    }
  }

  /// Encrypt a binary payload such as an image.
  pub fn encrypt_bytes(&self, data: &[u8]) -> CryptoResult<EncryptedBlob> {
    let envelope = self.seal(data)?;
    Ok(EncryptedBlob {
      salt: hex::encode(envelope.salt),
      iv: hex::encode(envelope.iv),
      tag: hex::encode(envelope.tag),
      data: hex::encode(&envelope.ciphertext),
      size: data.len(),
      encrypted_size: envelope.ciphertext.len() + TAG_LENGTH,
    })
  }

  pub fn decrypt_bytes(&self, blob: &EncryptedBlob) -> CryptoResult<Vec<u8>> {
    let envelope = Envelope::from_hex_parts(&blob.salt, &blob.iv, &blob.data, &blob.tag)?;
    self.open(&envelope)
  }

  /// Replace the master key. Envelopes written under the old key stop
  /// decrypting; derived keys are discarded with the old material.
  pub fn rotate_master_key(&self) -> CryptoResult<()> {
    let mut guard = self.keys.write();
    let current = match guard.as_ref() {
      Some(material) => Arc::clone(material),
      None => Arc::new(self.load_or_create()?),
    };

    let master = random_key()?;
    if current.source == KeySource::Persistent {
      self
        .secrets
        .set(MASTER_KEY_SLOT, &hex::encode(master.as_slice()))?;
    }

    *guard = Some(Arc::new(KeyMaterial::new(
      master,
      current.device_id.clone(),
      current.source,
    )));
    info!("Master key rotated");
    Ok(())
  }

  fn seal(&self, plaintext: &[u8]) -> CryptoResult<Envelope> {
    let material = self.material()?;
    let salt = random_bytes::<SALT_LENGTH>()?;
    let iv = random_bytes::<IV_LENGTH>()?;
    let key = derive_key(&material, &salt)?;

    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
      .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let mut sealed = cipher
      .encrypt(Nonce::from_slice(&iv), plaintext)
      .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let tag_start = sealed.len() - TAG_LENGTH;
    let mut tag = [0u8; TAG_LENGTH];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);

    Ok(Envelope {
      salt,
      iv,
      ciphertext: sealed,
      tag,
    })
  }

  fn open(&self, envelope: &Envelope) -> CryptoResult<Vec<u8>> {
    let material = self.material()?;
    let key = derive_key(&material, &envelope.salt)?;

    let cipher = Aes256Gcm::new_from_slice(key.as_slice())
      .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    cipher
      .decrypt(Nonce::from_slice(&envelope.iv), envelope.sealed().as_slice())
      .map_err(|_| CryptoError::Decryption("authentication tag mismatch".to_string()))
  }

  fn material(&self) -> CryptoResult<Arc<KeyMaterial>> {
    if let Some(material) = self.keys.read().as_ref() {
      return Ok(Arc::clone(material));
    }

    let mut guard = self.keys.write();
    if let Some(material) = guard.as_ref() {
      return Ok(Arc::clone(material));
    }
    let material = Arc::new(self.load_or_create()?);
    *guard = Some(Arc::clone(&material));
    Ok(material)
  }

  fn load_or_create(&self) -> CryptoResult<KeyMaterial> {
    match self.load_persistent() {
      Ok(material) => {
        debug!("Storage encryptor initialized");
        Ok(material)
      }
      Err(e) if self.allow_ephemeral => {
        warn!(
          error = %e,
          "Secret store unavailable, falling back to an ephemeral master key; \
           encrypted data will not survive a restart"
        );
        KeyMaterial::ephemeral()
      }
      Err(e) => Err(CryptoError::KeyUnavailable(e.to_string())),
    }
  }

  fn load_persistent(&self) -> CryptoResult<KeyMaterial> {
    let device_id = match self.secrets.get(DEVICE_ID_SLOT)? {
      Some(id) if !id.is_empty() => id,
      _ => {
        let id = generate_device_id()?;
        self.secrets.set(DEVICE_ID_SLOT, &id)?;
        info!("Generated new device id");
        id
      }
    };

    let master = match self.secrets.get(MASTER_KEY_SLOT)? {
      Some(stored) if !stored.is_empty() => decode_master_key(&stored)?,
      _ => {
        let key = random_key()?;
        self
          .secrets
          .set(MASTER_KEY_SLOT, &hex::encode(key.as_slice()))?;
        info!("Generated new master key");
        key
      }
    };

    Ok(KeyMaterial::new(master, device_id, KeySource::Persistent))
  }
}

/// Derive the per-value key for `salt`, reusing a cached derivation.
fn derive_key(
  material: &KeyMaterial,
  salt: &[u8; SALT_LENGTH],
) -> CryptoResult<Zeroizing<[u8; KEY_LENGTH]>> {
  if let Some(key) = material.cached_key(salt) {
    return Ok(key);
  }
  let key = hkdf_derive(material.master.as_slice(), salt)?;
  material.remember_key(*salt, key.clone());
  Ok(key)
}

fn hkdf_derive(ikm: &[u8], salt: &[u8]) -> CryptoResult<Zeroizing<[u8; KEY_LENGTH]>> {
  let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
  let mut okm = Zeroizing::new([0u8; KEY_LENGTH]);
  hk.expand(KEY_INFO, okm.as_mut_slice())
    .map_err(|e| CryptoError::Encryption(format!("HKDF expand failed: {}", e)))?;
  Ok(okm)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::keys::MemorySecretStore;

  struct BrokenSecretStore;

  impl SecretStore for BrokenSecretStore {
    fn get(&self, _slot: &str) -> CryptoResult<Option<String>> {
      Err(CryptoError::SecretStore("keychain locked".to_string()))
    }

    fn set(&self, _slot: &str, _value: &str) -> CryptoResult<()> {
      Err(CryptoError::SecretStore("keychain locked".to_string()))
    }

    fn delete(&self, _slot: &str) -> CryptoResult<()> {
      Ok(())
    }
  }

  fn encryptor() -> Encryptor {
    Encryptor::new(Arc::new(MemorySecretStore::new()), false)
  }

  #[test]
  fn encrypt_decrypt_round_trip() {
    let enc = encryptor();
    let long = "long ".repeat(10_000);
    for text in ["hello", "x", "épisode 12 — 見た", long.as_str()] {
      let envelope = enc.encrypt(text).unwrap();
      assert_eq!(enc.decrypt(&envelope).unwrap(), text);
    }
  }

  #[test]
  fn envelope_has_four_hex_parts() {
    let enc = encryptor();
    let envelope = enc.encrypt("secret").unwrap();
    let parts: Vec<&str> = envelope.split(':').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[0].len(), SALT_LENGTH * 2);
    assert_eq!(parts[1].len(), IV_LENGTH * 2);
    assert_eq!(parts[2].len(), "secret".len() * 2);
    assert_eq!(parts[3].len(), TAG_LENGTH * 2);
  }

  #[test]
  fn empty_plaintext_is_rejected() {
    let err = encryptor().encrypt("").unwrap_err();
    assert!(matches!(err, CryptoError::Encryption(_)));
  }

  #[test]
  fn same_plaintext_gives_different_envelopes() {
    let enc = encryptor();
    let a = enc.encrypt("same").unwrap();
    let b = enc.encrypt("same").unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn malformed_envelope_is_a_decryption_error() {
    let enc = encryptor();
    assert!(matches!(
      enc.decrypt("only:three:parts").unwrap_err(),
      CryptoError::MalformedEnvelope(_)
    ));
  }

  #[test]
  fn tampered_ciphertext_fails_authentication() {
    let enc = encryptor();
    let envelope = enc.encrypt("do not touch").unwrap();
    let mut parts: Vec<String> = envelope.split(':').map(String::from).collect();
    let mut ct = hex::decode(&parts[2]).unwrap();
    ct[0] ^= 0x01;
    parts[2] = hex::encode(ct);
    let err = enc.decrypt(&parts.join(":")).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
  }

  #[test]
  fn key_derivation_is_deterministic() {
    let ikm = [0x42u8; 32];
    let a = hkdf_derive(&ikm, b"salt").unwrap();
    let b = hkdf_derive(&ikm, b"salt").unwrap();
    let c = hkdf_derive(&ikm, b"other").unwrap();
    assert_eq!(*a, *b);
    assert_ne!(*a, *c);
  }

  #[test]
  fn same_secret_store_decrypts_across_instances() {
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    let first = Encryptor::new(Arc::clone(&secrets), false);
    let envelope = first.encrypt("carry over").unwrap();

    let second = Encryptor::new(Arc::clone(&secrets), false);
    assert_eq!(second.decrypt(&envelope).unwrap(), "carry over");
    assert_eq!(first.device_id().unwrap(), second.device_id().unwrap());
    assert_eq!(second.key_source().unwrap(), KeySource::Persistent);
  }

  #[test]
  fn different_master_keys_cannot_decrypt() {
    let a = encryptor();
    let b = encryptor();
    let envelope = a.encrypt("private").unwrap();
    assert!(b.decrypt(&envelope).is_err());
  }

  #[test]
  fn rotation_invalidates_old_envelopes() {
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    let enc = Encryptor::new(Arc::clone(&secrets), false);
    let old = enc.encrypt("before").unwrap();
    assert_eq!(enc.decrypt(&old).unwrap(), "before");
    let stored_before = secrets.get(MASTER_KEY_SLOT).unwrap();

    enc.rotate_master_key().unwrap();

    assert!(enc.decrypt(&old).is_err());
    let fresh = enc.encrypt("after").unwrap();
    assert_eq!(enc.decrypt(&fresh).unwrap(), "after");
    assert_ne!(secrets.get(MASTER_KEY_SLOT).unwrap(), stored_before);
  }

  #[test]
  fn broken_secret_store_is_an_error_by_default() {
    let enc = Encryptor::new(Arc::new(BrokenSecretStore), false);
    assert!(matches!(
      enc.encrypt("x").unwrap_err(),
      CryptoError::KeyUnavailable(_)
    ));
  }

  #[test]
  fn broken_secret_store_degrades_when_allowed() {
    let enc = Encryptor::new(Arc::new(BrokenSecretStore), true);
    assert_eq!(enc.initialize().unwrap(), KeySource::Ephemeral);
    let envelope = enc.encrypt("volatile").unwrap();
    assert_eq!(enc.decrypt(&envelope).unwrap(), "volatile");
    enc.rotate_master_key().unwrap();
    assert_eq!(enc.key_source().unwrap(), KeySource::Ephemeral);
  }

  #[test]
  fn corrupt_stored_master_key_is_not_overwritten() {
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    secrets.set(MASTER_KEY_SLOT, "zz-not-hex").unwrap();
    let enc = Encryptor::new(Arc::clone(&secrets), false);
    assert!(enc.encrypt("x").is_err());
    assert_eq!(
      secrets.get(MASTER_KEY_SLOT).unwrap().as_deref(),
      Some("zz-not-hex")
    );
  }

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Profile {
    name: String,
    favorites: Vec<String>,
  }

  #[test]
  fn object_round_trip() {
    let enc = encryptor();
    let profile = Profile {
      name: "Mika".into(),
      favorites: vec!["Frieren".into(), "Mushishi".into()],
    };
    let envelope = enc.encrypt_object(&profile).unwrap();
    let back: Profile = enc.decrypt_object(&envelope).unwrap();
    assert_eq!(back, profile);
  }

  #[test]
  fn blob_round_trip_and_sizes() {
    let enc = encryptor();
    let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let blob = enc.encrypt_bytes(&data).unwrap();
    assert_eq!(blob.size, 4096);
    assert_eq!(blob.encrypted_size, 4096 + TAG_LENGTH);
    assert_eq!(enc.decrypt_bytes(&blob).unwrap(), data);

    let mut tampered = blob.clone();
    tampered.tag = hex::encode([0u8; TAG_LENGTH]);
    assert!(enc.decrypt_bytes(&tampered).is_err());
  }

  #[test]
  fn integrity_check() {
    let enc = encryptor();
    let envelope = enc.encrypt("expected").unwrap();
    assert!(enc.verify_integrity(&envelope, "expected"));
    assert!(!enc.verify_integrity(&envelope, "other"));
    assert!(!enc.verify_integrity("garbage", "expected"));
  }

  #[test]
  fn decrypt_reuses_derived_key() {
    let enc = encryptor();
    let envelope = enc.encrypt("cached").unwrap();
    let material = enc.material().unwrap();
    assert_eq!(material.cached_key_count(), 1);
    enc.decrypt(&envelope).unwrap();
    assert_eq!(material.cached_key_count(), 1);
  }
}
