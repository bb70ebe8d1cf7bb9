//! Value encryption under a device master key.
//!
//! - `Encryptor` turns strings, serde values and byte blobs into
//!   authenticated envelopes and back
//! - `SecretStore` keeps the master key and device id between runs
//! - password hashing helpers for locally verified credentials

mod encryptor;
mod envelope;
mod keys;
mod password;

pub use encryptor::{EncryptedBlob, Encryptor};
pub use envelope::{looks_like_envelope, Envelope};
pub use keys::{
  FileSecretStore, KeySource, MemorySecretStore, SecretStore, DEVICE_ID_SLOT, MASTER_KEY_SLOT,
};
pub use password::{hash_password, verify_password, PasswordHash};
