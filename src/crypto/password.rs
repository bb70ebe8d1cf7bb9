//! Salted password hashing (PBKDF2-HMAC-SHA256).

use hmac::Hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use super::keys::random_bytes;
use crate::error::{CryptoError, CryptoResult};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
pub const PASSWORD_SALT_LENGTH: usize = 32;
const HASH_LENGTH: usize = 32;

/// Hex-encoded hash and the salt it was computed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash {
  pub hash: String,
  pub salt: String,
}

/// Hash `password`, drawing a random salt unless one is given.
pub fn hash_password(password: &str, salt: Option<&[u8]>) -> CryptoResult<PasswordHash> {
  let salt = match salt {
    Some(s) => s.to_vec(),
    None => random_bytes::<PASSWORD_SALT_LENGTH>()?.to_vec(),
  };

  let mut output = [0u8; HASH_LENGTH];
  pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut output)
    .map_err(|e| CryptoError::Encryption(format!("PBKDF2 failed: {}", e)))?;

  Ok(PasswordHash {
    hash: hex::encode(output),
    salt: hex::encode(salt),
  })
}

/// Check `password` against a stored hash. Any decoding failure counts as a
/// mismatch.
pub fn verify_password(password: &str, hash: &str, salt: &str) -> bool {
  let salt = match hex::decode(salt) {
    Ok(s) => s,
    Err(e) => {
      debug!(error = %e, "Password salt is not hex");
      return false;
    }
  };
  let expected = match hex::decode(hash) {
    Ok(h) => h,
    Err(e) => {
      debug!(error = %e, "Password hash is not hex");
      return false;
    }
  };

  match hash_password(password, Some(&salt)) {
    Ok(computed) => match hex::decode(computed.hash) {
      Ok(actual) => constant_time_eq(&actual, &expected),
      Err(_) => false,
    },
    Err(e) => {
      debug!(error = %e, "Password verification failed");
      false
    }
  }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
  if a.len() != b.len() {
    return false;
  }
  a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_then_verify() {
    let stored = hash_password("hunter2", None).unwrap();
    assert_eq!(stored.hash.len(), HASH_LENGTH * 2);
    assert_eq!(stored.salt.len(), PASSWORD_SALT_LENGTH * 2);
    assert!(verify_password("hunter2", &stored.hash, &stored.salt));
    assert!(!verify_password("hunter3", &stored.hash, &stored.salt));
  }

  #[test]
  fn explicit_salt_is_deterministic() {
    let a = hash_password("pw", Some(b"fixed-salt")).unwrap();
    let b = hash_password("pw", Some(b"fixed-salt")).unwrap();
    assert_eq!(a, b);
    let c = hash_password("pw", None).unwrap();
    assert_ne!(a.hash, c.hash);
  }

  #[test]
  fn garbage_inputs_do_not_verify() {
    let stored = hash_password("pw", None).unwrap();
    assert!(!verify_password("pw", "not-hex", &stored.salt));
    assert!(!verify_password("pw", &stored.hash, "not-hex"));
    assert!(!verify_password("pw", &stored.hash[..10], &stored.salt));
  }
}
