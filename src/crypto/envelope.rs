//! Hex envelope format for encrypted values.
//!
//! Wire format: `hex(salt):hex(iv):hex(ciphertext):hex(tag)`
//! with a 32-byte salt, a 12-byte AES-GCM IV and a 16-byte tag.

use std::fmt;
use std::str::FromStr;

use crate::error::{CryptoError, CryptoResult};

pub const SALT_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;
pub const KEY_LENGTH: usize = 32;

const SEPARATOR: char = ':';

/// One encrypted value, split into its four components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
  pub salt: [u8; SALT_LENGTH],
  pub iv: [u8; IV_LENGTH],
  pub ciphertext: Vec<u8>,
  pub tag: [u8; TAG_LENGTH],
}

impl Envelope {
  /// Build an envelope from its hex-encoded parts, validating lengths.
  pub fn from_hex_parts(salt: &str, iv: &str, ciphertext: &str, tag: &str) -> CryptoResult<Self> {
    Ok(Self {
      salt: decode_fixed(salt, "salt")?,
      iv: decode_fixed(iv, "iv")?,
      ciphertext: hex::decode(ciphertext)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext: {}", e)))?,
      tag: decode_fixed(tag, "tag")?,
    })
  }

  /// Parse `salt:iv:ciphertext:tag`.
  pub fn parse(s: &str) -> CryptoResult<Self> {
    let parts: Vec<&str> = s.split(SEPARATOR).collect();
    if parts.len() != 4 {
      return Err(CryptoError::MalformedEnvelope(format!(
        "expected 4 parts, got {}",
        parts.len()
      )));
    }
    Self::from_hex_parts(parts[0], parts[1], parts[2], parts[3])
  }

  /// Ciphertext with the tag appended, as AES-GCM expects it.
  pub(crate) fn sealed(&self) -> Vec<u8> {
    let mut sealed = Vec::with_capacity(self.ciphertext.len() + TAG_LENGTH);
    sealed.extend_from_slice(&self.ciphertext);
    sealed.extend_from_slice(&self.tag);
    sealed
  }
}

impl fmt::Display for Envelope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}{sep}{}{sep}{}{sep}{}",
      hex::encode(self.salt),
      hex::encode(self.iv),
      hex::encode(&self.ciphertext),
      hex::encode(self.tag),
      sep = SEPARATOR
    )
  }
}

impl FromStr for Envelope {
  type Err = CryptoError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

/// Quick shape check used by the store to validate entries it reads back.
pub fn looks_like_envelope(s: &str) -> bool {
  Envelope::parse(s).is_ok()
}

fn decode_fixed<const N: usize>(part: &str, name: &str) -> CryptoResult<[u8; N]> {
  let bytes =
    hex::decode(part).map_err(|e| CryptoError::MalformedEnvelope(format!("{}: {}", name, e)))?;
  bytes.try_into().map_err(|b: Vec<u8>| {
    CryptoError::MalformedEnvelope(format!(
      "{}: expected {} bytes, got {}",
      name,
      N,
      b.len()
    ))
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample() -> Envelope {
    Envelope {
      salt: [0x11; SALT_LENGTH],
      iv: [0x22; IV_LENGTH],
      ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
      tag: [0x33; TAG_LENGTH],
    }
  }

  #[test]
  fn display_then_parse() {
    let env = sample();
    let text = env.to_string();
    assert_eq!(text.split(':').count(), 4);
    assert!(text.contains(":deadbeef:"));
    assert_eq!(Envelope::parse(&text).unwrap(), env);
  }

  #[test]
  fn rejects_wrong_part_count() {
    let err = Envelope::parse("aa:bb:cc").unwrap_err();
    assert!(err.to_string().contains("expected 4 parts, got 3"));
    assert!(Envelope::parse("").is_err());
    let five = format!("{}:00", sample());
    assert!(Envelope::parse(&five).is_err());
  }

  #[test]
  fn rejects_bad_hex() {
    let text = sample().to_string().replacen("deadbeef", "zzzz", 1);
    let err = Envelope::parse(&text).unwrap_err();
    assert!(err.to_string().contains("ciphertext"));
  }

  #[test]
  fn rejects_odd_length_hex() {
    let env = sample();
    let text = format!(
      "{}:{}:abc:{}",
      hex::encode(env.salt),
      hex::encode(env.iv),
      hex::encode(env.tag)
    );
    assert!(Envelope::parse(&text).is_err());
  }

  #[test]
  fn rejects_wrong_component_lengths() {
    let env = sample();
    let short_salt = format!(
      "{}:{}:00:{}",
      hex::encode([0u8; 8]),
      hex::encode(env.iv),
      hex::encode(env.tag)
    );
    let err = Envelope::parse(&short_salt).unwrap_err();
    assert!(err.to_string().contains("salt: expected 32 bytes, got 8"));

    let short_tag = format!(
      "{}:{}:00:{}",
      hex::encode(env.salt),
      hex::encode(env.iv),
      hex::encode([0u8; 4])
    );
    assert!(Envelope::parse(&short_tag).is_err());
  }

  #[test]
  fn sealed_appends_tag() {
    let env = sample();
    let sealed = env.sealed();
    assert_eq!(sealed.len(), 4 + TAG_LENGTH);
    assert_eq!(&sealed[..4], &[0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(&sealed[4..], &[0x33; TAG_LENGTH]);
  }

  #[test]
  fn shape_check() {
    assert!(looks_like_envelope(&sample().to_string()));
    assert!(!looks_like_envelope("plain text"));
  }
}
