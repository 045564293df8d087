//! License key and machine id formats
//!
//! License keys look like `XXXXX-XXXXX-XXXXX-XXXXX` over an alphabet without
//! ambiguous glyphs. The last character is a weighted checksum of the other
//! nineteen, so typos are rejected before touching the database.

use rand::Rng;

use crate::prelude::*;

const ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GROUPS: usize = 4;
const GROUP_LEN: usize = 5;
const BODY_LEN: usize = GROUPS * GROUP_LEN - 1;

fn index_of(c: u8) -> Option<usize> {
  ALPHABET.iter().position(|&a| a == c)
}

fn checksum(body: &[u8]) -> u8 {
  let sum: usize = body
    .iter()
    .enumerate()
    .filter_map(|(i, &c)| index_of(c).map(|idx| idx * (i + 1)))
    .sum();
  ALPHABET[sum % ALPHABET.len()]
}

fn group(chars: &[u8]) -> String {
  chars
    .chunks(GROUP_LEN)
    .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
    .collect::<Vec<_>>()
    .join("-")
}

pub fn generate_license_key() -> String {
  let mut rng = rand::thread_rng();
  let mut chars: Vec<u8> = (0..BODY_LEN)
    .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())])
    .collect();
  chars.push(checksum(&chars));
  group(&chars)
}

/// Returns the canonical (upper-case, dashed) key or `InvalidLicenseKey`.
/// Dashes must sit between the groups and nowhere else.
pub fn normalize_license_key(raw: &str) -> Result<String> {
  let raw = raw.trim().as_bytes();
  if raw.len() != BODY_LEN + GROUPS {
    return Err(Error::InvalidLicenseKey);
  }

  let mut chars = Vec::with_capacity(BODY_LEN + 1);
  for (i, &c) in raw.iter().enumerate() {
    let separator = (i + 1) % (GROUP_LEN + 1) == 0;
    match (separator, c) {
      (true, b'-') => {}
      (false, c) if index_of(c.to_ascii_uppercase()).is_some() => {
        chars.push(c.to_ascii_uppercase());
      }
      _ => return Err(Error::InvalidLicenseKey),
    }
  }

  if checksum(&chars[..BODY_LEN]) != chars[BODY_LEN] {
    return Err(Error::InvalidLicenseKey);
  }

  Ok(group(&chars))
}

/// Machine ids are SHA-256 hex digests of the client-side fingerprint.
pub fn normalize_machine_id(raw: &str) -> Result<String> {
  let id = raw.trim().to_ascii_lowercase();
  if id.len() == 64 && id.bytes().all(|c| c.is_ascii_hexdigit()) {
    Ok(id)
  } else {
    Err(Error::InvalidMachineId)
  }
}

#[cfg(test)]
pub(crate) fn machine_id(seed: &str) -> String {
  use sha2::{Digest, Sha256};
  hex::encode(Sha256::digest(seed.as_bytes()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_keys_validate() {
    for _ in 0..64 {
      let key = generate_license_key();
      assert_eq!(key.len(), 23);
      assert_eq!(normalize_license_key(&key).unwrap(), key);
      assert_eq!(normalize_license_key(&key.to_lowercase()).unwrap(), key);
    }
  }

  #[test]
  fn typo_breaks_checksum() {
    let key = generate_license_key();
    let mut bytes = key.into_bytes();
    bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
    let typo = String::from_utf8(bytes).unwrap();

    assert!(matches!(
      normalize_license_key(&typo),
      Err(Error::InvalidLicenseKey)
    ));
  }

  #[test]
  fn rejects_wrong_shapes() {
    for bad in ["", "ABCDE", "ABCDE-ABCDE-ABCDE-ABCD0", "ABCDEABCDEABCDEABCDE"] {
      assert!(normalize_license_key(bad).is_err(), "{bad}");
    }
  }

  #[test]
  fn dashes_only_between_groups() {
    let key = generate_license_key();
    let body: String = key.chars().filter(|&c| c != '-').collect();

    let leading = format!("---{body}");
    let shifted = format!(
      "{}-{}-{}-{}",
      &body[..4],
      &body[4..10],
      &body[10..15],
      &body[15..]
    );
    for bad in [leading, shifted] {
      assert_eq!(bad.len(), 23);
      assert!(
        matches!(normalize_license_key(&bad), Err(Error::InvalidLicenseKey)),
        "{bad}"
      );
    }
  }

  #[test]
  fn machine_ids_are_hex_digests() {
    let id = machine_id("laptop");
    assert_eq!(normalize_machine_id(&id.to_uppercase()).unwrap(), id);
    assert!(matches!(
      normalize_machine_id("not-a-hash"),
      Err(Error::InvalidMachineId)
    ));
    assert!(normalize_machine_id(&id[..63]).is_err());
  }
}
