//! HMAC-SHA256 and HKDF helpers shared by the session engines.

use crate::utils::{CryptoError, Result};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of every symmetric key and MAC tag used by the engines
pub const KEY_SIZE: usize = 32;

/// Compute an HMAC-SHA256 tag over the concatenation of `parts`
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; KEY_SIZE]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| CryptoError::KeyDerivation {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    for part in parts {
        mac.update(part);
    }

    let mut output = [0u8; KEY_SIZE];
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

/// Verify an HMAC-SHA256 tag in constant time
pub fn verify_hmac_sha256(key: &[u8], parts: &[&[u8]], expected: &[u8]) -> Result<()> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| CryptoError::KeyDerivation {
        reason: format!("HMAC-SHA256 key init failed: {e}"),
    })?;
    for part in parts {
        mac.update(part);
    }

    mac.verify_slice(expected)
        .map_err(|_| CryptoError::SignatureVerification.into())
}

/// Expand `ikm` into one key per label
pub fn hkdf_expand(salt: &[u8], ikm: &[u8], label: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(label, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation {
            reason: format!("HKDF expansion failed for {}", String::from_utf8_lossy(label)),
        })?;
    Ok(okm)
}

/// Fresh random 32-byte value
pub fn random_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_roundtrip_over_parts() {
        let key = [7u8; 32];
        let tag = hmac_sha256(&key, &[&b"hello "[..], &b"world"[..]]).unwrap();

        assert!(verify_hmac_sha256(&key, &[&b"hello world"[..]], &tag).is_ok());
        assert!(verify_hmac_sha256(&key, &[&b"hello there"[..]], &tag).is_err());
        assert!(verify_hmac_sha256(&[8u8; 32], &[&b"hello world"[..]], &tag).is_err());
    }

    #[test]
    fn hkdf_labels_are_independent() {
        let a = hkdf_expand(b"salt", b"secret", b"one").unwrap();
        let b = hkdf_expand(b"salt", b"secret", b"two").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, hkdf_expand(b"salt", b"secret", b"one").unwrap());
    }
}
