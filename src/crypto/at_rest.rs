//! At-rest encryption for stored message bodies and session records.
//!
//! AES in CBC mode with PKCS#5/7 padding, keyed by a fixed configured key.
//! This cipher is unrelated to the live session ciphers: whatever a session
//! decrypts is re-encrypted here before it touches storage.
//!
//! The default [`AtRestScheme::LegacyZeroIv`] layout uses an all-zero IV, so
//! equal plaintexts produce equal ciphertexts. That leaks message equality
//! to anyone who can read the database, and is kept only because existing
//! databases were written that way. [`AtRestScheme::RandomIv`] prepends a
//! fresh IV to every record.

use crate::utils::{CryptoError, Result};
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

/// Record layout for at-rest ciphertext
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AtRestScheme {
    /// `CBC(key, iv = 0, pad(plaintext))`
    LegacyZeroIv,
    /// `iv || CBC(key, iv, pad(plaintext))` with a random IV per record
    RandomIv,
}

/// Pad `data` to a multiple of `block_size`.
///
/// Always appends between 1 and `block_size` bytes, each equal to the number
/// of bytes appended, so input that is already block-aligned gains a full block.
pub fn pkcs7_pad(data: &[u8], block_size: usize) -> Vec<u8> {
    let padding = block_size - data.len() % block_size;
    let mut padded = Vec::with_capacity(data.len() + padding);
    padded.extend_from_slice(data);
    padded.resize(data.len() + padding, padding as u8);
    padded
}

/// Strip the padding added by [`pkcs7_pad`]: the last byte is the pad
/// length and exactly that many bytes are trimmed.
///
/// # Errors
///
/// Returns `CryptoError::Decryption` when the pad length is zero, larger than
/// a block or larger than the data
pub fn pkcs7_unpad(data: &[u8], block_size: usize) -> Result<&[u8]> {
    let Some(&last) = data.last() else {
        return Err(CryptoError::Decryption {
            reason: "cannot unpad empty data".to_string(),
        }
        .into());
    };

    let padding = usize::from(last);
    if padding == 0 || padding > block_size || padding > data.len() {
        return Err(CryptoError::Decryption {
            reason: format!("invalid padding length {padding}"),
        }
        .into());
    }

    Ok(&data[..data.len() - padding])
}

/// The at-rest cipher
#[derive(Clone)]
pub struct AtRestCipher {
    key: Zeroizing<Vec<u8>>,
    scheme: AtRestScheme,
}

impl fmt::Debug for AtRestCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtRestCipher")
            .field("key", &"[REDACTED]")
            .field("key_bits", &(self.key.len() * 8))
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl AtRestCipher {
    /// Build the cipher from raw key bytes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` unless the key is 16, 24 or 32 bytes
    pub fn new(key: &[u8], scheme: AtRestScheme) -> Result<Self> {
        if !matches!(key.len(), 16 | 24 | 32) {
            return Err(CryptoError::InvalidKey {
                reason: format!(
                    "at-rest key must be 16, 24 or 32 bytes, got {}",
                    key.len()
                ),
            }
            .into());
        }

        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
            scheme,
        })
    }

    /// Encrypt one record
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let padded = pkcs7_pad(plaintext, BLOCK_SIZE);
        match self.scheme {
            AtRestScheme::LegacyZeroIv => self.cbc_encrypt(&ZERO_IV, &padded),
            AtRestScheme::RandomIv => {
                let mut iv = [0u8; BLOCK_SIZE];
                rand::RngCore::fill_bytes(&mut OsRng, &mut iv);

                let mut record = iv.to_vec();
                record.extend(self.cbc_encrypt(&iv, &padded)?);
                Ok(record)
            }
        }
    }

    /// Decrypt one record produced by [`AtRestCipher::encrypt`]
    pub fn decrypt(&self, record: &[u8]) -> Result<Vec<u8>> {
        let (iv, ciphertext) = match self.scheme {
            AtRestScheme::LegacyZeroIv => (ZERO_IV, record),
            AtRestScheme::RandomIv => {
                if record.len() < BLOCK_SIZE {
                    return Err(CryptoError::Decryption {
                        reason: "record shorter than its IV".to_string(),
                    }
                    .into());
                }
                let mut iv = [0u8; BLOCK_SIZE];
                iv.copy_from_slice(&record[..BLOCK_SIZE]);
                (iv, &record[BLOCK_SIZE..])
            }
        };

        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Decryption {
                reason: format!(
                    "ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
                    ciphertext.len()
                ),
            }
            .into());
        }

        let padded = Zeroizing::new(self.cbc_decrypt(&iv, ciphertext)?);
        Ok(pkcs7_unpad(&padded, BLOCK_SIZE)?.to_vec())
    }

    fn cbc_encrypt(&self, iv: &[u8; BLOCK_SIZE], padded: &[u8]) -> Result<Vec<u8>> {
        let key = self.key.as_slice();
        let encrypted = match key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map(|c| c.encrypt_padded_vec_mut::<NoPadding>(padded)),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map(|c| c.encrypt_padded_vec_mut::<NoPadding>(padded)),
            _ => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map(|c| c.encrypt_padded_vec_mut::<NoPadding>(padded)),
        };

        encrypted.map_err(|e| {
            CryptoError::InvalidKey {
                reason: e.to_string(),
            }
            .into()
        })
    }

    fn cbc_decrypt(&self, iv: &[u8; BLOCK_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.key.as_slice();
        let decrypted = match key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
                .map(|c| c.decrypt_padded_vec_mut::<NoPadding>(ciphertext)),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
                .map(|c| c.decrypt_padded_vec_mut::<NoPadding>(ciphertext)),
            _ => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                .map(|c| c.decrypt_padded_vec_mut::<NoPadding>(ciphertext)),
        };

        match decrypted {
            Ok(Ok(plaintext)) => Ok(plaintext),
            Ok(Err(_)) => Err(CryptoError::Decryption {
                reason: "ciphertext is not block aligned".to_string(),
            }
            .into()),
            Err(e) => Err(CryptoError::InvalidKey {
                reason: e.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn padding_follows_block_arithmetic() {
        let padded = pkcs7_pad(b"hello", BLOCK_SIZE);
        assert_eq!(padded.len(), BLOCK_SIZE);
        assert!(padded[5..].iter().all(|&b| b == 11));

        let aligned = pkcs7_pad(&[0x41; BLOCK_SIZE], BLOCK_SIZE);
        assert_eq!(aligned.len(), 2 * BLOCK_SIZE);
        assert!(aligned[BLOCK_SIZE..].iter().all(|&b| b == BLOCK_SIZE as u8));

        assert_eq!(pkcs7_unpad(&aligned, BLOCK_SIZE).unwrap(), &[0x41; BLOCK_SIZE][..]);
        assert_eq!(pkcs7_unpad(&pkcs7_pad(b"", BLOCK_SIZE), BLOCK_SIZE).unwrap(), b"");
    }

    #[test]
    fn unpad_rejects_bad_lengths() {
        assert!(pkcs7_unpad(&[], BLOCK_SIZE).is_err());
        assert!(pkcs7_unpad(&[1, 2, 3, 0], BLOCK_SIZE).is_err());
        assert!(pkcs7_unpad(&[17; 16], BLOCK_SIZE).is_err());
        assert!(pkcs7_unpad(&[4, 4, 4], BLOCK_SIZE).is_err());
    }

    #[test]
    fn rejects_invalid_key_lengths() {
        assert!(AtRestCipher::new(b"short", AtRestScheme::LegacyZeroIv).is_err());
        assert!(AtRestCipher::new(&[0u8; 33], AtRestScheme::LegacyZeroIv).is_err());
        for len in [16, 24, 32] {
            assert!(AtRestCipher::new(&vec![1u8; len], AtRestScheme::LegacyZeroIv).is_ok());
        }
    }

    #[test]
    fn legacy_scheme_is_deterministic() {
        let cipher = AtRestCipher::new(KEY, AtRestScheme::LegacyZeroIv).unwrap();
        let a = cipher.encrypt(b"Hello world").unwrap();
        let b = cipher.encrypt(b"Hello world").unwrap();

        assert_eq!(a, b);
        assert_eq!(a.len(), BLOCK_SIZE);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"Hello world");
    }

    #[test]
    fn random_iv_scheme_differs_per_record() {
        let cipher = AtRestCipher::new(KEY, AtRestScheme::RandomIv).unwrap();
        let a = cipher.encrypt(b"Hello world").unwrap();
        let b = cipher.encrypt(b"Hello world").unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), 2 * BLOCK_SIZE);
        assert_eq!(cipher.decrypt(&a).unwrap(), b"Hello world");
        assert_eq!(cipher.decrypt(&b).unwrap(), b"Hello world");
    }

    #[test]
    fn every_key_size_handles_block_aligned_input() {
        let plaintext = [0x5a; 3 * BLOCK_SIZE];
        for len in [16, 24, 32] {
            let cipher = AtRestCipher::new(&KEY[..len], AtRestScheme::LegacyZeroIv).unwrap();
            let record = cipher.encrypt(&plaintext).unwrap();
            assert_eq!(record.len(), 4 * BLOCK_SIZE);
            assert_eq!(cipher.decrypt(&record).unwrap(), plaintext);
        }
    }

    #[test]
    fn wrong_key_or_truncation_fails_cleanly() {
        let cipher = AtRestCipher::new(KEY, AtRestScheme::LegacyZeroIv).unwrap();
        let record = cipher.encrypt(b"secret").unwrap();

        assert!(cipher.decrypt(&record[..7]).is_err());
        assert!(cipher.decrypt(&[]).is_err());

        let other = AtRestCipher::new(b"fedcba9876543210fedcba9876543210", AtRestScheme::LegacyZeroIv)
            .unwrap();
        // A wrong key almost always yields an invalid pad byte; when it does
        // not, the plaintext still differs.
        match other.decrypt(&record) {
            Ok(plaintext) => assert_ne!(plaintext, b"secret"),
            Err(_) => {}
        }
    }
}
