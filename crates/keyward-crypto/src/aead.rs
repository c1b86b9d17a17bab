//! AES-256-GCM authenticated encryption with a detached tag.
//!
//! Keystore envelopes store the IV, ciphertext and authentication tag
//! as separate fields, so this module works with detached tags and a
//! 128-bit (16-byte) IV instead of the usual 96-bit GCM nonce. IVs are
//! generated from OS entropy and **must never be reused** with the
//! same key.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use keyward_types::{KeywardError, Result};
use rand::rngs::OsRng;
use rand::RngCore;

/// AES-256-GCM instantiated with a 16-byte IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// IV length in bytes.
pub const IV_LEN: usize = 16;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Iv
// ---------------------------------------------------------------------------

/// 128-bit initialization vector for AES-256-GCM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Iv([u8; IV_LEN]);

impl Iv {
    /// Creates an [`Iv`] from raw bytes.
    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying 16-byte array.
    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }
}

/// Generates a fresh random IV from OS entropy.
pub fn generate_iv() -> Iv {
    let mut bytes = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut bytes);
    Iv(bytes)
}

// ---------------------------------------------------------------------------
// SealedBox
// ---------------------------------------------------------------------------

/// Output of [`encrypt_aes256gcm`]: ciphertext and detached tag.
#[derive(Clone, Debug)]
pub struct SealedBox {
    /// Encrypted payload, same length as the plaintext.
    pub ciphertext: Vec<u8>,
    /// 16-byte GCM authentication tag.
    pub tag: [u8; TAG_LEN],
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` with AES-256-GCM.
///
/// # Errors
///
/// Returns [`KeywardError::CryptoError`] if the cipher rejects the
/// input (e.g. plaintext beyond the GCM length limit).
pub fn encrypt_aes256gcm(key: &[u8; 32], iv: &Iv, plaintext: &[u8]) -> Result<SealedBox> {
    let cipher = new_cipher(key)?;
    let mut buffer = plaintext.to_vec();

    let tag = cipher
        .encrypt_in_place_detached(Nonce::<U16>::from_slice(&iv.0), &[], &mut buffer)
        .map_err(|e| KeywardError::CryptoError {
            reason: format!("AES-256-GCM encryption failed: {e}"),
        })?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(&tag);

    Ok(SealedBox {
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypts `ciphertext` with AES-256-GCM, verifying the detached tag.
///
/// The returned buffer holds plaintext; callers are responsible for
/// wiping it (the envelope layer wraps it in `Zeroizing`).
///
/// # Errors
///
/// Returns [`KeywardError::InvalidPassword`] when the tag does not
/// verify. A wrong key and a tampered ciphertext are indistinguishable
/// at this layer and are reported the same way.
pub fn decrypt_aes256gcm(
    key: &[u8; 32],
    iv: &Iv,
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>> {
    let cipher = new_cipher(key)?;
    let mut buffer = ciphertext.to_vec();

    cipher
        .decrypt_in_place_detached(
            Nonce::<U16>::from_slice(&iv.0),
            &[],
            &mut buffer,
            Tag::<U16>::from_slice(tag),
        )
        .map_err(|_| KeywardError::InvalidPassword)?;

    Ok(buffer)
}

fn new_cipher(key: &[u8; 32]) -> Result<Aes256Gcm16> {
    Aes256Gcm16::new_from_slice(key).map_err(|e| KeywardError::CryptoError {
        reason: format!("AES-256-GCM key init failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() -> std::result::Result<(), KeywardError> {
        let key = [0x42u8; 32];
        let iv = generate_iv();
        let sealed = encrypt_aes256gcm(&key, &iv, b"secret payload")?;
        assert_eq!(sealed.ciphertext.len(), b"secret payload".len());
        let plain = decrypt_aes256gcm(&key, &iv, &sealed.ciphertext, &sealed.tag)?;
        assert_eq!(plain, b"secret payload");
        Ok(())
    }

    #[test]
    fn wrong_key_is_invalid_password() -> std::result::Result<(), KeywardError> {
        let iv = generate_iv();
        let sealed = encrypt_aes256gcm(&[1u8; 32], &iv, b"data")?;
        let result = decrypt_aes256gcm(&[2u8; 32], &iv, &sealed.ciphertext, &sealed.tag);
        assert!(matches!(result, Err(KeywardError::InvalidPassword)));
        Ok(())
    }

    #[test]
    fn tampered_tag_rejected() -> std::result::Result<(), KeywardError> {
        let key = [3u8; 32];
        let iv = generate_iv();
        let mut sealed = encrypt_aes256gcm(&key, &iv, b"data")?;
        sealed.tag[0] ^= 0x01;
        assert!(decrypt_aes256gcm(&key, &iv, &sealed.ciphertext, &sealed.tag).is_err());
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_rejected() -> std::result::Result<(), KeywardError> {
        let key = [4u8; 32];
        let iv = generate_iv();
        let mut sealed = encrypt_aes256gcm(&key, &iv, b"data")?;
        sealed.ciphertext[0] ^= 0x80;
        assert!(decrypt_aes256gcm(&key, &iv, &sealed.ciphertext, &sealed.tag).is_err());
        Ok(())
    }

    #[test]
    fn ivs_are_unique() {
        assert_ne!(generate_iv(), generate_iv());
    }
}
