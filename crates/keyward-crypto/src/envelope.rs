//! Password-sealed envelope: scrypt key derivation + AES-256-GCM.
//!
//! An [`EncryptedEnvelope`] is the `crypto` section of a keystore file.
//! It is self-describing: the KDF parameters, salt, IV and tag travel
//! with the ciphertext, and binary fields are hex encoded.
//!
//! ```text
//! {
//!   "algorithm": "aes-256-gcm",
//!   "salt": "<32 bytes hex>",
//!   "iv": "<16 bytes hex>",
//!   "authTag": "<16 bytes hex>",
//!   "ciphertext": "<hex>",
//!   "scryptParams": { "N": 16384, "r": 8, "p": 1, "dklen": 32 }
//! }
//! ```

use keyward_types::{KeywardError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::aead::{decrypt_aes256gcm, encrypt_aes256gcm, generate_iv, Iv, IV_LEN, TAG_LEN};
use crate::kdf::{scrypt_derive_key, ScryptParams};

/// Algorithm identifier written into every envelope.
pub const ALGORITHM: &str = "aes-256-gcm";

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;

// ---------------------------------------------------------------------------
// EncryptedEnvelope
// ---------------------------------------------------------------------------

/// Authenticated, password-sealed ciphertext. Never contains plaintext.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Always [`ALGORITHM`].
    pub algorithm: String,
    /// Random per-envelope scrypt salt.
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    /// Random per-envelope AES-GCM IV.
    #[serde(with = "hex_bytes")]
    pub iv: Vec<u8>,
    /// Detached GCM authentication tag.
    #[serde(with = "hex_bytes")]
    pub auth_tag: Vec<u8>,
    /// AES-256-GCM ciphertext.
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
    /// scrypt parameters used to derive the key.
    pub scrypt_params: ScryptParams,
}

/// Seals `plaintext` under `password`.
///
/// A fresh random salt and IV are drawn for every call, so sealing
/// the same plaintext twice produces unrelated envelopes.
///
/// # Errors
///
/// - [`KeywardError::ConfigError`] if `params` are invalid.
/// - [`KeywardError::CryptoError`] if derivation or encryption fails.
pub fn encrypt(plaintext: &[u8], password: &[u8], params: &ScryptParams) -> Result<EncryptedEnvelope> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let iv = generate_iv();

    let key = scrypt_derive_key(password, &salt, params)?;
    let sealed = encrypt_aes256gcm(key.as_bytes(), &iv, plaintext)?;

    Ok(EncryptedEnvelope {
        algorithm: ALGORITHM.to_string(),
        salt,
        iv: iv.as_bytes().to_vec(),
        auth_tag: sealed.tag.to_vec(),
        ciphertext: sealed.ciphertext,
        scrypt_params: *params,
    })
}

/// Opens an envelope with `password`.
///
/// # Errors
///
/// - [`KeywardError::InvalidPassword`] if the authentication tag does
///   not verify (wrong password or tampered ciphertext).
/// - [`KeywardError::Corrupt`] if the envelope is structurally
///   malformed: unknown algorithm, wrong IV/tag length, short salt, or
///   unusable scrypt parameters.
pub fn decrypt(envelope: &EncryptedEnvelope, password: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.algorithm != ALGORITHM {
        return Err(corrupt(format!("unsupported algorithm '{}'", envelope.algorithm)));
    }
    if envelope.salt.len() < 16 {
        return Err(corrupt(format!("salt too short ({} bytes)", envelope.salt.len())));
    }
    let iv: [u8; IV_LEN] = envelope
        .iv
        .as_slice()
        .try_into()
        .map_err(|_| corrupt(format!("iv must be {IV_LEN} bytes, got {}", envelope.iv.len())))?;
    let tag: [u8; TAG_LEN] = envelope.auth_tag.as_slice().try_into().map_err(|_| {
        corrupt(format!(
            "auth tag must be {TAG_LEN} bytes, got {}",
            envelope.auth_tag.len()
        ))
    })?;

    let key = scrypt_derive_key(password, &envelope.salt, &envelope.scrypt_params).map_err(|e| match e {
        KeywardError::ConfigError { reason } => corrupt(reason),
        other => other,
    })?;

    let plaintext = decrypt_aes256gcm(key.as_bytes(), &Iv::from_bytes(iv), &envelope.ciphertext, &tag)?;
    Ok(Zeroizing::new(plaintext))
}

fn corrupt(reason: String) -> KeywardError {
    KeywardError::Corrupt { reason }
}

// ---------------------------------------------------------------------------
// Hex serde helpers
// ---------------------------------------------------------------------------

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
