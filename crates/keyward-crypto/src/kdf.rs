//! scrypt key derivation for keystore encryption.
//!
//! Derives a 256-bit encryption key from a user-supplied password and
//! random salt. Parameters are carried inside every envelope so that a
//! keystore written with one cost can still be opened after the
//! configured default changes.

use keyward_types::config::SCRYPT_MAX_MEMORY_BYTES;
use keyward_types::{KeywardError, Result};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// ScryptParams
// ---------------------------------------------------------------------------

/// Tuning parameters for scrypt.
///
/// # Defaults
///
/// | Parameter | Default | Meaning |
/// |-----------|---------|---------|
/// | `n`       | 16 384  | CPU/memory cost (power of two) |
/// | `r`       | 8       | Block size |
/// | `p`       | 1       | Parallelism |
/// | `dklen`   | 32      | Output length in bytes |
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScryptParams {
    /// CPU/memory cost. Must be a power of two ≥ 2.
    #[serde(rename = "N")]
    pub n: u32,
    /// Block size. Must be ≥ 1.
    pub r: u32,
    /// Parallelism. Must be ≥ 1.
    pub p: u32,
    /// Derived key length. Always 32 for AES-256.
    pub dklen: usize,
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self {
            n: 16_384,
            r: 8,
            p: 1,
            dklen: DerivedKey::LEN,
        }
    }
}

impl ScryptParams {
    /// Builds parameters with the standard 32-byte output length.
    pub fn new(n: u32, r: u32, p: u32) -> Self {
        Self {
            n,
            r,
            p,
            dklen: DerivedKey::LEN,
        }
    }

    /// Working memory scrypt needs for these parameters, in bytes.
    pub fn memory_bytes(&self) -> u64 {
        128 * u64::from(self.r) * u64::from(self.n)
    }

    /// Checks the parameters against the structural rules and the
    /// memory cap, returning the `log2(N)` scrypt expects.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::ConfigError`] if any rule fails.
    pub fn validate(&self) -> Result<u8> {
        if self.n < 2 || !self.n.is_power_of_two() {
            return Err(KeywardError::ConfigError {
                reason: format!("scrypt N must be a power of two >= 2, got {}", self.n),
            });
        }
        if self.r == 0 || self.p == 0 {
            return Err(KeywardError::ConfigError {
                reason: "scrypt r and p must be greater than 0".into(),
            });
        }
        if self.dklen != DerivedKey::LEN {
            return Err(KeywardError::ConfigError {
                reason: format!("scrypt dklen must be {}, got {}", DerivedKey::LEN, self.dklen),
            });
        }
        if self.memory_bytes() > SCRYPT_MAX_MEMORY_BYTES {
            return Err(KeywardError::ConfigError {
                reason: format!(
                    "scrypt parameters need {} bytes, cap is {SCRYPT_MAX_MEMORY_BYTES}",
                    self.memory_bytes()
                ),
            });
        }
        Ok(self.n.trailing_zeros() as u8)
    }
}

// ---------------------------------------------------------------------------
// DerivedKey
// ---------------------------------------------------------------------------

/// 256-bit key derived by scrypt.
///
/// Zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    /// Fixed byte length of the derived key.
    pub const LEN: usize = 32;

    /// Returns the raw 32-byte key material.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// DerivedKey does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Minimum accepted salt length.
const MIN_SALT_LEN: usize = 16;

/// Derives a 256-bit key from a password and salt using scrypt.
///
/// # Errors
///
/// - [`KeywardError::ConfigError`] if the parameters are invalid or
///   exceed the memory cap, or the salt is shorter than 16 bytes.
/// - [`KeywardError::CryptoError`] if the scrypt computation fails.
pub fn scrypt_derive_key(password: &[u8], salt: &[u8], params: &ScryptParams) -> Result<DerivedKey> {
    if salt.len() < MIN_SALT_LEN {
        return Err(KeywardError::ConfigError {
            reason: format!("salt must be at least {MIN_SALT_LEN} bytes, got {}", salt.len()),
        });
    }

    let log_n = params.validate()?;
    let scrypt_params = scrypt::Params::new(log_n, params.r, params.p, DerivedKey::LEN)
        .map_err(|e| KeywardError::ConfigError {
            reason: format!("invalid scrypt parameters: {e}"),
        })?;

    let mut output = [0u8; 32];
    scrypt::scrypt(password, salt, &scrypt_params, &mut output).map_err(|e| {
        KeywardError::CryptoError {
            reason: format!("scrypt derivation failed: {e}"),
        }
    })?;

    Ok(DerivedKey(output))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Light parameters suitable for fast unit tests.
    fn test_params() -> ScryptParams {
        ScryptParams::new(1024, 8, 1)
    }

    #[test]
    fn derive_key_is_deterministic() -> std::result::Result<(), KeywardError> {
        let salt = [7u8; 32];
        let a = scrypt_derive_key(b"password123", &salt, &test_params())?;
        let b = scrypt_derive_key(b"password123", &salt, &test_params())?;
        assert_eq!(a.as_bytes(), b.as_bytes());
        Ok(())
    }

    #[test]
    fn different_salt_different_key() -> std::result::Result<(), KeywardError> {
        let a = scrypt_derive_key(b"password123", &[1u8; 32], &test_params())?;
        let b = scrypt_derive_key(b"password123", &[2u8; 32], &test_params())?;
        assert_ne!(a.as_bytes(), b.as_bytes());
        Ok(())
    }

    #[test]
    fn default_params_within_cap() {
        let params = ScryptParams::default();
        assert_eq!(params.memory_bytes(), 16 * 1024 * 1024);
        assert_eq!(params.validate().ok(), Some(14));
    }

    #[test]
    fn non_power_of_two_rejected() {
        let params = ScryptParams::new(1000, 8, 1);
        assert!(params.validate().is_err());
    }

    #[test]
    fn memory_cap_rejected() {
        let params = ScryptParams::new(1 << 20, 8, 1);
        assert!(matches!(
            scrypt_derive_key(b"pw", &[0u8; 32], &params),
            Err(KeywardError::ConfigError { .. })
        ));
    }

    #[test]
    fn short_salt_rejected() {
        assert!(scrypt_derive_key(b"pw", &[0u8; 8], &test_params()).is_err());
    }

    #[test]
    fn params_serialize_with_capital_n() -> std::result::Result<(), serde_json::Error> {
        let json = serde_json::to_value(ScryptParams::default())?;
        assert_eq!(json["N"], 16_384);
        assert_eq!(json["r"], 8);
        assert_eq!(json["p"], 1);
        assert_eq!(json["dklen"], 32);
        Ok(())
    }
}
