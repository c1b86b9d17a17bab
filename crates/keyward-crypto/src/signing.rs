//! Ethereum secp256k1 keys, addresses, and message signatures.
//!
//! Addresses are the last 20 bytes of `keccak256(uncompressed_pubkey[1..])`.
//! Message signatures follow EIP-191 (`personal_sign`) and are encoded
//! as 65 bytes `r || s || v` with `v ∈ {27, 28}`. The private key is
//! zeroized on drop by `k256`'s `SigningKey`.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::FieldBytes;
use keyward_types::{Address, KeywardError, Result};
use sha3::{Digest, Keccak256};

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Computes Keccak-256 (the pre-standard SHA-3 variant Ethereum uses).
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// Computes the EIP-191 `personal_sign` digest:
/// `keccak256("\x19Ethereum Signed Message:\n" || len(message) || message)`.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(message.len().to_string().as_bytes());
    hasher.update(message);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Derives the Ethereum address of a verifying key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&hash[12..]);
    Address::new(bytes)
}

/// Renders an address with the EIP-55 mixed-case checksum.
pub fn to_checksum_address(address: &Address) -> String {
    let lower = hex::encode(address.as_bytes());
    let hash = keccak256(lower.as_bytes());

    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// RecoverableSignature
// ---------------------------------------------------------------------------

/// A secp256k1 signature with its recovery id.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecoverableSignature {
    /// Big-endian `r`.
    pub r: [u8; 32],
    /// Big-endian, low-S normalized `s`.
    pub s: [u8; 32],
    /// Recovery id (0 or 1).
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// Encodes as 65 bytes `r || s || (27 + recovery_id)`.
    pub fn to_rsv_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = 27 + self.recovery_id;
        out
    }
}

// ---------------------------------------------------------------------------
// EthKey
// ---------------------------------------------------------------------------

/// An Ethereum signing key and its cached address.
pub struct EthKey {
    signing_key: SigningKey,
    address: Address,
}

// EthKey does not implement Clone/Debug to prevent leakage.

impl EthKey {
    /// Builds a key from 32 raw private-key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::InvalidSecret`] if the bytes are zero or
    /// not below the curve order.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let signing_key = SigningKey::from_bytes(FieldBytes::from_slice(bytes))
            .map_err(|_| KeywardError::InvalidSecret)?;
        let address = address_of(signing_key.verifying_key());
        Ok(Self {
            signing_key,
            address,
        })
    }

    /// Parses a `0x`-prefixed 64-hex-character private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::InvalidSecret`] on any format error.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let body = hex_key
            .trim()
            .strip_prefix("0x")
            .ok_or(KeywardError::InvalidSecret)?;
        if body.len() != 64 {
            return Err(KeywardError::InvalidSecret);
        }
        let mut bytes = zeroize::Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(body, bytes.as_mut_slice()).map_err(|_| KeywardError::InvalidSecret)?;
        Self::from_bytes(&bytes)
    }

    /// The account address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs a 32-byte digest.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::CryptoError`] if signing fails.
    pub fn sign_prehash(&self, digest: &[u8; 32]) -> Result<RecoverableSignature> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest)
            .map_err(|e| KeywardError::CryptoError {
                reason: format!("secp256k1 signing failed: {e}"),
            })?;

        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);

        Ok(RecoverableSignature {
            r,
            s,
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// Produces an EIP-191 `personal_sign` signature over `message`.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::CryptoError`] if signing fails.
    pub fn personal_sign(&self, message: &[u8]) -> Result<[u8; 65]> {
        Ok(self.sign_prehash(&eip191_hash(message))?.to_rsv_bytes())
    }
}

/// Recovers the signer address of a 65-byte `personal_sign` signature.
///
/// # Errors
///
/// Returns [`KeywardError::CryptoError`] if the signature is malformed
/// or recovery fails.
pub fn recover_personal_signer(message: &[u8], signature: &[u8; 65]) -> Result<Address> {
    recover_prehash_signer(&eip191_hash(message), signature)
}

/// Recovers the signer address of a 65-byte signature over a digest.
///
/// Accepts `v` as either 0/1 or 27/28.
///
/// # Errors
///
/// Returns [`KeywardError::CryptoError`] if the signature is malformed
/// or recovery fails.
pub fn recover_prehash_signer(digest: &[u8; 32], signature: &[u8; 65]) -> Result<Address> {
    let sig = Signature::from_slice(&signature[..64]).map_err(|e| KeywardError::CryptoError {
        reason: format!("malformed signature: {e}"),
    })?;
    let v = signature[64];
    let recid = RecoveryId::from_byte(if v >= 27 { v - 27 } else { v }).ok_or_else(|| {
        KeywardError::CryptoError {
            reason: format!("invalid recovery byte {v}"),
        }
    })?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recid).map_err(|e| {
        KeywardError::CryptoError {
            reason: format!("signature recovery failed: {e}"),
        }
    })?;
    Ok(address_of(&key))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
