//! BIP32 secp256k1 hierarchical deterministic key derivation.
//!
//! Derives Ethereum account keys from a BIP39 seed along BIP44 paths.
//! Unlike Ed25519 schemes, secp256k1 supports both hardened and normal
//! children, and the standard Ethereum path mixes them:
//!
//! ```text
//! m/44'/60'/0'/0/{index}
//! ```
//!
//! Reference: <https://github.com/bitcoin/bips/blob/master/bip-0032.mediawiki>

use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{FieldBytes, Scalar, SecretKey};
use keyward_types::{KeywardError, Result};
use sha2::Sha512;
use zeroize::{Zeroize, Zeroizing};

use crate::mnemonic::Seed;

/// HMAC-SHA512 type alias used throughout BIP32.
type HmacSha512 = Hmac<Sha512>;

/// The hardened index offset (0x80000000).
const HARDENED_OFFSET: u32 = 0x8000_0000;

/// HMAC key for master key generation.
const MASTER_HMAC_KEY: &[u8] = b"Bitcoin seed";

/// Ethereum BIP44 account prefix; the address index is appended.
pub const ETH_PATH_PREFIX: &str = "m/44'/60'/0'/0";

/// Returns the standard Ethereum derivation path for `index`.
pub fn eth_derivation_path(index: u32) -> String {
    format!("{ETH_PATH_PREFIX}/{index}")
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Derives the 32-byte secp256k1 private key at `path` from `seed`.
///
/// # Process
///
/// 1. Master: `I = HMAC-SHA512(key="Bitcoin seed", data=seed)`;
///    `IL` is the master key, `IR` the chain code.
/// 2. For each path component `i`:
///    - hardened: `data = 0x00 || k || ser32(i + 2^31)`
///    - normal:   `data = serP(point(k)) || ser32(i)` (compressed)
///
///    `I = HMAC-SHA512(key=chain_code, data)`; child key is
///    `(IL + k) mod n`, child chain code is `IR`.
///
/// # Errors
///
/// - [`KeywardError::ConfigError`] if the path is malformed.
/// - [`KeywardError::CryptoError`] if an intermediate key is invalid
///   (`IL >= n` or a zero child key, probability below 2^-127).
pub fn derive_private_key(seed: &Seed, path: &str) -> Result<Zeroizing<[u8; 32]>> {
    let components = parse_derivation_path(path)?;

    let (mut key, mut chain_code) = split_hmac(&hmac_sha512(MASTER_HMAC_KEY, seed.as_bytes())?);
    ensure_valid_key(&key)?;

    for &component in &components {
        let (child_key, child_chain) = derive_child(&key, &chain_code, component)?;
        key.zeroize();
        chain_code.zeroize();
        key = child_key;
        chain_code = child_chain;
    }

    chain_code.zeroize();
    let out = Zeroizing::new(key);
    key.zeroize();
    Ok(out)
}

// ---------------------------------------------------------------------------
// Internal: child derivation
// ---------------------------------------------------------------------------

/// Derives one child. `component` already carries the hardened bit.
fn derive_child(
    parent_key: &[u8; 32],
    parent_chain_code: &[u8; 32],
    component: u32,
) -> Result<([u8; 32], [u8; 32])> {
    let mut data = Vec::with_capacity(37);
    if component & HARDENED_OFFSET != 0 {
        data.push(0x00);
        data.extend_from_slice(parent_key);
    } else {
        let secret = SecretKey::from_slice(parent_key).map_err(|e| KeywardError::CryptoError {
            reason: format!("invalid parent key: {e}"),
        })?;
        let point = secret.public_key().to_encoded_point(true);
        data.extend_from_slice(point.as_bytes());
    }
    data.extend_from_slice(&component.to_be_bytes());

    let mut i = hmac_sha512(parent_chain_code, &data)?;
    data.zeroize();
    let (mut il, ir) = split_hmac(&i);
    i.zeroize();

    let tweak = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(&il)));
    il.zeroize();
    let tweak = tweak.ok_or_else(|| KeywardError::CryptoError {
        reason: "derived tweak exceeds curve order".into(),
    })?;
    let parent = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(parent_key)))
        .ok_or_else(|| KeywardError::CryptoError {
            reason: "parent key exceeds curve order".into(),
        })?;

    let child = tweak + parent;
    if bool::from(child.is_zero()) {
        return Err(KeywardError::CryptoError {
            reason: "derived child key is zero".into(),
        });
    }

    let mut child_key = [0u8; 32];
    child_key.copy_from_slice(&child.to_repr());
    Ok((child_key, ir))
}

fn ensure_valid_key(key: &[u8; 32]) -> Result<()> {
    SecretKey::from_slice(key)
        .map(|_| ())
        .map_err(|_| KeywardError::CryptoError {
            reason: "master key is not a valid secp256k1 scalar".into(),
        })
}

// ---------------------------------------------------------------------------
// Internal: HMAC-SHA512
// ---------------------------------------------------------------------------

fn hmac_sha512(key: &[u8], data: &[u8]) -> Result<[u8; 64]> {
    let mut mac = HmacSha512::new_from_slice(key).map_err(|e| KeywardError::CryptoError {
        reason: format!("HMAC-SHA512 key init failed: {e}"),
    })?;
    mac.update(data);
    let result = mac.finalize().into_bytes();

    let mut output = [0u8; 64];
    output.copy_from_slice(&result);
    Ok(output)
}

fn split_hmac(i: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut left = [0u8; 32];
    let mut right = [0u8; 32];
    left.copy_from_slice(&i[..32]);
    right.copy_from_slice(&i[32..]);
    (left, right)
}

// ---------------------------------------------------------------------------
// Path parsing
// ---------------------------------------------------------------------------

/// Parses a BIP32 path into child components.
///
/// Accepts `m/44'/60'/0'/0/0` style paths; `'` or `h` marks a hardened
/// component. Returned values have the hardened offset applied.
///
/// # Errors
///
/// Returns [`KeywardError::ConfigError`] if the path does not start
/// with `m`, a component is not a number, or an index is ≥ 2^31.
pub fn parse_derivation_path(path: &str) -> Result<Vec<u32>> {
    let mut parts = path.trim().split('/');
    if parts.next() != Some("m") {
        return Err(path_err(path, "must start with 'm'"));
    }

    parts
        .map(|part| {
            let (digits, hardened) = match part.strip_suffix('\'').or_else(|| part.strip_suffix('h')) {
                Some(d) => (d, true),
                None => (part, false),
            };
            let index: u32 = digits
                .parse()
                .map_err(|_| path_err(path, &format!("invalid component '{part}'")))?;
            if index >= HARDENED_OFFSET {
                return Err(path_err(path, &format!("index {index} out of range")));
            }
            Ok(if hardened { index | HARDENED_OFFSET } else { index })
        })
        .collect()
}

fn path_err(path: &str, detail: &str) -> KeywardError {
    KeywardError::ConfigError {
        reason: format!("invalid derivation path '{path}': {detail}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
