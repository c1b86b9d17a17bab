//! Known-answer tests for Ethereum HD derivation and signing.
//!
//! Vectors sourced from:
//! - Hardhat / Anvil default accounts (`test test ... junk`)
//! - BIP44 Ethereum derivation of the all-`abandon` mnemonic
//! - EIP-55 checksum examples

use keyward_crypto::envelope;
use keyward_crypto::hd_derive::{derive_private_key, eth_derivation_path};
use keyward_crypto::kdf::ScryptParams;
use keyward_crypto::mnemonic::{mnemonic_to_seed, parse_mnemonic};
use keyward_crypto::signing::{recover_personal_signer, to_checksum_address, EthKey};
use keyward_types::KeywardError;

const HARDHAT_MNEMONIC: &str = "test test test test test test test test test test test junk";
const ABANDON_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

// ===================================================================
// Helper
// ===================================================================

fn account(mnemonic: &str, index: u32) -> std::result::Result<EthKey, KeywardError> {
    let phrase = parse_mnemonic(mnemonic)?;
    let seed = mnemonic_to_seed(&phrase)?;
    let key = derive_private_key(&seed, &eth_derivation_path(index))?;
    EthKey::from_bytes(&key)
}

// ===================================================================
// HD derivation
// ===================================================================

#[test]
fn hardhat_account_0() -> std::result::Result<(), KeywardError> {
    let phrase = parse_mnemonic(HARDHAT_MNEMONIC)?;
    let seed = mnemonic_to_seed(&phrase)?;
    let key = derive_private_key(&seed, "m/44'/60'/0'/0/0")?;
    assert_eq!(
        hex::encode(*key),
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
    );

    let eth = EthKey::from_bytes(&key)?;
    assert_eq!(
        to_checksum_address(&eth.address()),
        "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
    );
    Ok(())
}

#[test]
fn hardhat_account_1() -> std::result::Result<(), KeywardError> {
    let eth = account(HARDHAT_MNEMONIC, 1)?;
    assert_eq!(
        to_checksum_address(&eth.address()),
        "0x70997970C51812dc3A010C7d01b50e68d17dc79C"
    );
    Ok(())
}

#[test]
fn abandon_account_0() -> std::result::Result<(), KeywardError> {
    let eth = account(ABANDON_MNEMONIC, 0)?;
    assert_eq!(
        to_checksum_address(&eth.address()),
        "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
    );
    Ok(())
}

#[test]
fn successive_indices_differ() -> std::result::Result<(), KeywardError> {
    let a = account(HARDHAT_MNEMONIC, 0)?;
    let b = account(HARDHAT_MNEMONIC, 1)?;
    let c = account(HARDHAT_MNEMONIC, 2)?;
    assert_ne!(a.address(), b.address());
    assert_ne!(b.address(), c.address());
    Ok(())
}

// ===================================================================
// Signing
// ===================================================================

#[test]
fn derived_key_signs_recoverably() -> std::result::Result<(), KeywardError> {
    let eth = account(HARDHAT_MNEMONIC, 0)?;
    let sig = eth.personal_sign(b"Sign in to example.org")?;
    assert_eq!(recover_personal_signer(b"Sign in to example.org", &sig)?, eth.address());
    assert_ne!(recover_personal_signer(b"something else", &sig)?, eth.address());
    Ok(())
}

// ===================================================================
// Envelope
// ===================================================================

#[test]
fn envelope_protects_mnemonic() -> std::result::Result<(), KeywardError> {
    let params = ScryptParams::new(1024, 8, 1);
    let env = envelope::encrypt(HARDHAT_MNEMONIC.as_bytes(), b"password123", &params)?;

    let json = serde_json::to_string(&env).map_err(|e| KeywardError::StorageError {
        reason: e.to_string(),
    })?;
    assert!(!json.contains("junk"));

    let plain = envelope::decrypt(&env, b"password123")?;
    assert_eq!(plain.as_slice(), HARDHAT_MNEMONIC.as_bytes());
    assert!(matches!(
        envelope::decrypt(&env, b"wrong-password"),
        Err(KeywardError::InvalidPassword)
    ));
    Ok(())
}
