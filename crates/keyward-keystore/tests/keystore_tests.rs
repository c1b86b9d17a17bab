//! End-to-end keystore lifecycle tests against a temporary directory.

use keyward_crypto::kdf::ScryptParams;
use keyward_crypto::signing::recover_personal_signer;
use keyward_crypto::transaction::TransactionRequest;
use keyward_keystore::keystore_file::{KeystoreDir, KeystoreFile};
use keyward_keystore::{AccountChange, Keystore};
use keyward_types::{Address, KeywardError, ValidationCode};
use serde_json::json;

const PASSWORD: &str = "password123";
const HARDHAT_MNEMONIC: &str = "test test test test test test test test test test test junk";

// ===================================================================
// Helpers
// ===================================================================

fn test_params() -> ScryptParams {
    ScryptParams::new(1024, 8, 1)
}

fn io_err(e: std::io::Error) -> KeywardError {
    KeywardError::StorageError {
        reason: e.to_string(),
    }
}

fn keystore_in(tmp: &tempfile::TempDir) -> Keystore {
    Keystore::new(KeystoreDir::new(tmp.path().join("keystore")), test_params())
}

// ===================================================================
// Create / unlock / lock
// ===================================================================

#[test]
fn create_unlock_lock_cycle() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    assert!(!ks.has_keystore());

    let created = ks.create_wallet(PASSWORD)?;
    assert_eq!(created.address.len(), 42);
    assert!(created.address.starts_with("0x"));
    let mnemonic = created.mnemonic.as_ref().map(|m| m.split_whitespace().count());
    assert_eq!(mnemonic, Some(12));
    assert!(ks.has_keystore());
    assert!(ks.is_unlocked());

    ks.lock();
    assert!(!ks.is_unlocked());
    assert!(ks.unlock(PASSWORD)?);
    assert_eq!(ks.get_accounts(false), vec![created.address.clone()]);

    ks.lock();
    assert!(ks.get_accounts(false).is_empty());
    assert!(ks.get_accounts(true).is_empty());
    Ok(())
}

#[test]
fn keystore_file_holds_no_plaintext() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?;

    let path = ks.dir().latest()?.ok_or(KeywardError::NoKeystore)?;
    let raw = std::fs::read_to_string(&path).map_err(io_err)?;
    assert!(!raw.contains("junk"));
    assert!(!raw.contains("ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"));
    assert!(KeystoreFile::read(&path).is_ok());
    Ok(())
}

#[test]
fn wrong_password_returns_false() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.create_wallet(PASSWORD)?;
    ks.lock();

    assert!(!ks.unlock("not-the-password")?);
    assert!(!ks.is_unlocked());
    Ok(())
}

#[test]
fn unlock_without_keystore_fails() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    assert!(matches!(ks.unlock(PASSWORD), Err(KeywardError::NoKeystore)));
    Ok(())
}

#[test]
fn weak_password_rejected() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    assert!(matches!(
        ks.create_wallet("short"),
        Err(KeywardError::WeakPassword { .. })
    ));
    assert!(!ks.has_keystore());
    Ok(())
}

#[test]
fn corrupt_keystore_propagates() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.create_wallet(PASSWORD)?;
    ks.lock();

    let path = ks.dir().latest()?.ok_or(KeywardError::NoKeystore)?;
    std::fs::write(&path, b"{\"version\":1}").map_err(io_err)?;
    assert!(matches!(ks.unlock(PASSWORD), Err(KeywardError::Corrupt { .. })));
    Ok(())
}

// ===================================================================
// Import
// ===================================================================

#[test]
fn import_raw_key_has_no_mnemonic() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let secret = format!("0x{}", "1".repeat(64));

    let imported = ks.import_wallet(&secret, PASSWORD)?;
    assert!(imported.mnemonic.is_none());
    assert_eq!(ks.get_accounts(false), vec![imported.address]);
    assert!(!ks.has_mnemonic());

    assert!(matches!(
        ks.create_next_account(PASSWORD),
        Err(KeywardError::NoMnemonic)
    ));
    Ok(())
}

#[test]
fn import_mnemonic_derives_known_address() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let imported = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?;
    assert_eq!(imported.address, "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
    Ok(())
}

#[test]
fn import_garbage_rejected() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    assert!(matches!(
        ks.import_wallet("definitely not a secret", PASSWORD),
        Err(KeywardError::InvalidSecret)
    ));
    Ok(())
}

#[test]
fn second_import_becomes_authoritative() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.create_wallet(PASSWORD)?;
    let imported = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?;
    ks.lock();

    assert!(ks.unlock(PASSWORD)?);
    assert_eq!(ks.get_accounts(false), vec![imported.address]);
    assert_eq!(ks.dir().list()?.len(), 2);
    Ok(())
}

// ===================================================================
// Account management
// ===================================================================

#[test]
fn create_next_account_persists() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?;

    let second = ks.create_next_account(PASSWORD)?;
    assert_eq!(second, "0x70997970C51812dc3A010C7d01b50e68d17dc79C");

    ks.lock();
    assert!(ks.unlock(PASSWORD)?);
    let summaries = ks.account_summaries(false);
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[1].label, "Account 2");
    assert_eq!(summaries[1].derivation_path.as_deref(), Some("m/44'/60'/0'/0/1"));
    Ok(())
}

#[test]
fn mutation_needs_current_password() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?;

    assert!(matches!(
        ks.create_next_account("wrong-password"),
        Err(KeywardError::InvalidPassword)
    ));
    assert_eq!(ks.get_accounts(true).len(), 1);
    Ok(())
}

#[test]
fn mutation_while_locked_fails() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?;
    ks.lock();
    assert!(matches!(
        ks.prepare_update(&AccountChange::CreateNext, PASSWORD),
        Err(KeywardError::Locked)
    ));
    Ok(())
}

#[test]
fn hide_and_show_accounts() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let primary = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?.address;
    let other = ks.create_next_account(PASSWORD)?;

    assert!(matches!(
        ks.hide_account(&primary, PASSWORD),
        Err(KeywardError::CannotHidePrimary)
    ));

    ks.hide_account(&other.to_lowercase(), PASSWORD)?;
    assert_eq!(ks.get_accounts(false), vec![primary.clone()]);
    assert_eq!(ks.get_accounts(true), vec![primary.clone(), other.clone()]);

    ks.lock();
    assert!(ks.unlock(PASSWORD)?);
    assert_eq!(ks.get_accounts(false), vec![primary.clone()]);

    ks.show_account(&other, PASSWORD)?;
    assert_eq!(ks.get_accounts(false), vec![primary, other]);
    Ok(())
}

#[test]
fn label_unknown_account_fails() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let primary = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?.address;

    ks.set_account_label(&primary, "Main", PASSWORD)?;
    assert_eq!(ks.account_summaries(false)[0].label, "Main");

    let unknown = "0x0000000000000000000000000000000000000001";
    assert!(matches!(
        ks.set_account_label(unknown, "x", PASSWORD),
        Err(KeywardError::AccountNotFound { .. })
    ));
    Ok(())
}

// ===================================================================
// Signing
// ===================================================================

#[test]
fn sign_message_recovers_to_account() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let primary = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?.address;

    let sig_hex = ks.sign_message(b"hello", &primary.to_uppercase().replacen("0X", "0x", 1))?;
    let sig_bytes = hex::decode(sig_hex.trim_start_matches("0x")).map_err(|e| {
        KeywardError::CryptoError {
            reason: e.to_string(),
        }
    })?;
    let sig: [u8; 65] = sig_bytes.as_slice().try_into().map_err(|_| KeywardError::CryptoError {
        reason: "signature length".into(),
    })?;
    let signer = recover_personal_signer(b"hello", &sig)?;
    assert_eq!(signer, primary.parse::<Address>()?);
    Ok(())
}

#[test]
fn signing_requires_unlock_and_known_account() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let primary = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?.address;

    let unknown = "0x0000000000000000000000000000000000000001";
    assert!(matches!(
        ks.sign_message(b"x", unknown),
        Err(KeywardError::AccountNotFound { .. })
    ));

    ks.lock();
    assert!(matches!(ks.sign_message(b"x", &primary), Err(KeywardError::Locked)));
    Ok(())
}

#[test]
fn sign_transaction_with_account() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    let primary = ks.import_wallet(HARDHAT_MNEMONIC, PASSWORD)?.address;

    let tx = TransactionRequest::from_json(&json!({
        "from": primary,
        "to": "0x70997970C51812dc3A010C7d01b50e68d17dc79C",
        "value": "0xde0b6b3a7640000",
        "nonce": 0,
        "gas": "0x5208",
        "maxFeePerGas": "0x3b9aca00",
        "maxPriorityFeePerGas": "0x3b9aca00",
        "chainId": 1
    }))?;
    let signed = ks.sign_transaction(&tx, &primary)?;
    assert!(signed.raw_transaction.starts_with("0x02"));
    assert_eq!(signed.hash.len(), 66);

    let other = ks.create_next_account(PASSWORD)?;
    match ks.sign_transaction(&tx, &other) {
        Err(KeywardError::Validation { code, .. }) => assert_eq!(code, ValidationCode::InvalidRequest),
        other => panic!("expected invalid_request, got ok={}", other.is_ok()),
    }
    Ok(())
}

// ===================================================================
// Deletion
// ===================================================================

#[test]
fn delete_keystore_is_idempotent() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.create_wallet(PASSWORD)?;

    ks.delete_keystore()?;
    assert!(!ks.is_unlocked());
    assert!(!ks.has_keystore());
    ks.delete_keystore()?;
    Ok(())
}

#[test]
fn external_removal_locks() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut ks = keystore_in(&tmp);
    ks.create_wallet(PASSWORD)?;
    assert!(!ks.handle_removed());

    KeystoreDir::new(ks.dir().path()).remove_all()?;
    assert!(ks.handle_removed());
    assert!(!ks.is_unlocked());
    assert!(!ks.has_keystore());
    Ok(())
}

#[test]
fn presence_is_cached_until_refreshed() -> std::result::Result<(), KeywardError> {
    let tmp = tempfile::tempdir().map_err(io_err)?;
    let mut observer = keystore_in(&tmp);
    let mut writer = keystore_in(&tmp);

    writer.create_wallet(PASSWORD)?;
    assert!(writer.has_keystore());
    assert!(!observer.has_keystore());
    assert!(observer.refresh_presence());
    assert!(observer.has_keystore());
    Ok(())
}
