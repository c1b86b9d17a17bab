//! Decrypted wallet model: [`WalletPayload`] and [`AccountRecord`].
//!
//! These types exist in plaintext only in memory, for the lifetime of
//! an unlock. They serialize to the JSON that gets sealed inside the
//! keystore envelope and are zeroized on drop.

use std::collections::HashMap;

use keyward_crypto::hd_derive::{derive_private_key, eth_derivation_path};
use keyward_crypto::mnemonic::{mnemonic_to_seed, parse_mnemonic, MnemonicPhrase};
use keyward_crypto::signing::{to_checksum_address, EthKey};
use keyward_types::{normalize_address, KeywardError, Result};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Index of the primary account. Always present, never hidden.
pub const PRIMARY_INDEX: u32 = 0;

// ---------------------------------------------------------------------------
// AccountRecord
// ---------------------------------------------------------------------------

/// One account inside the wallet.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    /// EIP-55 checksummed address.
    pub address: String,
    /// BIP44 path, `None` for an imported raw key.
    pub derivation_path: Option<String>,
    /// `0x`-prefixed hex private key.
    pub private_key: String,
    /// Position in the HD sequence.
    pub index: u32,
    /// Whether default account listings include this account.
    pub visible: bool,
    /// Human-readable label.
    pub label: String,
}

impl AccountRecord {
    fn from_key_bytes(key: &[u8; 32], index: u32, derivation_path: Option<String>) -> Result<Self> {
        let eth = EthKey::from_bytes(key)?;
        Ok(Self {
            address: to_checksum_address(&eth.address()),
            derivation_path,
            private_key: format!("0x{}", hex::encode(key)),
            index,
            visible: true,
            label: default_label(index),
        })
    }

    /// Returns `true` if `address` names this account (case-insensitive).
    pub fn matches(&self, address: &str) -> bool {
        normalize_address(&self.address) == normalize_address(address)
    }
}

// AccountRecord has no Debug impl; it carries a private key.

/// Public view of an account, safe to send to clients.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    /// EIP-55 checksummed address.
    pub address: String,
    /// Position in the HD sequence.
    pub index: u32,
    /// Human-readable label.
    pub label: String,
    /// Visibility flag.
    pub visible: bool,
    /// BIP44 path, `None` for an imported raw key.
    pub derivation_path: Option<String>,
}

impl From<&AccountRecord> for AccountSummary {
    fn from(record: &AccountRecord) -> Self {
        Self {
            address: record.address.clone(),
            index: record.index,
            label: record.label.clone(),
            visible: record.visible,
            derivation_path: record.derivation_path.clone(),
        }
    }
}

fn default_label(index: u32) -> String {
    format!("Account {}", index + 1)
}

// ---------------------------------------------------------------------------
// WalletPayload
// ---------------------------------------------------------------------------

/// The plaintext wallet sealed inside a keystore file.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct WalletPayload {
    /// BIP39 phrase, `None` when imported from a raw private key.
    pub mnemonic: Option<String>,
    /// Index the next derived account will receive.
    pub next_account_index: u32,
    /// Accounts in index order.
    pub accounts: Vec<AccountRecord>,
}

impl WalletPayload {
    /// Builds a payload from a mnemonic, deriving account 0 at
    /// `m/44'/60'/0'/0/0`.
    ///
    /// # Errors
    ///
    /// Propagates derivation failures.
    pub fn from_mnemonic(phrase: &MnemonicPhrase) -> Result<Self> {
        let record = derive_account(phrase, PRIMARY_INDEX)?;
        Ok(Self {
            mnemonic: Some(phrase.as_str().to_string()),
            next_account_index: PRIMARY_INDEX + 1,
            accounts: vec![record],
        })
    }

    /// Builds a single-account payload from a raw private key.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::InvalidSecret`] if the key is malformed.
    pub fn from_private_key(hex_key: &str) -> Result<Self> {
        let body = hex_key
            .trim()
            .strip_prefix("0x")
            .filter(|b| b.len() == 64)
            .ok_or(KeywardError::InvalidSecret)?;
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(body, bytes.as_mut_slice()).map_err(|_| KeywardError::InvalidSecret)?;
        let record = AccountRecord::from_key_bytes(&bytes, PRIMARY_INDEX, None)?;
        Ok(Self {
            mnemonic: None,
            next_account_index: PRIMARY_INDEX + 1,
            accounts: vec![record],
        })
    }

    /// Parses a decrypted payload, enforcing the primary-account
    /// invariants.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::Corrupt`] if the JSON is malformed, the
    /// primary account is missing, or an address appears twice.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let mut payload: Self = serde_json::from_slice(bytes).map_err(|e| KeywardError::Corrupt {
            reason: format!("wallet payload is not valid JSON: {e}"),
        })?;

        let primary = payload
            .accounts
            .iter_mut()
            .find(|a| a.index == PRIMARY_INDEX)
            .ok_or_else(|| KeywardError::Corrupt {
                reason: "wallet payload has no primary account".into(),
            })?;
        primary.visible = true;

        let mut seen = std::collections::HashSet::new();
        for account in &payload.accounts {
            if !seen.insert(normalize_address(&account.address)) {
                return Err(KeywardError::Corrupt {
                    reason: format!("duplicate account {}", account.address),
                });
            }
        }

        Ok(payload)
    }

    /// Serializes the payload for sealing.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::StorageError`] if serialization fails.
    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| KeywardError::StorageError {
                reason: format!("wallet payload serialization failed: {e}"),
            })
    }

    /// Builds the signing keys, keyed by lower-case address.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::Corrupt`] if a stored key is malformed.
    pub fn signing_keys(&self) -> Result<HashMap<String, EthKey>> {
        self.accounts
            .iter()
            .map(|a| {
                let key = EthKey::from_hex(&a.private_key).map_err(|_| KeywardError::Corrupt {
                    reason: format!("stored key for {} is malformed", a.address),
                })?;
                Ok((normalize_address(&a.address), key))
            })
            .collect()
    }

    /// Returns the primary account.
    pub fn primary(&self) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.index == PRIMARY_INDEX)
    }

    /// Looks up an account (case-insensitive).
    pub fn find(&self, address: &str) -> Option<&AccountRecord> {
        self.accounts.iter().find(|a| a.matches(address))
    }

    fn find_mut(&mut self, address: &str) -> Result<&mut AccountRecord> {
        self.accounts
            .iter_mut()
            .find(|a| a.matches(address))
            .ok_or_else(|| KeywardError::AccountNotFound {
                address: address.to_string(),
            })
    }

    /// Account summaries in index order.
    pub fn summaries(&self, include_hidden: bool) -> Vec<AccountSummary> {
        let mut out: Vec<AccountSummary> = self
            .accounts
            .iter()
            .filter(|a| include_hidden || a.visible)
            .map(AccountSummary::from)
            .collect();
        out.sort_by_key(|a| a.index);
        out
    }

    // -- Mutations --------------------------------------------------------

    /// Derives and appends the next HD account, returning its address.
    ///
    /// # Errors
    ///
    /// - [`KeywardError::NoMnemonic`] for raw-key wallets.
    /// - [`KeywardError::Corrupt`] if the derived address already exists.
    pub fn derive_next(&mut self) -> Result<String> {
        let phrase = match &self.mnemonic {
            Some(m) => parse_mnemonic(m).map_err(|_| KeywardError::Corrupt {
                reason: "stored mnemonic is invalid".into(),
            })?,
            None => return Err(KeywardError::NoMnemonic),
        };

        let index = self.next_account_index;
        let record = derive_account(&phrase, index)?;
        if self.find(&record.address).is_some() {
            return Err(KeywardError::Corrupt {
                reason: format!("account {} already exists", record.address),
            });
        }

        let address = record.address.clone();
        self.accounts.push(record);
        self.next_account_index = index.saturating_add(1);
        Ok(address)
    }

    /// Hides an account from default listings.
    ///
    /// # Errors
    ///
    /// - [`KeywardError::AccountNotFound`] if the address is unknown.
    /// - [`KeywardError::CannotHidePrimary`] for index 0.
    pub fn hide(&mut self, address: &str) -> Result<()> {
        let account = self.find_mut(address)?;
        if account.index == PRIMARY_INDEX {
            return Err(KeywardError::CannotHidePrimary);
        }
        account.visible = false;
        Ok(())
    }

    /// Makes an account visible again.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::AccountNotFound`] if the address is unknown.
    pub fn show(&mut self, address: &str) -> Result<()> {
        self.find_mut(address)?.visible = true;
        Ok(())
    }

    /// Renames an account.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::AccountNotFound`] if the address is unknown.
    pub fn set_label(&mut self, address: &str, label: &str) -> Result<()> {
        self.find_mut(address)?.label = label.trim().to_string();
        Ok(())
    }
}

fn derive_account(phrase: &MnemonicPhrase, index: u32) -> Result<AccountRecord> {
    let seed = mnemonic_to_seed(phrase)?;
    let path = eth_derivation_path(index);
    let key = derive_private_key(&seed, &path)?;
    AccountRecord::from_key_bytes(&key, index, Some(path))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MNEMONIC: &str = "test test test test test test test test test test test junk";

    fn payload() -> std::result::Result<WalletPayload, KeywardError> {
        WalletPayload::from_mnemonic(&parse_mnemonic(MNEMONIC)?)
    }

    #[test]
    fn mnemonic_payload_has_primary() -> std::result::Result<(), KeywardError> {
        let p = payload()?;
        assert_eq!(p.accounts.len(), 1);
        assert_eq!(p.next_account_index, 1);
        let primary = p.primary().ok_or(KeywardError::NoKeystore)?;
        assert_eq!(primary.address, "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        assert_eq!(primary.derivation_path.as_deref(), Some("m/44'/60'/0'/0/0"));
        assert_eq!(primary.label, "Account 1");
        assert!(primary.visible);
        Ok(())
    }

    #[test]
    fn derive_next_appends_and_labels() -> std::result::Result<(), KeywardError> {
        let mut p = payload()?;
        let address = p.derive_next()?;
        assert_eq!(address, "0x70997970C51812dc3A010C7d01b50e68d17dc79C");
        assert_eq!(p.next_account_index, 2);
        assert_eq!(p.accounts[1].label, "Account 2");
        Ok(())
    }

    #[test]
    fn raw_key_payload_cannot_derive() -> std::result::Result<(), KeywardError> {
        let mut p = WalletPayload::from_private_key(&format!("0x{}", "1".repeat(64)))?;
        assert!(p.mnemonic.is_none());
        assert!(p.accounts[0].derivation_path.is_none());
        assert!(matches!(p.derive_next(), Err(KeywardError::NoMnemonic)));
        Ok(())
    }

    #[test]
    fn lookups_are_case_insensitive() -> std::result::Result<(), KeywardError> {
        let p = payload()?;
        assert!(p.find("0xF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266").is_some());
        assert!(p.find("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").is_some());
        assert!(p.find("0x0000000000000000000000000000000000000000").is_none());
        Ok(())
    }

    #[test]
    fn primary_cannot_be_hidden() -> std::result::Result<(), KeywardError> {
        let mut p = payload()?;
        let primary = p.accounts[0].address.clone();
        assert!(matches!(p.hide(&primary), Err(KeywardError::CannotHidePrimary)));
        Ok(())
    }

    #[test]
    fn hide_show_filters_summaries() -> std::result::Result<(), KeywardError> {
        let mut p = payload()?;
        let second = p.derive_next()?;
        p.hide(&second)?;
        assert_eq!(p.summaries(false).len(), 1);
        assert_eq!(p.summaries(true).len(), 2);
        p.show(&second.to_lowercase())?;
        assert_eq!(p.summaries(false).len(), 2);
        Ok(())
    }

    #[test]
    fn set_label_unknown_account() -> std::result::Result<(), KeywardError> {
        let mut p = payload()?;
        assert!(matches!(
            p.set_label("0x0000000000000000000000000000000000000001", "x"),
            Err(KeywardError::AccountNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn json_roundtrip_forces_primary_visible() -> std::result::Result<(), KeywardError> {
        let mut p = payload()?;
        p.accounts[0].visible = false;
        let bytes = p.to_json()?;
        let back = WalletPayload::from_json(&bytes)?;
        assert!(back.accounts[0].visible);
        assert_eq!(back.mnemonic.as_deref(), Some(MNEMONIC));
        Ok(())
    }

    #[test]
    fn malformed_json_is_corrupt() {
        assert!(matches!(
            WalletPayload::from_json(b"{not json"),
            Err(KeywardError::Corrupt { .. })
        ));
        assert!(matches!(
            WalletPayload::from_json(br#"{"mnemonic":null,"nextAccountIndex":1,"accounts":[]}"#),
            Err(KeywardError::Corrupt { .. })
        ));
    }

    #[test]
    fn signing_keys_cover_all_accounts() -> std::result::Result<(), KeywardError> {
        let mut p = payload()?;
        p.derive_next()?;
        let keys = p.signing_keys()?;
        assert_eq!(keys.len(), 2);
        assert!(keys.contains_key("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"));
        Ok(())
    }
}
