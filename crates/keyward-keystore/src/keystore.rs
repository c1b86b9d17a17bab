//! The [`Keystore`] component: encrypted wallet lifecycle.
//!
//! The keystore owns the single authoritative keystore file and, while
//! unlocked, the decrypted [`WalletPayload`] and per-account signing
//! keys. Everything else reaches wallet state through its methods.
//!
//! Each password-bound operation exists twice: as a synchronous method
//! (`unlock`, `create_wallet`, ...) and as a prepare / commit pair
//! around a job from [`crate::job`], for callers that run the scrypt
//! stage on another thread. The synchronous forms are compositions of
//! the staged ones.

use std::path::PathBuf;

use keyward_crypto::kdf::ScryptParams;
use keyward_crypto::mnemonic::{generate_mnemonic, parse_mnemonic};
use keyward_crypto::signing::EthKey;
use keyward_crypto::transaction::{SignedTransaction, TransactionRequest};
use keyward_types::config::MIN_PASSWORD_LEN;
use keyward_types::{normalize_address, KeywardError, Result};
use zeroize::Zeroizing;

use crate::account::{AccountSummary, WalletPayload};
use crate::job::{SealJob, SealKind, SealTarget, SealedWallet, UnlockJob, UnlockedWallet};
use crate::keystore_file::KeystoreDir;

// ---------------------------------------------------------------------------
// Public result types
// ---------------------------------------------------------------------------

/// Result of creating or importing a wallet.
pub struct CreatedWallet {
    /// Address of the primary account.
    pub address: String,
    /// The generated mnemonic. Only set by `create_wallet`; this is the
    /// only time it is ever returned.
    pub mnemonic: Option<Zeroizing<String>>,
}

/// An account-level mutation that rewrites the keystore.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AccountChange {
    /// Derive the next HD account.
    CreateNext,
    /// Hide an account from default listings.
    Hide {
        /// Target account.
        address: String,
    },
    /// Make a hidden account visible.
    Show {
        /// Target account.
        address: String,
    },
    /// Rename an account.
    SetLabel {
        /// Target account.
        address: String,
        /// New label.
        label: String,
    },
}

/// What a secret passed to `import_wallet` turned out to be.
enum ImportSecret {
    Mnemonic,
    PrivateKey,
}

fn classify_secret(secret: &str) -> Result<ImportSecret> {
    let trimmed = secret.trim();
    if trimmed.split_whitespace().count() >= 12 {
        return Ok(ImportSecret::Mnemonic);
    }
    let is_raw_key = trimmed
        .strip_prefix("0x")
        .map(|body| body.len() == 64 && body.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false);
    if is_raw_key {
        Ok(ImportSecret::PrivateKey)
    } else {
        Err(KeywardError::InvalidSecret)
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(KeywardError::WeakPassword {
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Keystore
// ---------------------------------------------------------------------------

/// Encrypted-at-rest wallet with lock / unlock lifecycle.
///
/// # Invariants
///
/// - The keystore file never contains plaintext key material.
/// - While locked, no payload or signing key is held in memory.
/// - Account 0 always exists and is always visible.
pub struct Keystore {
    dir: KeystoreDir,
    params: ScryptParams,
    unlocked: Option<UnlockedWallet>,
    /// Whether a keystore file was on disk at the last check.
    present: bool,
}

impl Keystore {
    /// Creates a locked keystore over `dir`.
    pub fn new(dir: KeystoreDir, params: ScryptParams) -> Self {
        let present = dir.has_keystore();
        Self {
            dir,
            params,
            unlocked: None,
            present,
        }
    }

    // -- Accessors --------------------------------------------------------

    /// The keystore directory.
    pub fn dir(&self) -> &KeystoreDir {
        &self.dir
    }

    /// Returns `true` if a keystore file existed at the last check.
    ///
    /// Kept current by this keystore's own writes and deletes; changes
    /// made by other processes show up after [`Keystore::refresh_presence`].
    pub fn has_keystore(&self) -> bool {
        self.present
    }

    /// Re-reads the keystore directory and returns the fresh answer.
    pub fn refresh_presence(&mut self) -> bool {
        self.present = self.dir.has_keystore();
        self.present
    }

    /// Returns `true` while decrypted keys are held in memory.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.is_some()
    }

    /// Path of the file the unlocked wallet was loaded from.
    pub fn loaded_path(&self) -> Option<&PathBuf> {
        self.unlocked.as_ref().map(|w| &w.path)
    }

    /// Returns `true` if the unlocked wallet can derive more accounts.
    pub fn has_mnemonic(&self) -> bool {
        self.unlocked
            .as_ref()
            .map(|w| w.payload.mnemonic.is_some())
            .unwrap_or(false)
    }

    // -- Staged operations ------------------------------------------------

    /// Prepares a new wallet with a freshly generated mnemonic.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::WeakPassword`] for passwords shorter
    /// than 8 characters.
    pub fn prepare_create(&self, password: &str) -> Result<SealJob> {
        check_password(password)?;
        let phrase = generate_mnemonic()?;
        let payload = WalletPayload::from_mnemonic(&phrase)?;
        let subject = primary_address(&payload)?;
        Ok(SealJob {
            kind: SealKind::Install,
            payload,
            password: Zeroizing::new(password.to_string()),
            params: self.params,
            target: SealTarget::NewGeneration(self.dir.clone()),
            subject,
            reveal: Some(Zeroizing::new(phrase.as_str().to_string())),
        })
    }

    /// Prepares an import from a mnemonic or a raw private key.
    ///
    /// # Errors
    ///
    /// - [`KeywardError::WeakPassword`] for short passwords.
    /// - [`KeywardError::InvalidSecret`] if the secret is neither a
    ///   valid mnemonic (≥ 12 words) nor a `0x` + 64 hex key.
    pub fn prepare_import(&self, secret: &str, password: &str) -> Result<SealJob> {
        check_password(password)?;
        let payload = match classify_secret(secret)? {
            ImportSecret::Mnemonic => WalletPayload::from_mnemonic(&parse_mnemonic(secret)?)?,
            ImportSecret::PrivateKey => WalletPayload::from_private_key(secret)?,
        };
        let subject = primary_address(&payload)?;
        Ok(SealJob {
            kind: SealKind::Install,
            payload,
            password: Zeroizing::new(password.to_string()),
            params: self.params,
            target: SealTarget::NewGeneration(self.dir.clone()),
            subject,
            reveal: None,
        })
    }

    /// Prepares decryption of the authoritative keystore file.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::NoKeystore`] if no file exists.
    pub fn prepare_unlock(&self, password: &str) -> Result<UnlockJob> {
        let path = self.dir.latest()?.ok_or(KeywardError::NoKeystore)?;
        Ok(UnlockJob {
            path,
            password: Zeroizing::new(password.to_string()),
        })
    }

    /// Installs a decrypted wallet, replacing any previous one.
    pub fn commit_unlock(&mut self, wallet: UnlockedWallet) {
        tracing::info!(
            path = %wallet.path.display(),
            accounts = wallet.payload.accounts.len(),
            "keystore unlocked"
        );
        self.unlocked = Some(wallet);
    }

    /// Prepares an account mutation. The mutation is applied to a copy
    /// of the payload; nothing changes until the job is committed.
    ///
    /// # Errors
    ///
    /// - [`KeywardError::Locked`] if the keystore is locked.
    /// - [`KeywardError::NoMnemonic`], [`KeywardError::AccountNotFound`],
    ///   [`KeywardError::CannotHidePrimary`] from the mutation itself.
    pub fn prepare_update(&self, change: &AccountChange, password: &str) -> Result<SealJob> {
        let wallet = self.unlocked.as_ref().ok_or(KeywardError::Locked)?;
        let mut payload = wallet.payload.clone();

        let subject = match change {
            AccountChange::CreateNext => payload.derive_next()?,
            AccountChange::Hide { address } => {
                payload.hide(address)?;
                address.clone()
            }
            AccountChange::Show { address } => {
                payload.show(address)?;
                address.clone()
            }
            AccountChange::SetLabel { address, label } => {
                payload.set_label(address, label)?;
                address.clone()
            }
        };

        Ok(SealJob {
            kind: SealKind::Update,
            payload,
            password: Zeroizing::new(password.to_string()),
            params: self.params,
            target: SealTarget::Rewrite(wallet.path.clone()),
            subject,
            reveal: None,
        })
    }

    /// Installs a sealed wallet and returns the caller-facing result.
    ///
    /// Updates are dropped (the file is already written) if the
    /// keystore was locked while the job ran.
    pub fn commit_seal(&mut self, sealed: SealedWallet) -> CreatedWallet {
        let result = CreatedWallet {
            address: sealed.subject,
            mnemonic: sealed.reveal,
        };
        match sealed.kind {
            SealKind::Install => {
                tracing::info!(path = %sealed.wallet.path.display(), "keystore created");
                self.present = true;
                self.unlocked = Some(sealed.wallet);
            }
            SealKind::Update if self.unlocked.is_some() => {
                self.unlocked = Some(sealed.wallet);
            }
            SealKind::Update => {
                tracing::debug!("keystore locked during update; not reinstalling");
            }
        }
        result
    }

    // -- Synchronous operations -------------------------------------------

    /// Creates a wallet, persists it, and leaves it unlocked.
    ///
    /// # Errors
    ///
    /// See [`Keystore::prepare_create`] and [`SealJob::run`].
    pub fn create_wallet(&mut self, password: &str) -> Result<CreatedWallet> {
        let sealed = self.prepare_create(password)?.run()?;
        Ok(self.commit_seal(sealed))
    }

    /// Imports a wallet, persists it, and leaves it unlocked.
    ///
    /// # Errors
    ///
    /// See [`Keystore::prepare_import`] and [`SealJob::run`].
    pub fn import_wallet(&mut self, secret: &str, password: &str) -> Result<CreatedWallet> {
        let sealed = self.prepare_import(secret, password)?.run()?;
        Ok(self.commit_seal(sealed))
    }

    /// Unlocks with `password`.
    ///
    /// Returns `Ok(false)` on a wrong password rather than an error.
    ///
    /// # Errors
    ///
    /// Propagates [`KeywardError::NoKeystore`], [`KeywardError::Corrupt`]
    /// and I/O failures.
    pub fn unlock(&mut self, password: &str) -> Result<bool> {
        match self.prepare_unlock(password)?.run() {
            Ok(wallet) => {
                self.commit_unlock(wallet);
                Ok(true)
            }
            Err(KeywardError::InvalidPassword) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Zeroizes all in-memory keys and the payload.
    pub fn lock(&mut self) {
        if self.unlocked.take().is_some() {
            tracing::info!("keystore locked");
        }
    }

    /// Derives the next account and rewrites the keystore.
    ///
    /// # Errors
    ///
    /// [`KeywardError::NoMnemonic`] for raw-key wallets,
    /// [`KeywardError::InvalidPassword`] if `password` does not open
    /// the current file, [`KeywardError::Locked`] when locked.
    pub fn create_next_account(&mut self, password: &str) -> Result<String> {
        self.apply(AccountChange::CreateNext, password)
    }

    /// Hides an account and rewrites the keystore.
    ///
    /// # Errors
    ///
    /// [`KeywardError::CannotHidePrimary`] for account 0,
    /// [`KeywardError::AccountNotFound`] for unknown addresses.
    pub fn hide_account(&mut self, address: &str, password: &str) -> Result<()> {
        self.apply(
            AccountChange::Hide {
                address: address.to_string(),
            },
            password,
        )
        .map(|_| ())
    }

    /// Shows a hidden account and rewrites the keystore.
    ///
    /// # Errors
    ///
    /// [`KeywardError::AccountNotFound`] for unknown addresses.
    pub fn show_account(&mut self, address: &str, password: &str) -> Result<()> {
        self.apply(
            AccountChange::Show {
                address: address.to_string(),
            },
            password,
        )
        .map(|_| ())
    }

    /// Renames an account and rewrites the keystore.
    ///
    /// # Errors
    ///
    /// [`KeywardError::AccountNotFound`] for unknown addresses.
    pub fn set_account_label(&mut self, address: &str, label: &str, password: &str) -> Result<()> {
        self.apply(
            AccountChange::SetLabel {
                address: address.to_string(),
                label: label.to_string(),
            },
            password,
        )
        .map(|_| ())
    }

    fn apply(&mut self, change: AccountChange, password: &str) -> Result<String> {
        let sealed = self.prepare_update(&change, password)?.run()?;
        Ok(self.commit_seal(sealed).address)
    }

    /// Locks, then removes every keystore generation. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::StorageError`] if a file cannot be removed.
    pub fn delete_keystore(&mut self) -> Result<()> {
        self.lock();
        let result = self.dir.remove_all();
        self.refresh_presence();
        let removed = result?;
        tracing::info!(removed, "keystore deleted");
        Ok(())
    }

    /// Reacts to the keystore directory emptying underneath the daemon.
    ///
    /// Locks if no keystore file remains. Returns `true` if a wallet
    /// was locked as a result.
    pub fn handle_removed(&mut self) -> bool {
        if self.refresh_presence() || self.unlocked.is_none() {
            return false;
        }
        tracing::warn!("keystore file removed externally, locking");
        self.lock();
        true
    }

    // -- Accounts & signing -----------------------------------------------

    /// Account addresses; empty while locked.
    pub fn get_accounts(&self, include_hidden: bool) -> Vec<String> {
        self.account_summaries(include_hidden)
            .into_iter()
            .map(|a| a.address)
            .collect()
    }

    /// Account summaries; empty while locked.
    pub fn account_summaries(&self, include_hidden: bool) -> Vec<AccountSummary> {
        self.unlocked
            .as_ref()
            .map(|w| w.payload.summaries(include_hidden))
            .unwrap_or_default()
    }

    /// Signs a transaction with the account at `address`.
    ///
    /// # Errors
    ///
    /// [`KeywardError::Locked`] when locked,
    /// [`KeywardError::AccountNotFound`] for unknown addresses, and
    /// `invalid_request` for a `from` mismatch.
    pub fn sign_transaction(&self, tx: &TransactionRequest, address: &str) -> Result<SignedTransaction> {
        tx.sign(self.key_for(address)?)
    }

    /// Signs `message` with EIP-191 and returns the `0x` hex signature.
    ///
    /// # Errors
    ///
    /// [`KeywardError::Locked`] when locked,
    /// [`KeywardError::AccountNotFound`] for unknown addresses.
    pub fn sign_message(&self, message: &[u8], address: &str) -> Result<String> {
        let sig = self.key_for(address)?.personal_sign(message)?;
        Ok(format!("0x{}", hex::encode(sig)))
    }

    fn key_for(&self, address: &str) -> Result<&EthKey> {
        let wallet = self.unlocked.as_ref().ok_or(KeywardError::Locked)?;
        wallet
            .keys
            .get(&normalize_address(address))
            .ok_or_else(|| KeywardError::AccountNotFound {
                address: address.to_string(),
            })
    }
}

fn primary_address(payload: &WalletPayload) -> Result<String> {
    payload
        .primary()
        .map(|a| a.address.clone())
        .ok_or_else(|| KeywardError::Corrupt {
            reason: "wallet payload has no primary account".into(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
