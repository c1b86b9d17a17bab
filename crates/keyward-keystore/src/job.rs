//! scrypt-bound keystore work, split into stages.
//!
//! Every operation that derives a key from a password is broken into:
//!
//! 1. **prepare** — cheap validation on the state owner
//!    (`Keystore::prepare_*`), producing a job value;
//! 2. **run** — the blocking part (scrypt, AES-GCM, file I/O), which
//!    touches no shared state and may run on any thread;
//! 3. **commit** — installing the result back on the state owner
//!    (`Keystore::commit_*`).
//!
//! Jobs own everything they need, so `run` can be moved into
//! `tokio::task::spawn_blocking`.

use std::collections::HashMap;
use std::path::PathBuf;

use keyward_crypto::envelope;
use keyward_crypto::kdf::ScryptParams;
use keyward_crypto::signing::EthKey;
use keyward_types::Result;
use zeroize::Zeroizing;

use crate::account::WalletPayload;
use crate::keystore_file::{KeystoreDir, KeystoreFile};

// ---------------------------------------------------------------------------
// UnlockedWallet
// ---------------------------------------------------------------------------

/// Decrypted wallet state held while the keystore is unlocked.
///
/// Dropping it zeroizes the payload and the signing keys.
pub struct UnlockedWallet {
    pub(crate) path: PathBuf,
    pub(crate) payload: WalletPayload,
    pub(crate) keys: HashMap<String, EthKey>,
}

impl UnlockedWallet {
    fn from_payload(path: PathBuf, payload: WalletPayload) -> Result<Self> {
        let keys = payload.signing_keys()?;
        Ok(Self { path, payload, keys })
    }
}

// ---------------------------------------------------------------------------
// UnlockJob
// ---------------------------------------------------------------------------

/// Decrypts the authoritative keystore file.
pub struct UnlockJob {
    pub(crate) path: PathBuf,
    pub(crate) password: Zeroizing<String>,
}

impl UnlockJob {
    /// Reads, decrypts and parses the keystore. Blocking.
    ///
    /// # Errors
    ///
    /// - [`keyward_types::KeywardError::InvalidPassword`] on tag mismatch.
    /// - [`keyward_types::KeywardError::Corrupt`] for malformed files.
    /// - [`keyward_types::KeywardError::StorageError`] on I/O failure.
    pub fn run(self) -> Result<UnlockedWallet> {
        let file = KeystoreFile::read(&self.path)?;
        let plaintext = envelope::decrypt(&file.crypto, self.password.as_bytes())?;
        let payload = WalletPayload::from_json(&plaintext)?;
        UnlockedWallet::from_payload(self.path, payload)
    }
}

// ---------------------------------------------------------------------------
// SealJob
// ---------------------------------------------------------------------------

/// Where a [`SealJob`] writes.
pub(crate) enum SealTarget {
    /// A fresh keystore generation (create / import).
    NewGeneration(KeystoreDir),
    /// The current authoritative file, after verifying the password
    /// against it (account mutations).
    Rewrite(PathBuf),
}

/// Whether the seal creates a wallet or updates the unlocked one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SealKind {
    /// Create or import: the result unlocks the keystore.
    Install,
    /// Account mutation: the result replaces the unlocked payload if
    /// the keystore is still unlocked at commit time.
    Update,
}

/// Encrypts a wallet payload and writes it to disk.
pub struct SealJob {
    pub(crate) kind: SealKind,
    pub(crate) payload: WalletPayload,
    pub(crate) password: Zeroizing<String>,
    pub(crate) params: ScryptParams,
    pub(crate) target: SealTarget,
    /// Address reported back to the caller.
    pub(crate) subject: String,
    /// Mnemonic revealed to the caller (create only).
    pub(crate) reveal: Option<Zeroizing<String>>,
}

impl SealJob {
    /// The job kind.
    pub fn kind(&self) -> SealKind {
        self.kind
    }

    /// Verifies (for rewrites), encrypts and atomically writes. Blocking.
    ///
    /// # Errors
    ///
    /// - [`keyward_types::KeywardError::InvalidPassword`] if a rewrite's
    ///   password does not open the current file.
    /// - [`keyward_types::KeywardError::StorageError`] on I/O failure.
    pub fn run(self) -> Result<SealedWallet> {
        let plaintext = self.payload.to_json()?;

        let (path, file) = match &self.target {
            SealTarget::NewGeneration(dir) => {
                let crypto = envelope::encrypt(&plaintext, self.password.as_bytes(), &self.params)?;
                (dir.new_generation_path()?, KeystoreFile::new(crypto))
            }
            SealTarget::Rewrite(path) => {
                let mut current = KeystoreFile::read(path)?;
                // Proves the caller knows the password before rewriting.
                drop(envelope::decrypt(&current.crypto, self.password.as_bytes())?);
                current.crypto = envelope::encrypt(&plaintext, self.password.as_bytes(), &self.params)?;
                (path.clone(), current)
            }
        };

        file.write_atomic(&path)?;

        let wallet = UnlockedWallet::from_payload(path, self.payload)?;
        Ok(SealedWallet {
            kind: self.kind,
            wallet,
            subject: self.subject,
            reveal: self.reveal,
        })
    }
}

/// Output of [`SealJob::run`], consumed by `Keystore::commit_seal`.
pub struct SealedWallet {
    pub(crate) kind: SealKind,
    pub(crate) wallet: UnlockedWallet,
    pub(crate) subject: String,
    pub(crate) reveal: Option<Zeroizing<String>>,
}

impl SealedWallet {
    /// The kind of the job that produced this wallet.
    pub fn kind(&self) -> SealKind {
        self.kind
    }
}
