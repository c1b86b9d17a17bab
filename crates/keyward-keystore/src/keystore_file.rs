//! On-disk keystore format and the keystore directory.
//!
//! # File format (v1)
//!
//! ```json
//! {
//!   "version": 1,
//!   "id": "<uuid v4>",
//!   "crypto": { "algorithm": "aes-256-gcm", "salt": "...", "iv": "...",
//!               "authTag": "...", "ciphertext": "...", "scryptParams": {...} }
//! }
//! ```
//!
//! One file is written per keystore generation, named
//! `keystore-<UTC timestamp>-<seq>.json`. The most recent file is
//! authoritative; older generations may accumulate. Every write goes
//! through a temporary file and an atomic rename.

use std::fs;
use std::path::{Path, PathBuf};

use keyward_crypto::envelope::EncryptedEnvelope;
use keyward_types::{KeywardError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current keystore file version.
pub const KEYSTORE_VERSION: u32 = 1;

const FILE_PREFIX: &str = "keystore-";
const FILE_SUFFIX: &str = ".json";

// ---------------------------------------------------------------------------
// KeystoreFile
// ---------------------------------------------------------------------------

/// Serialized keystore. Never contains plaintext key material.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeystoreFile {
    /// Format version.
    pub version: u32,
    /// Random identifier of this keystore generation.
    pub id: Uuid,
    /// Sealed wallet payload.
    pub crypto: EncryptedEnvelope,
}

impl KeystoreFile {
    /// Wraps an envelope in a new keystore generation.
    pub fn new(crypto: EncryptedEnvelope) -> Self {
        Self {
            version: KEYSTORE_VERSION,
            id: Uuid::new_v4(),
            crypto,
        }
    }

    /// Reads and parses a keystore file.
    ///
    /// # Errors
    ///
    /// - [`KeywardError::NoKeystore`] if the file does not exist.
    /// - [`KeywardError::StorageError`] on other I/O failures.
    /// - [`KeywardError::Corrupt`] if the JSON is malformed or the
    ///   version is unsupported.
    pub fn read(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KeywardError::NoKeystore,
            _ => KeywardError::StorageError {
                reason: format!("failed to read keystore: {e}"),
            },
        })?;

        let file: Self = serde_json::from_str(&json).map_err(|e| KeywardError::Corrupt {
            reason: format!("keystore is not valid JSON: {e}"),
        })?;

        if file.version != KEYSTORE_VERSION {
            return Err(KeywardError::Corrupt {
                reason: format!(
                    "unsupported keystore version {} (expected {KEYSTORE_VERSION})",
                    file.version
                ),
            });
        }
        Ok(file)
    }

    /// Atomically writes the file to `path` (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::StorageError`] on any I/O failure.
    pub fn write_atomic(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| KeywardError::StorageError {
            reason: format!("keystore serialization failed: {e}"),
        })?;

        let tmp_path = path.with_extension("json.tmp");
        write_private(&tmp_path, json.as_bytes())?;

        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            KeywardError::StorageError {
                reason: format!("failed to rename keystore file: {e}"),
            }
        })?;

        tracing::info!(path = %path.display(), "keystore saved");
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| KeywardError::StorageError {
            reason: format!("failed to write keystore file: {e}"),
        })?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| KeywardError::StorageError {
            reason: format!("failed to write keystore file: {e}"),
        })
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| KeywardError::StorageError {
        reason: format!("failed to write keystore file: {e}"),
    })
}

// ---------------------------------------------------------------------------
// KeystoreDir
// ---------------------------------------------------------------------------

/// The directory holding keystore generations.
#[derive(Clone, Debug)]
pub struct KeystoreDir {
    root: PathBuf,
}

impl KeystoreDir {
    /// Wraps `root`. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Lists keystore files, oldest first.
    ///
    /// A missing directory lists as empty.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::StorageError`] if the directory exists
    /// but cannot be read.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(KeywardError::StorageError {
                    reason: format!("failed to read keystore directory: {e}"),
                })
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_keystore_name(path))
            .collect();
        // Timestamps are fixed-width, so name order is creation order.
        files.sort();
        Ok(files)
    }

    /// The authoritative (most recent) keystore file, if any.
    ///
    /// # Errors
    ///
    /// Propagates [`KeystoreDir::list`] failures.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop())
    }

    /// Returns `true` if at least one keystore file exists.
    pub fn has_keystore(&self) -> bool {
        matches!(self.latest(), Ok(Some(_)))
    }

    /// Allocates a path for a new keystore generation.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::StorageError`] if the directory cannot
    /// be created.
    pub fn new_generation_path(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|e| KeywardError::StorageError {
            reason: format!("failed to create keystore directory: {e}"),
        })?;

        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        for n in 0..1000u32 {
            let path = self
                .root
                .join(format!("{FILE_PREFIX}{stamp}-{n:03}{FILE_SUFFIX}"));
            if !path.exists() {
                return Ok(path);
            }
        }
        Err(KeywardError::StorageError {
            reason: "too many keystore generations in one millisecond".into(),
        })
    }

    /// Removes every keystore generation. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::StorageError`] if a file cannot be removed.
    pub fn remove_all(&self) -> Result<usize> {
        let files = self.list()?;
        for path in &files {
            match fs::remove_file(path) {
                Ok(()) => tracing::info!(path = %path.display(), "keystore removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(KeywardError::StorageError {
                        reason: format!("failed to remove keystore: {e}"),
                    })
                }
            }
        }
        Ok(files.len())
    }
}

fn is_keystore_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
