//! Encrypted-at-rest wallet storage for the keyward daemon.
//!
//! - [`keystore_file`] — on-disk `KeystoreFile` format and the
//!   timestamped keystore directory
//! - [`account`] — the decrypted `WalletPayload` / `AccountRecord` model
//! - [`job`] — scrypt-bound work split into prepare / run / commit
//!   stages so it can leave the state-owning task
//! - [`keystore`] — the [`Keystore`](keystore::Keystore) component
//! - [`watch`] — keystore directory change detection
//!
//! No plaintext secret material is ever written to disk.

pub mod account;
pub mod job;
pub mod keystore;
pub mod keystore_file;
pub mod watch;

pub use keystore::{AccountChange, CreatedWallet, Keystore};
pub use watch::{spawn_keystore_watcher, KeystoreEvent};
