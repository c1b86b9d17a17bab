//! Cryptographic primitives for the keyward key-custody daemon.
//!
//! This crate is the **sole** location for cryptographic operations.
//! No other crate in the workspace performs raw crypto directly.
//!
//! # Modules
//!
//! - [`kdf`] — scrypt key derivation with a bounded memory cost
//! - [`aead`] — AES-256-GCM with a detached authentication tag
//! - [`envelope`] — password-sealed envelope (scrypt + AES-256-GCM)
//! - [`mnemonic`] — BIP39 mnemonic generation, parsing and seeds
//! - [`hd_derive`] — BIP32/BIP44 secp256k1 key derivation
//! - [`signing`] — Ethereum keys, addresses and EIP-191 signatures
//! - [`transaction`] — legacy and EIP-1559 transaction signing

pub mod aead;
pub mod envelope;
pub mod hd_derive;
pub mod kdf;
pub mod mnemonic;
pub mod signing;
pub mod transaction;
