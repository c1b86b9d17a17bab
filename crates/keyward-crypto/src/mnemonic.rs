//! BIP39 mnemonic generation, parsing, and seed derivation.
//!
//! New wallets get a 12-word English mnemonic (128-bit entropy).
//! Imported phrases of any standard length (12–24 words) are accepted
//! after checksum validation. Seeds are derived with an empty BIP39
//! passphrase.
//!
//! Reference: <https://github.com/bitcoin/bips/blob/master/bip-0039.mediawiki>

use bip39::Language;
use keyward_types::{KeywardError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Entropy size for newly generated mnemonics (12 words).
const ENTROPY_LEN: usize = 16;

// ---------------------------------------------------------------------------
// MnemonicPhrase
// ---------------------------------------------------------------------------

/// A validated BIP39 phrase, normalized to single-space separated
/// lower-case words.
///
/// The inner string is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MnemonicPhrase(String);

impl MnemonicPhrase {
    /// Returns the phrase as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the number of words in the phrase.
    pub fn word_count(&self) -> usize {
        self.0.split_whitespace().count()
    }
}

// MnemonicPhrase does not implement Clone/Debug to prevent leakage.

// ---------------------------------------------------------------------------
// Seed
// ---------------------------------------------------------------------------

/// A 64-byte BIP39 seed. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed([u8; 64]);

impl Seed {
    /// Fixed byte length of a BIP39 seed.
    pub const LEN: usize = 64;

    /// Creates a [`Seed`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Returns the raw 64-byte seed.
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Generates a new random 12-word English mnemonic.
///
/// # Errors
///
/// Returns [`KeywardError::CryptoError`] if the entropy is rejected by
/// the BIP39 encoder (cannot happen for 16 bytes).
pub fn generate_mnemonic() -> Result<MnemonicPhrase> {
    let mut entropy = [0u8; ENTROPY_LEN];
    OsRng.fill_bytes(&mut entropy);

    let result = bip39::Mnemonic::from_entropy_in(Language::English, &entropy)
        .map(|m| MnemonicPhrase(m.to_string()))
        .map_err(|e| KeywardError::CryptoError {
            reason: format!("mnemonic generation failed: {e}"),
        });

    entropy.zeroize();
    result
}

/// Parses and validates a user-supplied phrase.
///
/// Whitespace is collapsed and words are lower-cased before the
/// checksum is verified.
///
/// # Errors
///
/// Returns [`KeywardError::InvalidSecret`] if a word is not in the
/// English wordlist, the word count is not a BIP39 length, or the
/// checksum fails.
pub fn parse_mnemonic(phrase: &str) -> Result<MnemonicPhrase> {
    let mut normalized = phrase
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");

    let parsed = bip39::Mnemonic::parse_in_normalized(Language::English, &normalized);
    match parsed {
        Ok(_) => Ok(MnemonicPhrase(normalized)),
        Err(_) => {
            normalized.zeroize();
            Err(KeywardError::InvalidSecret)
        }
    }
}

/// Derives the 64-byte BIP39 seed (empty passphrase).
///
/// # Errors
///
/// Returns [`KeywardError::InvalidSecret`] if the phrase no longer
/// validates.
pub fn mnemonic_to_seed(phrase: &MnemonicPhrase) -> Result<Seed> {
    let mnemonic = bip39::Mnemonic::parse_in_normalized(Language::English, phrase.as_str())
        .map_err(|_| KeywardError::InvalidSecret)?;
    Ok(Seed(mnemonic.to_seed_normalized("")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_mnemonic_has_twelve_words() -> std::result::Result<(), KeywardError> {
        let m = generate_mnemonic()?;
        assert_eq!(m.word_count(), 12);
        // Round-trips through the parser.
        let reparsed = parse_mnemonic(m.as_str())?;
        assert_eq!(reparsed.as_str(), m.as_str());
        Ok(())
    }

    #[test]
    fn generated_mnemonics_differ() -> std::result::Result<(), KeywardError> {
        assert_ne!(generate_mnemonic()?.as_str(), generate_mnemonic()?.as_str());
        Ok(())
    }

    #[test]
    fn parse_normalizes_whitespace_and_case() -> std::result::Result<(), KeywardError> {
        let m = parse_mnemonic("  Test test  TEST test test test test test test test test junk ")?;
        assert_eq!(
            m.as_str(),
            "test test test test test test test test test test test junk"
        );
        Ok(())
    }

    #[test]
    fn bad_checksum_rejected() {
        let result = parse_mnemonic("test test test test test test test test test test test test");
        assert!(matches!(result, Err(KeywardError::InvalidSecret)));
    }

    #[test]
    fn unknown_word_rejected() {
        let result = parse_mnemonic("test test test test test test test test test test test zzzz");
        assert!(matches!(result, Err(KeywardError::InvalidSecret)));
    }

    #[test]
    fn seed_vector() -> std::result::Result<(), KeywardError> {
        // BIP39 reference vector (empty passphrase, no "TREZOR").
        let m = parse_mnemonic(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        )?;
        let seed = mnemonic_to_seed(&m)?;
        assert_eq!(
            hex::encode(&seed.as_bytes()[..8]),
            "5eb00bbddcf06908"
        );
        Ok(())
    }
}
