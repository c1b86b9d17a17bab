//! Core shared types for the keyward key-custody daemon.
//!
//! This crate defines the types every other crate in the workspace
//! agrees on: the Ethereum [`Address`], the error taxonomy
//! ([`KeywardError`]) and the daemon configuration ([`config::AppConfig`]).
//! No other crate should define shared types.

pub mod config;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// 20-byte Ethereum account address.
///
/// `Display` renders the canonical lower-case `0x`-prefixed form used
/// for every lookup. Mixed-case (EIP-55) rendering lives in
/// `keyward-crypto` because it needs Keccak-256.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    /// The fixed byte length of an address.
    pub const LEN: usize = 20;

    /// Creates a new `Address` from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Returns the lower-case `0x`-prefixed hex form.
    pub fn to_lower_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = KeywardError;

    /// Parses a `0x`-prefixed 40-hex-character address in any case.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| KeywardError::InvalidAddress {
                reason: "address must be 0x-prefixed".into(),
            })?;
        if body.len() != 40 {
            return Err(KeywardError::InvalidAddress {
                reason: format!("expected 40 hex characters, got {}", body.len()),
            });
        }
        let bytes = hex::decode(body).map_err(|_| KeywardError::InvalidAddress {
            reason: "invalid hex encoding".into(),
        })?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_lower_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Normalizes an address string for case-insensitive lookup.
///
/// Does not validate the hex body; callers that need validation parse
/// into [`Address`] instead.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

// ---------------------------------------------------------------------------
// ValidationCode
// ---------------------------------------------------------------------------

/// Machine-readable rejection codes produced by the validation pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    /// Daemon is starting or in the ERROR state.
    DaemonNotReady,
    /// Operation needs an unlocked wallet.
    WalletLocked,
    /// Operation needs a keystore on disk and none exists.
    NoKeystore,
    /// Origin lacks a permission grant for the request type.
    PermissionDenied,
    /// A required field is missing or malformed.
    InvalidRequest,
    /// Origin exceeded the quota for the request type.
    RateLimited,
}

impl ValidationCode {
    /// Returns the snake_case wire code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DaemonNotReady => "daemon_not_ready",
            Self::WalletLocked => "wallet_locked",
            Self::NoKeystore => "no_keystore",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidRequest => "invalid_request",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Native-messaging error codes
// ---------------------------------------------------------------------------

/// The user declined an approval prompt.
pub const NATIVE_USER_REJECTED: i64 = 4001;

/// General failure.
pub const NATIVE_GENERAL_FAILURE: i64 = -1;

/// The frame was not valid JSON.
pub const NATIVE_PARSE_ERROR: i64 = -32700;

/// The method is not recognized.
pub const NATIVE_UNKNOWN_METHOD: i64 = -32601;

// ---------------------------------------------------------------------------
// KeywardError
// ---------------------------------------------------------------------------

/// Unified error type for the keyward workspace.
///
/// Variants follow the daemon's error taxonomy: validation rejections,
/// keystore failures, protocol failures, user rejection, and the
/// circuit-breaker conditions. `Display` output is safe to send to a
/// client; it never contains paths or secret material.
#[derive(Debug, Error)]
pub enum KeywardError {
    /// The validation pipeline rejected the request before any side effect.
    #[error("{message}")]
    Validation {
        /// Machine-readable rejection code.
        code: ValidationCode,
        /// Human-readable description.
        message: String,
    },

    /// Password shorter than the minimum length.
    #[error("password must be at least {min} characters")]
    WeakPassword {
        /// Minimum accepted length.
        min: usize,
    },

    /// Import secret is neither a mnemonic nor a raw private key.
    #[error("secret is neither a mnemonic phrase nor a 0x-prefixed private key")]
    InvalidSecret,

    /// The password did not authenticate the keystore.
    #[error("invalid password")]
    InvalidPassword,

    /// The keystore file or envelope is malformed.
    #[error("keystore is corrupt: {reason}")]
    Corrupt {
        /// Human-readable description of the corruption.
        reason: String,
    },

    /// The operation needs an unlocked keystore.
    #[error("keystore is locked")]
    Locked,

    /// No account with the given address exists.
    #[error("account not found: {address}")]
    AccountNotFound {
        /// Address as supplied by the caller.
        address: String,
    },

    /// The wallet was imported from a raw key and cannot derive accounts.
    #[error("wallet has no mnemonic; cannot derive further accounts")]
    NoMnemonic,

    /// The primary account (index 0) cannot be hidden.
    #[error("the primary account cannot be hidden")]
    CannotHidePrimary,

    /// No keystore file exists.
    #[error("no keystore found")]
    NoKeystore,

    /// The address string is malformed.
    #[error("invalid address: {reason}")]
    InvalidAddress {
        /// Human-readable description.
        reason: String,
    },

    /// The human approver declined the request.
    #[error("user rejected the request")]
    UserRejected,

    /// A frame or message could not be parsed.
    #[error("parse error: {reason}")]
    ParseError {
        /// Human-readable description.
        reason: String,
    },

    /// A correlated request did not receive a reply in time.
    #[error("request timed out after {millis} ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds.
        millis: u64,
    },

    /// The connection closed while a request was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// A state transition not present in the transition table.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state name.
        from: String,
        /// Requested state name.
        to: String,
    },

    /// Another live daemon already serves the management socket.
    #[error("management socket is already in use by another daemon")]
    SocketInUse,

    /// The circuit breaker tripped; the daemon needs an external restart.
    #[error("circuit breaker tripped; restart required")]
    BreakerTripped,

    /// A cryptographic primitive failed.
    #[error("crypto error: {reason}")]
    CryptoError {
        /// Human-readable description.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description.
        reason: String,
    },

    /// A transport-level failure (bind, read, write).
    #[error("protocol error: {reason}")]
    ProtocolError {
        /// Human-readable description.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description.
        reason: String,
    },
}

impl KeywardError {
    /// Creates a validation rejection.
    pub fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Returns the machine-readable code sent over IPC.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code.as_str(),
            Self::WeakPassword { .. } => "weak_password",
            Self::InvalidSecret => "invalid_secret",
            Self::InvalidPassword => "invalid_password",
            Self::Corrupt { .. } => "corrupt",
            Self::Locked => "locked",
            Self::AccountNotFound { .. } => "account_not_found",
            Self::NoMnemonic => "no_mnemonic",
            Self::CannotHidePrimary => "cannot_hide_primary",
            Self::NoKeystore => "no_keystore",
            Self::InvalidAddress { .. } => "invalid_address",
            Self::UserRejected => "user_rejected",
            Self::ParseError { .. } => "parse_error",
            Self::Timeout { .. } => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SocketInUse => "socket_in_use",
            Self::BreakerTripped => "breaker_tripped",
            Self::CryptoError { .. } => "crypto_error",
            Self::StorageError { .. } => "storage_error",
            Self::ProtocolError { .. } => "protocol_error",
            Self::ConfigError { .. } => "config_error",
        }
    }

    /// Returns the numeric code sent over native messaging.
    pub fn native_code(&self) -> i64 {
        match self {
            Self::UserRejected => NATIVE_USER_REJECTED,
            Self::ParseError { .. } => NATIVE_PARSE_ERROR,
            _ => NATIVE_GENERAL_FAILURE,
        }
    }

    /// Returns `true` for errors that are expected outcomes of a
    /// request (rejections, wrong passwords, user declines) rather
    /// than daemon faults. Only faults feed the circuit breaker.
    pub fn is_expected(&self) -> bool {
        !matches!(
            self,
            Self::Corrupt { .. }
                | Self::CryptoError { .. }
                | Self::StorageError { .. }
                | Self::ProtocolError { .. }
                | Self::ConfigError { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Result alias
// ---------------------------------------------------------------------------

/// Convenience result type using [`KeywardError`].
pub type Result<T> = std::result::Result<T, KeywardError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
