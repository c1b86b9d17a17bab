//! Canonical request model shared by both transports.
//!
//! Each transport maps its own method / type names onto a
//! [`RequestType`] and wraps the payload in a [`Request`]. The
//! validation pipeline and the event loop only ever see `Request`.

use std::fmt;

use keyward_types::{KeywardError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// RequestType
// ---------------------------------------------------------------------------

/// Every operation the daemon understands, from either transport.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RequestType {
    // IPC (management CLI)
    UnlockKeystore,
    LockKeystore,
    GetStatus,
    Ping,
    Shutdown,
    GetAccounts,
    CreateKeystore,
    ImportKeystore,
    DeleteKeystore,
    CreateAccount,
    HideAccount,
    ShowAccount,
    SetAccountLabel,
    SignTransaction,
    SignMessage,
    // Native messaging (browser extension)
    EthRequestAccounts,
    EthAccounts,
    EthSendTransaction,
    EthSignTransaction,
    PersonalSign,
    EthSign,
    WalletGetStatus,
    WalletPing,
}

/// Quota classes for rate limiting.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RateClass {
    SignTransaction,
    SignMessage,
    UnlockKeystore,
    GetStatus,
    GetAccounts,
    Default,
}

const ALL_TYPES: [RequestType; 23] = [
    RequestType::UnlockKeystore,
    RequestType::LockKeystore,
    RequestType::GetStatus,
    RequestType::Ping,
    RequestType::Shutdown,
    RequestType::GetAccounts,
    RequestType::CreateKeystore,
    RequestType::ImportKeystore,
    RequestType::DeleteKeystore,
    RequestType::CreateAccount,
    RequestType::HideAccount,
    RequestType::ShowAccount,
    RequestType::SetAccountLabel,
    RequestType::SignTransaction,
    RequestType::SignMessage,
    RequestType::EthRequestAccounts,
    RequestType::EthAccounts,
    RequestType::EthSendTransaction,
    RequestType::EthSignTransaction,
    RequestType::PersonalSign,
    RequestType::EthSign,
    RequestType::WalletGetStatus,
    RequestType::WalletPing,
];

impl RequestType {
    /// The wire name (IPC `type` or native `method`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnlockKeystore => "unlock_keystore",
            Self::LockKeystore => "lock_keystore",
            Self::GetStatus => "get_status",
            Self::Ping => "ping",
            Self::Shutdown => "shutdown",
            Self::GetAccounts => "get_accounts",
            Self::CreateKeystore => "create_keystore",
            Self::ImportKeystore => "import_keystore",
            Self::DeleteKeystore => "delete_keystore",
            Self::CreateAccount => "create_account",
            Self::HideAccount => "hide_account",
            Self::ShowAccount => "show_account",
            Self::SetAccountLabel => "set_account_label",
            Self::SignTransaction => "sign_transaction",
            Self::SignMessage => "sign_message",
            Self::EthRequestAccounts => "eth_requestAccounts",
            Self::EthAccounts => "eth_accounts",
            Self::EthSendTransaction => "eth_sendTransaction",
            Self::EthSignTransaction => "eth_signTransaction",
            Self::PersonalSign => "personal_sign",
            Self::EthSign => "eth_sign",
            Self::WalletGetStatus => "wallet_getStatus",
            Self::WalletPing => "wallet_ping",
        }
    }

    /// Looks up a wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        ALL_TYPES.iter().copied().find(|t| t.as_str() == name)
    }

    /// Returns `true` for types carried by the native-messaging transport.
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            Self::EthRequestAccounts
                | Self::EthAccounts
                | Self::EthSendTransaction
                | Self::EthSignTransaction
                | Self::PersonalSign
                | Self::EthSign
                | Self::WalletGetStatus
                | Self::WalletPing
        )
    }

    /// Types admitted regardless of daemon state.
    pub fn always_allowed(&self) -> bool {
        matches!(
            self,
            Self::GetStatus | Self::Ping | Self::Shutdown | Self::WalletGetStatus | Self::WalletPing
        )
    }

    /// Types that need a keystore file on disk.
    pub fn requires_keystore(&self) -> bool {
        matches!(
            self,
            Self::UnlockKeystore
                | Self::GetAccounts
                | Self::CreateAccount
                | Self::HideAccount
                | Self::ShowAccount
                | Self::SetAccountLabel
                | Self::SignTransaction
                | Self::SignMessage
                | Self::EthRequestAccounts
                | Self::EthAccounts
                | Self::EthSendTransaction
                | Self::EthSignTransaction
                | Self::PersonalSign
                | Self::EthSign
        )
    }

    /// Types that need the daemon to be `UNLOCKED`.
    pub fn requires_unlocked(&self) -> bool {
        matches!(
            self,
            Self::GetAccounts
                | Self::CreateAccount
                | Self::HideAccount
                | Self::ShowAccount
                | Self::SetAccountLabel
                | Self::SignTransaction
                | Self::SignMessage
                | Self::EthAccounts
                | Self::EthSendTransaction
                | Self::EthSignTransaction
                | Self::PersonalSign
                | Self::EthSign
        )
    }

    /// Types that produce a signature.
    pub fn is_signing(&self) -> bool {
        matches!(self.rate_class(), RateClass::SignTransaction | RateClass::SignMessage)
    }

    /// The quota class this type counts against.
    pub fn rate_class(&self) -> RateClass {
        match self {
            Self::SignTransaction | Self::EthSendTransaction | Self::EthSignTransaction => {
                RateClass::SignTransaction
            }
            Self::SignMessage | Self::PersonalSign | Self::EthSign => RateClass::SignMessage,
            Self::UnlockKeystore => RateClass::UnlockKeystore,
            Self::GetStatus | Self::WalletGetStatus => RateClass::GetStatus,
            Self::GetAccounts | Self::EthAccounts => RateClass::GetAccounts,
            _ => RateClass::Default,
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Logical identity of a requester.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// The local management CLI.
    Cli,
    /// A web page, identified by its origin URL.
    Browser(String),
}

impl Origin {
    const CLI: &'static str = "cli";

    /// Parses an origin string; `"cli"` is the CLI, anything else a page.
    pub fn parse(value: &str) -> Self {
        if value == Self::CLI {
            Self::Cli
        } else {
            Self::Browser(value.to_string())
        }
    }

    /// Returns `true` for the management CLI.
    pub fn is_cli(&self) -> bool {
        matches!(self, Self::Cli)
    }

    /// String form used as a rate-limit and permission key.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cli => Self::CLI,
            Self::Browser(url) => url,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Origin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A decoded inbound request, ready for validation.
#[derive(Clone, Debug)]
pub struct Request {
    /// Transport-level correlation id.
    pub id: String,
    /// The operation.
    pub kind: RequestType,
    /// Operation parameters as a JSON object.
    pub data: Value,
    /// Who is asking.
    pub origin: Origin,
    /// Receive time, Unix epoch milliseconds.
    pub timestamp: i64,
}

impl Request {
    /// Builds a request stamped with the current time.
    pub fn new(id: impl Into<String>, kind: RequestType, data: Value, origin: Origin) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
            origin,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Returns `true` if `data.<field>` is present and not null.
    pub fn has_field(&self, field: &str) -> bool {
        self.data.get(field).map(|v| !v.is_null()).unwrap_or(false)
    }

    /// `data.<field>` as a string, if it is one.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }

    /// `data.<field>` as a string.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_request` validation error if the field is
    /// missing or not a string.
    pub fn require_str(&self, field: &str) -> Result<&str> {
        self.str_field(field).ok_or_else(|| {
            KeywardError::validation(
                keyward_types::ValidationCode::InvalidRequest,
                format!("{}: data.{field} must be a string", self.kind),
            )
        })
    }

    /// `data.<field>` as a bool, defaulting to `false`.
    pub fn bool_field(&self, field: &str) -> bool {
        self.data.get(field).and_then(Value::as_bool).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
