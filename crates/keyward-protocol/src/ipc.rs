//! IPC message model for the management CLI.
//!
//! Messages are JSON objects `{id, type, data, timestamp}`, one per
//! line. Responses echo the request `id`; the client correlates on it.

use keyward_types::{KeywardError, Result, ValidationCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::request::{Origin, Request, RequestType};

/// `type` of an error response.
pub const ERROR: &str = "error";
/// `type` of the `get_status` response.
pub const STATUS_RESPONSE: &str = "status_response";
/// `type` of the `unlock_keystore` response.
pub const UNLOCK_RESPONSE: &str = "unlock_response";

/// Line terminator between messages.
pub const DELIMITER: u8 = b'\n';

/// One IPC message in either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    /// UUID v4 correlation id.
    pub id: String,
    /// Message type, e.g. `unlock_keystore` or `status_response`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload.
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Send time, Unix epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

fn empty_object() -> Value {
    json!({})
}

impl IpcMessage {
    /// A new message with a fresh id.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, data)
    }

    fn with_id(id: String, kind: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            kind: kind.into(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A response to `self` carrying the same id.
    pub fn reply(&self, kind: impl Into<String>, data: Value) -> Self {
        Self::with_id(self.id.clone(), kind, data)
    }

    /// An `error` response to `self`.
    pub fn error_reply(&self, err: &KeywardError) -> Self {
        self.reply(ERROR, error_data(err))
    }

    /// Converts to a canonical [`Request`] from the CLI origin.
    ///
    /// # Errors
    ///
    /// Returns an `invalid_request` validation error for unknown types
    /// and for native-only methods.
    pub fn into_request(self) -> Result<Request> {
        let kind = RequestType::from_wire(&self.kind)
            .filter(|k| !k.is_native())
            .ok_or_else(|| {
                KeywardError::validation(
                    ValidationCode::InvalidRequest,
                    format!("unknown message type: {}", self.kind),
                )
            })?;
        let data = if self.data.is_null() { empty_object() } else { self.data };
        Ok(Request {
            id: self.id,
            kind,
            data,
            origin: Origin::Cli,
            timestamp: self.timestamp,
        })
    }

    /// Serializes as one newline-terminated line.
    ///
    /// # Errors
    ///
    /// [`KeywardError::ProtocolError`] if serialization fails.
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self).map_err(|e| KeywardError::ProtocolError {
            reason: format!("ipc serialization failed: {e}"),
        })?;
        line.push(DELIMITER);
        Ok(line)
    }

    /// Parses one line (terminator optional).
    ///
    /// # Errors
    ///
    /// [`KeywardError::ParseError`] for malformed JSON.
    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim_end()).map_err(|e| KeywardError::ParseError {
            reason: e.to_string(),
        })
    }
}

/// The `{code, message}` payload of an `error` message.
pub fn error_data(err: &KeywardError) -> Value {
    json!({ "code": err.wire_code(), "message": err.to_string() })
}

/// Rebuilds the error carried by an `error` message's `data`.
///
/// Codes without a payload-free variant (and unknown codes) come back
/// as [`KeywardError::ProtocolError`] carrying the remote message.
pub fn error_from_data(data: &Value) -> KeywardError {
    let code = data.get("code").and_then(Value::as_str).unwrap_or("unknown");
    let message = data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let validation = match code {
        "daemon_not_ready" => Some(ValidationCode::DaemonNotReady),
        "wallet_locked" => Some(ValidationCode::WalletLocked),
        "no_keystore" => Some(ValidationCode::NoKeystore),
        "permission_denied" => Some(ValidationCode::PermissionDenied),
        "invalid_request" => Some(ValidationCode::InvalidRequest),
        "rate_limited" => Some(ValidationCode::RateLimited),
        _ => None,
    };
    if let Some(code) = validation {
        return KeywardError::Validation { code, message };
    }

    match code {
        "invalid_password" => KeywardError::InvalidPassword,
        "invalid_secret" => KeywardError::InvalidSecret,
        "locked" => KeywardError::Locked,
        "no_mnemonic" => KeywardError::NoMnemonic,
        "cannot_hide_primary" => KeywardError::CannotHidePrimary,
        "user_rejected" => KeywardError::UserRejected,
        "connection_closed" => KeywardError::ConnectionClosed,
        "breaker_tripped" => KeywardError::BreakerTripped,
        _ => KeywardError::ProtocolError {
            reason: format!("{code}: {message}"),
        },
    }
}

/// The response `type` for a request `type`.
pub fn response_type(kind: RequestType) -> String {
    match kind {
        RequestType::GetStatus => STATUS_RESPONSE.to_string(),
        RequestType::UnlockKeystore => UNLOCK_RESPONSE.to_string(),
        other => format!("{}_response", other.as_str()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
