//! Commands and status types for transport → daemon communication.
//!
//! [`DaemonCommand`] is the bounded-channel message type that the IPC
//! server, the native-messaging host and tests use to drive the
//! daemon. Requests carry a `oneshot::Sender` for the reply.
//!
//! Commands are processed one at a time inside the event loop, so
//! every state mutation is serialized.

use chrono::{DateTime, Utc};
use keyward_protocol::request::Request;
use keyward_types::Result;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::state::DaemonState;

/// Reply channel for a request.
pub type Reply = oneshot::Sender<Result<Value>>;

// ---------------------------------------------------------------------------
// DaemonCommand
// ---------------------------------------------------------------------------

/// Commands accepted by the daemon event loop.
pub enum DaemonCommand {
    /// A decoded request from either transport.
    ///
    /// The reply carries the response payload on success. Its shape
    /// depends on the request type (see [`crate::handler`]).
    Request {
        /// The request.
        request: Request,
        /// Reply channel.
        reply: Reply,
    },

    /// A transport session connected.
    SessionOpened,

    /// A transport session disconnected.
    SessionClosed,

    /// Lock the keystore and exit the event loop.
    Shutdown,
}

impl DaemonCommand {
    /// Wraps a request, returning the command and its reply receiver.
    pub fn request(request: Request) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (reply, rx) = oneshot::channel();
        (Self::Request { request, reply }, rx)
    }
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for DaemonCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request { request, .. } => f
                .debug_struct("Request")
                .field("id", &request.id)
                .field("kind", &request.kind)
                .field("origin", &request.origin)
                .finish_non_exhaustive(),
            Self::SessionOpened => f.write_str("SessionOpened"),
            Self::SessionClosed => f.write_str("SessionClosed"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

// ---------------------------------------------------------------------------
// DaemonStatus
// ---------------------------------------------------------------------------

/// Snapshot returned by `get_status` / `wallet_getStatus`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    /// Current lifecycle state.
    pub state: DaemonState,
    /// State before the last transition.
    pub previous_state: Option<DaemonState>,
    /// Whether the circuit breaker has tripped.
    pub breaker_tripped: bool,
    /// Consecutive unhandled errors.
    pub error_count: u32,
    /// Whether a keystore file exists.
    pub has_keystore: bool,
    /// Whether keys are in memory.
    pub is_unlocked: bool,
    /// Visible accounts, empty while locked.
    pub accounts: Vec<String>,
    /// Connected transport sessions.
    pub active_session_count: usize,
    /// Whether auto-lock is on.
    pub auto_lock_enabled: bool,
    /// Normal auto-lock timeout, in milliseconds.
    pub auto_lock_timeout_ms: u64,
    /// When the wallet was unlocked.
    pub unlock_timestamp: Option<DateTime<Utc>>,
    /// Daemon version.
    pub version: &'static str,
}
