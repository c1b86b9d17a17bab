//! Events emitted by the daemon event loop.
//!
//! Delivered over a bounded `mpsc` channel taken with
//! [`crate::Daemon::take_event_receiver`]. The loop never blocks on a
//! slow consumer: when the channel is full the event is dropped.

use crate::state::DaemonState;

/// Something observable happened inside the daemon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonEvent {
    /// The lifecycle state changed.
    StateChanged {
        /// State left.
        from: DaemonState,
        /// State entered.
        to: DaemonState,
    },
    /// The keystore was unlocked.
    Unlocked {
        /// Visible accounts.
        accounts: Vec<String>,
    },
    /// The keystore was locked.
    Locked {
        /// What caused the lock (`request`, `auto_lock`, `removed`, ...).
        reason: &'static str,
    },
    /// A transport session connected or disconnected.
    SessionsChanged {
        /// Connected sessions after the change.
        active: usize,
    },
    /// The auto-lock deadline passed.
    AutoLockFired,
    /// The circuit breaker tripped.
    BreakerTripped {
        /// Consecutive errors counted.
        errors: u32,
    },
    /// A keystore file appeared on disk.
    KeystoreAppeared,
    /// The last keystore file disappeared from disk.
    KeystoreRemoved,
}
