//! Daemon lifecycle state machine.
//!
//! ```text
//! STARTING ──▶ READY ──▶ LOCKED ⇄ UNLOCKED
//!    │           ▲         │  ▲      │
//!    │           └─────────┴──┼──────┘
//!    ▼                        │
//!  ERROR ──▶ STARTING | READY ┘
//! ```
//!
//! - `READY` — running, no keystore on disk.
//! - `LOCKED` — a keystore exists; no keys in memory.
//! - `UNLOCKED` — keys are in memory.
//! - `ERROR` — blocked. When entered through the circuit breaker the
//!   daemon stays here until restarted.
//!
//! The state only changes through [`DaemonStateManager::transition`]
//! and the breaker in [`DaemonStateManager::handle_error`].

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use keyward_types::{KeywardError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of transitions kept for diagnostics.
pub const HISTORY_LEN: usize = 10;

// ---------------------------------------------------------------------------
// DaemonState
// ---------------------------------------------------------------------------

/// Lifecycle state of the daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonState {
    /// Initializing; only status requests are served.
    Starting,
    /// Running without a keystore.
    Ready,
    /// Keystore present, keys not in memory.
    Locked,
    /// Keys in memory.
    Unlocked,
    /// Faulted.
    Error,
}

impl DaemonState {
    /// Upper-case state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Locked => "LOCKED",
            Self::Unlocked => "UNLOCKED",
            Self::Error => "ERROR",
        }
    }

    /// Returns `true` if the transition table contains `self -> to`.
    pub fn can_transition_to(&self, to: DaemonState) -> bool {
        use DaemonState::*;
        matches!(
            (self, to),
            (Starting, Ready | Error)
                | (Ready, Locked | Error)
                | (Locked, Unlocked | Ready | Error)
                | (Unlocked, Locked | Ready | Error)
                | (Error, Starting | Ready)
        )
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transition record
// ---------------------------------------------------------------------------

/// One entry of the transition history.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    /// State left.
    pub from: DaemonState,
    /// State entered.
    pub to: DaemonState,
    /// When the transition happened.
    pub at: DateTime<Utc>,
    /// Context supplied by the caller.
    pub metadata: Value,
}

// ---------------------------------------------------------------------------
// DaemonStateManager
// ---------------------------------------------------------------------------

/// Owns the [`DaemonState`] and its circuit breaker.
#[derive(Debug)]
pub struct DaemonStateManager {
    current: DaemonState,
    previous: Option<DaemonState>,
    metadata: Value,
    history: VecDeque<Transition>,
    error_count: u32,
    threshold: u32,
    breaker_tripped: bool,
    last_error: Option<String>,
}

impl DaemonStateManager {
    /// Starts in [`DaemonState::Starting`] with the given breaker
    /// threshold.
    pub fn new(threshold: u32) -> Self {
        Self {
            current: DaemonState::Starting,
            previous: None,
            metadata: Value::Null,
            history: VecDeque::with_capacity(HISTORY_LEN),
            error_count: 0,
            threshold,
            breaker_tripped: false,
            last_error: None,
        }
    }

    /// The current state.
    pub fn current(&self) -> DaemonState {
        self.current
    }

    /// The state before the last transition.
    pub fn previous(&self) -> Option<DaemonState> {
        self.previous
    }

    /// Metadata attached by the last transition.
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    /// The last [`HISTORY_LEN`] transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Errors counted since the last successful transition or request.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Returns `true` once the breaker has tripped.
    pub fn is_breaker_tripped(&self) -> bool {
        self.breaker_tripped
    }

    /// Display text of the most recent counted error.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Moves to `to`.
    ///
    /// On success returns the state that was left. Resets the error
    /// counter unless `to` is [`DaemonState::Error`].
    ///
    /// # Errors
    ///
    /// - [`KeywardError::BreakerTripped`] when leaving a breaker-tripped
    ///   `ERROR`.
    /// - [`KeywardError::InvalidTransition`] for edges outside the
    ///   table. The state is left unchanged.
    pub fn transition(&mut self, to: DaemonState, metadata: Value) -> Result<DaemonState> {
        if self.breaker_tripped {
            return Err(KeywardError::BreakerTripped);
        }
        if !self.current.can_transition_to(to) {
            return Err(KeywardError::InvalidTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        Ok(self.apply(to, metadata))
    }

    fn apply(&mut self, to: DaemonState, metadata: Value) -> DaemonState {
        let from = self.current;
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            at: Utc::now(),
            metadata: metadata.clone(),
        });
        self.previous = Some(from);
        self.current = to;
        self.metadata = metadata;
        if to != DaemonState::Error {
            self.error_count = 0;
        }
        tracing::info!(%from, %to, "daemon state changed");
        from
    }

    /// Records a successful request; consecutive-error counting restarts.
    pub fn record_success(&mut self) {
        self.error_count = 0;
    }

    /// Counts an unhandled error.
    ///
    /// When the count reaches the threshold the daemon is forced into
    /// [`DaemonState::Error`] with the breaker flag set. Returns the
    /// state that was left if the breaker tripped on this call.
    pub fn handle_error(&mut self, err: &KeywardError) -> Option<DaemonState> {
        self.error_count = self.error_count.saturating_add(1);
        self.last_error = Some(err.to_string());
        tracing::warn!(count = self.error_count, threshold = self.threshold, %err, "daemon error");

        if self.breaker_tripped || self.error_count < self.threshold {
            return None;
        }
        let metadata = serde_json::json!({
            "reason": "circuit breaker",
            "errors": self.error_count,
            "lastError": self.last_error,
        });
        let from = self.apply(DaemonState::Error, metadata);
        self.breaker_tripped = true;
        tracing::error!(errors = self.error_count, "circuit breaker tripped; restart required");
        Some(from)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
