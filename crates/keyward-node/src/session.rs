//! Session tracking and the auto-lock deadline.
//!
//! [`SessionManager`] mirrors the keystore's lock status for reporting,
//! counts connected transport sessions, and computes when the wallet
//! should lock itself. It never locks anything itself; the event loop
//! sleeps until [`SessionManager::deadline`] and performs the lock.
//!
//! Timer policy, when auto-lock is enabled:
//!
//! - unlock and any session activity restart the timer;
//! - while sessions are connected (or none ever were) the normal
//!   timeout applies;
//! - once the count drops back to zero the shorter idle timeout
//!   replaces it until a session connects again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use keyward_types::config::AppConfig;

/// Reportable session state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Whether keys are in memory.
    pub is_unlocked: bool,
    /// Visible account addresses cached at unlock.
    pub accounts: Vec<String>,
    /// Connected transport sessions.
    pub active_session_count: usize,
    /// When the wallet was unlocked.
    pub unlock_timestamp: Option<DateTime<Utc>>,
    /// Whether auto-lock is on.
    pub auto_lock_enabled: bool,
    /// Normal auto-lock timeout, in milliseconds.
    pub auto_lock_timeout_ms: u64,
}

/// Unlock status, connected-session count and auto-lock timer.
#[derive(Debug)]
pub struct SessionManager {
    is_unlocked: bool,
    accounts: Vec<String>,
    active_sessions: usize,
    unlock_timestamp: Option<DateTime<Utc>>,
    auto_lock_enabled: bool,
    auto_lock_timeout: Duration,
    idle_timeout: Duration,
    /// Set when the session count dropped to zero.
    idle: bool,
    last_activity: Option<Instant>,
}

impl SessionManager {
    /// Creates a locked session manager.
    pub fn new(auto_lock_enabled: bool, auto_lock_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            is_unlocked: false,
            accounts: Vec::new(),
            active_sessions: 0,
            unlock_timestamp: None,
            auto_lock_enabled,
            auto_lock_timeout,
            idle_timeout,
            idle: false,
            last_activity: None,
        }
    }

    /// Creates a session manager from the daemon configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.auto_lock_enabled,
            Duration::from_millis(config.auto_lock_timeout_ms),
            Duration::from_millis(config.idle_timeout_ms),
        )
    }

    // -- Keystore events --------------------------------------------------

    /// Records an unlock and starts the timer.
    pub fn on_unlocked(&mut self, accounts: Vec<String>, now: Instant) {
        self.is_unlocked = true;
        self.accounts = accounts;
        self.unlock_timestamp = Some(Utc::now());
        self.last_activity = Some(now);
    }

    /// Records a lock and stops the timer.
    pub fn on_locked(&mut self) {
        self.is_unlocked = false;
        self.accounts.clear();
        self.unlock_timestamp = None;
        self.last_activity = None;
    }

    /// Replaces the cached account list.
    pub fn set_accounts(&mut self, accounts: Vec<String>) {
        if self.is_unlocked {
            self.accounts = accounts;
        }
    }

    // -- Sessions ---------------------------------------------------------

    /// A transport session connected. Returns the new count.
    pub fn add_session(&mut self, now: Instant) -> usize {
        self.active_sessions += 1;
        self.idle = false;
        self.touch(now);
        self.active_sessions
    }

    /// A transport session disconnected. Returns the new count.
    pub fn remove_session(&mut self, now: Instant) -> usize {
        self.active_sessions = self.active_sessions.saturating_sub(1);
        if self.active_sessions == 0 {
            self.idle = true;
        }
        self.touch(now);
        self.active_sessions
    }

    /// Restarts the timer on request activity.
    pub fn touch(&mut self, now: Instant) {
        if self.is_unlocked {
            self.last_activity = Some(now);
        }
    }

    // -- Timer ------------------------------------------------------------

    /// Changes the auto-lock policy at runtime.
    pub fn set_auto_lock(&mut self, enabled: bool, timeout: Duration) {
        self.auto_lock_enabled = enabled;
        self.auto_lock_timeout = timeout;
    }

    /// The timeout currently in force.
    pub fn current_timeout(&self) -> Duration {
        if self.idle {
            self.idle_timeout.min(self.auto_lock_timeout)
        } else {
            self.auto_lock_timeout
        }
    }

    /// When the wallet should lock, or `None` if it should not.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.auto_lock_enabled || !self.is_unlocked {
            return None;
        }
        self.last_activity.map(|at| at + self.current_timeout())
    }

    /// Returns `true` if the deadline has passed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().map(|d| now >= d).unwrap_or(false)
    }

    // -- Accessors --------------------------------------------------------

    /// Whether keys are in memory.
    pub fn is_unlocked(&self) -> bool {
        self.is_unlocked
    }

    /// Cached accounts.
    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }

    /// Connected transport sessions.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions
    }

    /// Reportable state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            is_unlocked: self.is_unlocked,
            accounts: self.accounts.clone(),
            active_session_count: self.active_sessions,
            unlock_timestamp: self.unlock_timestamp,
            auto_lock_enabled: self.auto_lock_enabled,
            auto_lock_timeout_ms: self.auto_lock_timeout.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
