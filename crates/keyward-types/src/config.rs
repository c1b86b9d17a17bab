//! Daemon configuration with sensible defaults.
//!
//! All operational parameters are centralized here. The resolved
//! configuration is constructed once at startup and handed to each
//! component's constructor.

use serde::{Deserialize, Serialize};

use crate::{KeywardError, Result};

/// Upper bound on scrypt working memory (`128 * r * N` bytes).
pub const SCRYPT_MAX_MEMORY_BYTES: u64 = 256 * 1024 * 1024;

/// Minimum accepted keystore password length.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Per-request-type quotas for the sliding rate-limit window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateQuotas {
    /// `sign_transaction` and the native transaction methods.
    pub sign_transaction: u32,
    /// `sign_message` and the native message-signing methods.
    pub sign_message: u32,
    /// `unlock_keystore`.
    pub unlock_keystore: u32,
    /// `get_status`.
    pub get_status: u32,
    /// `get_accounts`.
    pub get_accounts: u32,
    /// Every other request type.
    pub default: u32,
}

impl Default for RateQuotas {
    fn default() -> Self {
        Self {
            sign_transaction: 10,
            sign_message: 20,
            unlock_keystore: 5,
            get_status: 100,
            get_accounts: 50,
            default: 30,
        }
    }
}

/// Global daemon configuration.
///
/// Loaded from an optional JSON file (missing fields fall back to the
/// defaults below) and then overridden by command-line flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // ----- Session ---------------------------------------------------------

    /// Whether the wallet locks itself after a period of inactivity.
    ///
    /// Disabled by default: the wallet stays unlocked until an explicit
    /// lock, shutdown, or keystore removal.
    pub auto_lock_enabled: bool,

    /// Inactivity timeout while at least one session is connected, in
    /// milliseconds. Only consulted when `auto_lock_enabled` is set.
    pub auto_lock_timeout_ms: u64,

    /// Shorter timeout applied once the session count drops to zero,
    /// in milliseconds. Only consulted when `auto_lock_enabled` is set.
    pub idle_timeout_ms: u64,

    // ----- Admission control -----------------------------------------------

    /// Length of the sliding rate-limit window, in milliseconds.
    pub rate_window_ms: u64,

    /// Per-type request quotas within one window.
    pub rate_quotas: RateQuotas,

    /// Consecutive unhandled errors that trip the circuit breaker.
    pub breaker_threshold: u32,

    /// Origins granted every request type without prompting.
    ///
    /// `None` disables the permission check entirely. `Some` installs
    /// an allow-list authority; origins approved through a connect
    /// prompt are added at runtime.
    pub allowed_origins: Option<Vec<String>>,

    // ----- Transports ------------------------------------------------------

    /// Correlated IPC request timeout, in milliseconds.
    pub ipc_timeout_ms: u64,

    /// Optional approval prompt timeout, in milliseconds.
    ///
    /// `None` waits for the human indefinitely. `Some(ms)` auto-rejects
    /// a pending prompt once `ms` elapse.
    pub approval_timeout_ms: Option<u64>,

    // ----- Keystore --------------------------------------------------------

    /// Keystore directory polling interval, in milliseconds. Used as a
    /// fallback when native change notification is unavailable.
    pub keystore_poll_interval_ms: u64,

    /// scrypt CPU/memory cost `N` (must be a power of two).
    pub scrypt_n: u32,

    /// scrypt block size `r`.
    pub scrypt_r: u32,

    /// scrypt parallelism `p`.
    pub scrypt_p: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auto_lock_enabled: false,
            auto_lock_timeout_ms: 15 * 60 * 1000,
            idle_timeout_ms: 60 * 1000,
            rate_window_ms: 60 * 1000,
            rate_quotas: RateQuotas::default(),
            breaker_threshold: 5,
            allowed_origins: None,
            ipc_timeout_ms: 5_000,
            approval_timeout_ms: None,
            keystore_poll_interval_ms: 2_000,
            scrypt_n: 16_384,
            scrypt_r: 8,
            scrypt_p: 1,
        }
    }
}

impl AppConfig {
    /// Validates all configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::ConfigError`] naming the first value
    /// outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.auto_lock_timeout_ms == 0 {
            return Err(config_err("auto_lock_timeout_ms must be greater than 0"));
        }

        if self.idle_timeout_ms == 0 {
            return Err(config_err("idle_timeout_ms must be greater than 0"));
        }

        if self.rate_window_ms == 0 {
            return Err(config_err("rate_window_ms must be greater than 0"));
        }

        let q = &self.rate_quotas;
        let quotas = [
            q.sign_transaction,
            q.sign_message,
            q.unlock_keystore,
            q.get_status,
            q.get_accounts,
            q.default,
        ];
        if quotas.iter().any(|&v| v == 0) {
            return Err(config_err("every rate quota must be greater than 0"));
        }

        if self.breaker_threshold == 0 {
            return Err(config_err("breaker_threshold must be greater than 0"));
        }

        if self.ipc_timeout_ms == 0 {
            return Err(config_err("ipc_timeout_ms must be greater than 0"));
        }

        if self.approval_timeout_ms == Some(0) {
            return Err(config_err("approval_timeout_ms must be greater than 0 when set"));
        }

        if self.keystore_poll_interval_ms == 0 {
            return Err(config_err("keystore_poll_interval_ms must be greater than 0"));
        }

        if self.scrypt_n < 2 || !self.scrypt_n.is_power_of_two() {
            return Err(config_err("scrypt_n must be a power of two >= 2"));
        }

        if self.scrypt_r == 0 || self.scrypt_p == 0 {
            return Err(config_err("scrypt_r and scrypt_p must be greater than 0"));
        }

        let memory = 128u64 * u64::from(self.scrypt_r) * u64::from(self.scrypt_n);
        if memory > SCRYPT_MAX_MEMORY_BYTES {
            return Err(config_err("scrypt parameters exceed the 256 MiB memory cap"));
        }

        Ok(())
    }
}

fn config_err(reason: &str) -> KeywardError {
    KeywardError::ConfigError {
        reason: reason.into(),
    }
}
