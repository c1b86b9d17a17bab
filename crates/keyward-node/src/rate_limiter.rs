//! Per-origin, per-type sliding-window rate limiter.
//!
//! Each `(origin, request type)` key keeps the timestamps of its
//! admitted requests inside the window. A request is admitted if fewer
//! than the type's quota fall inside the window; rejected requests are
//! not recorded. Keys whose window has fully expired are swept
//! periodically so the map stays bounded by recent traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use keyward_protocol::request::{Origin, RateClass, RequestType};
use keyward_types::config::RateQuotas;
use keyward_types::{KeywardError, Result, ValidationCode};

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Thread-safe sliding-window limiter.
pub struct RateLimiter {
    inner: Mutex<RateLimiterInner>,
    window: Duration,
    quotas: RateQuotas,
}

struct RateLimiterInner {
    map: HashMap<(String, RequestType), VecDeque<Instant>>,
    last_cleanup: Instant,
}

impl RateLimiter {
    /// Creates a limiter with the given window and quotas.
    pub fn new(window: Duration, quotas: RateQuotas) -> Self {
        Self {
            inner: Mutex::new(RateLimiterInner {
                map: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
            window,
            quotas,
        }
    }

    /// Quota for one window of `kind`.
    pub fn quota(&self, kind: RequestType) -> u32 {
        match kind.rate_class() {
            RateClass::SignTransaction => self.quotas.sign_transaction,
            RateClass::SignMessage => self.quotas.sign_message,
            RateClass::UnlockKeystore => self.quotas.unlock_keystore,
            RateClass::GetStatus => self.quotas.get_status,
            RateClass::GetAccounts => self.quotas.get_accounts,
            RateClass::Default => self.quotas.default,
        }
    }

    /// Admits or rejects one request at the current time.
    ///
    /// # Errors
    ///
    /// Returns a `rate_limited` validation error when the quota is used up.
    pub fn check(&self, origin: &Origin, kind: RequestType) -> Result<()> {
        self.check_at(origin, kind, Instant::now())
    }

    /// Admits or rejects one request at `now`.
    ///
    /// # Errors
    ///
    /// Returns a `rate_limited` validation error when the quota is used
    /// up, or [`KeywardError::ProtocolError`] if the lock is poisoned.
    pub fn check_at(&self, origin: &Origin, kind: RequestType, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| KeywardError::ProtocolError {
            reason: "rate limiter lock poisoned".into(),
        })?;

        self.maybe_cleanup(&mut inner, now);

        let quota = self.quota(kind) as usize;
        let window = self.window;
        let hits = inner
            .map
            .entry((origin.as_str().to_string(), kind))
            .or_default();
        prune(hits, now, window);

        if hits.len() >= quota {
            return Err(KeywardError::validation(
                ValidationCode::RateLimited,
                format!(
                    "{kind} from {origin} exceeded {quota} requests per {}s",
                    window.as_secs()
                ),
            ));
        }
        hits.push_back(now);
        Ok(())
    }

    fn maybe_cleanup(&self, inner: &mut RateLimiterInner, now: Instant) {
        if now.saturating_duration_since(inner.last_cleanup) < self.window {
            return;
        }
        inner.last_cleanup = now;
        let window = self.window;
        inner.map.retain(|_, hits| {
            prune(hits, now, window);
            !hits.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }
}

/// Drops timestamps that fell out of the window ending at `now`.
fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = hits.front() {
        if now.saturating_duration_since(*front) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
