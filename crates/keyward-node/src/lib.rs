//! keyward daemon runtime.
//!
//! Owns the keystore, the lifecycle state machine, session tracking and
//! admission control, and drives them from one event loop task.
//!
//! # Modules
//!
//! - [`state`] — `DaemonStateManager`: transition table, history,
//!   circuit breaker
//! - [`session`] — `SessionManager`: unlock status, session count,
//!   auto-lock deadline
//! - [`rate_limiter`] — sliding-window limiter keyed by origin and type
//! - [`permissions`] — `PermissionAuthority` and `OriginAllowList`
//! - [`validation`] — the six ordered admission checks
//! - [`approval`] — the `ApprovalGate` capability
//! - [`command`] / [`events`] — channel message types
//! - [`handler`] — request parameter parsing and response shaping
//! - [`daemon`] — `Daemon`: construction, start, shutdown
//! - `event_loop` — the orchestrating `tokio::select!` loop

pub mod approval;
pub mod command;
pub mod daemon;
mod event_loop;
pub mod events;
pub mod handler;
pub mod permissions;
pub mod rate_limiter;
pub mod session;
pub mod state;
pub mod validation;

pub use daemon::Daemon;
