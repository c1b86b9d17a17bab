//! Wire protocols for the keyward daemon.
//!
//! Both transports decode into the same canonical [`request::Request`]
//! before anything else looks at them.
//!
//! # Modules
//!
//! - [`request`] — `Request`, `RequestType`, `Origin`
//! - [`native`] — 4-byte little-endian length-prefixed JSON frames
//!   (browser extension over stdio)
//! - [`ipc`] — newline-delimited `{id, type, data, timestamp}`
//!   messages (management CLI over a Unix socket)

pub mod ipc;
pub mod native;
pub mod request;

pub use request::{Origin, Request, RequestType};
