//! Transports for the keyward daemon.
//!
//! Both transports are thin translation shims: they decode wire
//! messages into canonical requests, hand them to the daemon event
//! loop as `DaemonCommand`s, and encode the replies. No admission or
//! keystore logic lives here.
//!
//! # Security model
//!
//! - **IPC** — Unix socket created with `0600` permissions; every
//!   request carries the `cli` origin.
//! - **Native messaging** — stdio owned by the browser; every request
//!   carries the page origin attached by the extension and goes
//!   through the permission check.
//!
//! # Modules
//!
//! - [`config`] — `IpcConfig` (socket path, request timeout).
//! - [`server`] — `IpcServer::start()` entry point.
//! - [`client`] — `IpcClient`, correlated requests over the socket.
//! - [`native_host`] — `NativeHost`, the length-prefixed stdio loop.

#[cfg(unix)]
pub mod client;
pub mod config;
pub mod native_host;
#[cfg(unix)]
pub mod server;
mod shutdown;

#[cfg(unix)]
pub use client::IpcClient;
pub use config::IpcConfig;
pub use native_host::NativeHost;
#[cfg(unix)]
pub use server::IpcServer;
