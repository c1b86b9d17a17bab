//! keyward daemon: Ethereum key custody outside the browser.
//!
//! Usage:
//!
//!   keyward-daemon [OPTIONS]            management socket only
//!   keyward-daemon [OPTIONS] <ORIGIN>   native-messaging host (launched
//!                                       by the browser)
//!
//! Options:
//!
//!   --data-dir <PATH>           Data directory (default: ~/.keyward)
//!   --config <PATH>             Load config from JSON file
//!   --native                    Serve native messaging on stdio
//!   --auto-lock                 Lock after inactivity
//!   --auto-lock-timeout-ms <MS> Inactivity before auto-lock
//!   --approval-timeout-ms <MS>  Decline unanswered prompts
//!   --allow-origin <ORIGIN>     Pre-grant a browser origin (repeatable)
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); stdout belongs to
//! native messaging. Approvals are asked on the controlling terminal.
//! The daemon runs until a `shutdown` request, Ctrl+C, or the browser
//! closing the native-messaging stream.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use keyward_keystore::keystore_file::KeystoreDir;
use keyward_node::approval::SharedGate;
use keyward_node::events::DaemonEvent;
use keyward_node::Daemon;
use keyward_rpc::{IpcConfig, NativeHost};
use keyward_types::{KeywardError, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod approval;
mod config;

use approval::TerminalApprovalGate;
use config::{CliArgs, DaemonConfig, Mode};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const KEYSTORE_DIR: &str = "keystore";

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = CliArgs::parse();
    let daemon_config = match DaemonConfig::resolve(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run_daemon(daemon_config).await {
        tracing::error!("daemon error: {e}");
        std::process::exit(1);
    }

    // A pending blocking read on stdin would otherwise hold the runtime open.
    std::process::exit(0);
}

// ---------------------------------------------------------------------------
// Daemon main logic
// ---------------------------------------------------------------------------

async fn run_daemon(cfg: DaemonConfig) -> Result<()> {
    prepare_data_dir(&cfg.data_dir)?;
    tracing::info!(data_dir = %cfg.data_dir.display(), "data directory ready");

    // -----------------------------------------------------------------------
    // 1. Daemon
    // -----------------------------------------------------------------------

    let gate: SharedGate = Arc::new(TerminalApprovalGate::new());
    let keystore_dir = KeystoreDir::new(cfg.data_dir.join(KEYSTORE_DIR));
    let mut daemon = Daemon::new(cfg.app.clone(), keystore_dir, gate)?;

    if let Some(events) = daemon.take_event_receiver() {
        tokio::spawn(log_events(events));
    }
    let mut daemon_handle = daemon.start()?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "daemon started");

    // -----------------------------------------------------------------------
    // 2. Management socket
    // -----------------------------------------------------------------------

    let ipc_config = IpcConfig::in_data_dir(&cfg.data_dir, &cfg.app);
    let ipc_handle = match start_ipc(&daemon, ipc_config) {
        Ok(handle) => Some(handle),
        // A browser-launched host must still serve the browser when
        // another daemon already owns the socket.
        Err(e) if matches!(cfg.mode, Mode::NativeHost { .. }) => {
            tracing::warn!("management socket unavailable, serving native messaging only: {e}");
            None
        }
        Err(e) => {
            let _ = daemon.shutdown();
            let _ = daemon_handle.await;
            return Err(e);
        }
    };

    // -----------------------------------------------------------------------
    // 3. Native messaging
    // -----------------------------------------------------------------------

    let mut native_handle = match &cfg.mode {
        Mode::NativeHost { origin } => {
            let host = NativeHost::new(
                tokio::io::stdin(),
                tokio::io::stdout(),
                daemon.command_sender(),
                origin.clone(),
            );
            Some(tokio::spawn(host.run(daemon.shutdown_signal())))
        }
        Mode::Management => None,
    };

    // -----------------------------------------------------------------------
    // 4. Wait for shutdown
    // -----------------------------------------------------------------------

    let mut loop_exited = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down...");
        }
        result = &mut daemon_handle => {
            loop_exited = true;
            match result {
                Ok(()) => tracing::info!("event loop finished"),
                Err(e) => tracing::error!(%e, "event loop panicked"),
            }
        }
        result = wait_native(&mut native_handle), if native_handle.is_some() => {
            match result {
                Ok(()) => tracing::info!("browser closed the native-messaging stream"),
                Err(e) => tracing::warn!(%e, "native messaging ended with an error"),
            }
        }
    }

    // Locks the keystore before the loop exits.
    daemon.shutdown()?;
    if !loop_exited {
        let _ = daemon_handle.await;
    }
    if let Some(handle) = ipc_handle {
        let _ = handle.await;
    }

    tracing::info!("daemon stopped");
    Ok(())
}

#[cfg(unix)]
fn start_ipc(daemon: &Daemon, config: IpcConfig) -> Result<JoinHandle<()>> {
    keyward_rpc::IpcServer::start(config, daemon.command_sender(), daemon.shutdown_signal())
}

#[cfg(not(unix))]
fn start_ipc(_daemon: &Daemon, _config: IpcConfig) -> Result<JoinHandle<()>> {
    Err(KeywardError::ConfigError {
        reason: "the management socket requires a Unix platform".into(),
    })
}

async fn wait_native(handle: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match handle {
        Some(handle) => handle.await.map_err(|e| KeywardError::ProtocolError {
            reason: format!("native host task failed: {e}"),
        })?,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Creates the data directory, owner-only on Unix.
fn prepare_data_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| KeywardError::StorageError {
        reason: format!("failed to create data directory '{}': {e}", path.display()),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            KeywardError::StorageError {
                reason: format!("failed to restrict data directory '{}': {e}", path.display()),
            }
        })?;
    }
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<DaemonEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DaemonEvent::BreakerTripped { errors } => {
                tracing::error!(errors, "circuit breaker tripped; restart the daemon to recover");
            }
            DaemonEvent::AutoLockFired => tracing::info!("wallet auto-locked after inactivity"),
            DaemonEvent::KeystoreRemoved => tracing::warn!("keystore removed from disk"),
            other => tracing::debug!(?other, "daemon event"),
        }
    }
}
