//! Daemon lifecycle.
//!
//! The [`Daemon`] is the public entry point for the keyward runtime.
//! It owns the keystore and every admission component, and exposes a
//! channel-based API for the transports (IPC server, native host,
//! tests).
//!
//! # Lifecycle
//!
//! ```text
//! Initializing ──start()──▶ Running ──shutdown()──▶ ShuttingDown ──▶ (dropped)
//! ```
//!
//! This is the *task* lifecycle. The wallet lifecycle
//! (`STARTING → READY → LOCKED ⇄ UNLOCKED`) lives in
//! [`crate::state::DaemonStateManager`] and is driven by the event loop.

use std::sync::Arc;
use std::time::Duration;

use keyward_crypto::kdf::ScryptParams;
use keyward_keystore::keystore_file::KeystoreDir;
use keyward_keystore::{spawn_keystore_watcher, Keystore, KeystoreEvent};
use keyward_types::config::AppConfig;
use keyward_types::{KeywardError, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::approval::SharedGate;
use crate::command::DaemonCommand;
use crate::event_loop;
use crate::events::DaemonEvent;
use crate::permissions::{OriginAllowList, PermissionAuthority};
use crate::rate_limiter::RateLimiter;
use crate::session::SessionManager;
use crate::state::DaemonStateManager;
use crate::validation::ValidationPipeline;

// ---------------------------------------------------------------------------
// Channel buffer sizes
// ---------------------------------------------------------------------------

/// Bounded command channel capacity.
///
/// Transports await backpressure if the event loop falls behind.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Bounded daemon event channel capacity.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Bounded keystore watcher channel capacity.
const KEYSTORE_CHANNEL_SIZE: usize = 16;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Task lifecycle of the daemon.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Lifecycle {
    /// Components created, event loop not started.
    Initializing,
    /// Event loop is active.
    Running,
    /// Shutdown signalled.
    ShuttingDown,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// DaemonRuntime (internal)
// ---------------------------------------------------------------------------

/// Owned runtime state moved into the event loop task.
///
/// Not exported. Only [`Daemon`] and the event loop touch it.
pub(crate) struct DaemonRuntime {
    pub keystore: Keystore,
    pub state: DaemonStateManager,
    pub session: SessionManager,
    pub pipeline: ValidationPipeline,
    pub gate: SharedGate,
    pub config: AppConfig,
    pub command_rx: mpsc::Receiver<DaemonCommand>,
    pub keystore_rx: mpsc::Receiver<KeystoreEvent>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub shutdown_tx: Arc<watch::Sender<bool>>,
    pub shutdown_rx: watch::Receiver<bool>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// The key-custody daemon.
///
/// After construction via [`Daemon::new`], call [`Daemon::start`] to
/// spawn the event loop. Interact through channels:
///
/// - Send [`DaemonCommand`]s via [`Daemon::command_sender`].
/// - Receive [`DaemonEvent`]s via [`Daemon::take_event_receiver`].
/// - Shut down via [`DaemonCommand::Shutdown`], a `shutdown` request,
///   or [`Daemon::shutdown`].
pub struct Daemon {
    lifecycle: Lifecycle,

    /// Moved into the event loop by `start()`.
    runtime: Option<DaemonRuntime>,

    /// Moved into the watcher task by `start()`.
    watcher: Option<(KeystoreDir, mpsc::Sender<KeystoreEvent>)>,

    command_tx: mpsc::Sender<DaemonCommand>,
    event_rx: Option<mpsc::Receiver<DaemonEvent>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Daemon {
    /// Creates a daemon over the keystore directory `dir`.
    ///
    /// When `config.allowed_origins` is set, an [`OriginAllowList`]
    /// seeded with those origins becomes the permission authority.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConfigError` if the configuration or the scrypt
    /// parameters are invalid.
    pub fn new(config: AppConfig, dir: KeystoreDir, gate: SharedGate) -> Result<Self> {
        config.validate()?;
        let params = ScryptParams::new(config.scrypt_n, config.scrypt_r, config.scrypt_p);
        params.validate()?;

        let authority = config
            .allowed_origins
            .clone()
            .map(|origins| Box::new(OriginAllowList::new(origins)) as Box<dyn PermissionAuthority>);
        let pipeline = ValidationPipeline::new(
            RateLimiter::new(
                Duration::from_millis(config.rate_window_ms),
                config.rate_quotas.clone(),
            ),
            authority,
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (keystore_tx, keystore_rx) = mpsc::channel(KEYSTORE_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let runtime = DaemonRuntime {
            keystore: Keystore::new(dir.clone(), params),
            state: DaemonStateManager::new(config.breaker_threshold),
            session: SessionManager::from_config(&config),
            pipeline,
            gate,
            config,
            command_rx,
            keystore_rx,
            event_tx,
            shutdown_tx: Arc::clone(&shutdown_tx),
            shutdown_rx,
        };

        Ok(Self {
            lifecycle: Lifecycle::Initializing,
            runtime: Some(runtime),
            watcher: Some((dir, keystore_tx)),
            command_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
        })
    }

    /// Replaces the permission authority. Only effective before
    /// [`Daemon::start`].
    pub fn with_authority(mut self, authority: Box<dyn PermissionAuthority>) -> Self {
        if let Some(rt) = self.runtime.as_mut() {
            rt.pipeline = ValidationPipeline::new(
                RateLimiter::new(
                    Duration::from_millis(rt.config.rate_window_ms),
                    rt.config.rate_quotas.clone(),
                ),
                Some(authority),
            );
        }
        self
    }

    /// Spawns the event loop and the keystore watcher.
    ///
    /// Returns the event loop's `JoinHandle`, which resolves after
    /// shutdown once the keystore has been locked.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConfigError` if called twice.
    pub fn start(&mut self) -> Result<JoinHandle<()>> {
        if self.lifecycle != Lifecycle::Initializing {
            return Err(KeywardError::ConfigError {
                reason: format!("cannot start daemon in state '{}'; expected 'initializing'", self.lifecycle),
            });
        }

        let runtime = self.runtime.take().ok_or_else(|| KeywardError::ConfigError {
            reason: "runtime already consumed (double start?)".into(),
        })?;

        if let Some((dir, keystore_tx)) = self.watcher.take() {
            let poll = Duration::from_millis(runtime.config.keystore_poll_interval_ms);
            spawn_keystore_watcher(dir, poll, keystore_tx, self.shutdown_tx.subscribe());
        }

        let handle = tokio::spawn(event_loop::run_event_loop(runtime));
        self.lifecycle = Lifecycle::Running;
        Ok(handle)
    }

    /// Signals the event loop to lock the keystore and exit.
    ///
    /// Idempotent once running. Await the `JoinHandle` from
    /// [`Daemon::start`] to wait for completion.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConfigError` if the daemon was never started.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Initializing => Err(KeywardError::ConfigError {
                reason: "cannot shutdown a daemon that has not been started".into(),
            }),
            Lifecycle::ShuttingDown => Ok(()),
            Lifecycle::Running => {
                self.lifecycle = Lifecycle::ShuttingDown;
                let _ = self.shutdown_tx.send(true);
                Ok(())
            }
        }
    }

    /// Returns a cloneable sender for submitting commands.
    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    /// Takes the event receiver. Returns `None` if already taken.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<DaemonEvent>> {
        self.event_rx.take()
    }

    /// A receiver that flips to `true` when the daemon shuts down,
    /// whatever triggered it. Transports use it to stop accepting.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Current task lifecycle.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }
}
