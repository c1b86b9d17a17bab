//! Keystore directory change detection.
//!
//! Uses native file-change notification (`notify`) when available and
//! falls back to polling the directory at a fixed interval otherwise.
//! Either way the watcher only reports *existence* changes: a keystore
//! appearing where there was none, or the last keystore disappearing.

use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::keystore_file::KeystoreDir;

/// Existence change of the keystore directory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeystoreEvent {
    /// A keystore file now exists where none did.
    Appeared,
    /// No keystore file remains.
    Removed,
}

impl KeystoreEvent {
    fn from_presence(present: bool) -> Self {
        if present {
            Self::Appeared
        } else {
            Self::Removed
        }
    }
}

/// Spawns the watcher task.
///
/// The task emits a [`KeystoreEvent`] on `tx` each time keystore
/// presence changes relative to the state observed at spawn time. It
/// exits when `shutdown` flips to `true` or the receiver is dropped.
pub fn spawn_keystore_watcher(
    dir: KeystoreDir,
    poll_interval: Duration,
    tx: mpsc::Sender<KeystoreEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // notify needs an existing directory to attach to.
        if let Err(err) = std::fs::create_dir_all(dir.path()) {
            tracing::warn!(?err, path = %dir.path().display(), "failed to create keystore directory");
        }

        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = notify_tx.send(res);
        }) {
            Ok(mut watcher) => match watcher.watch(dir.path(), RecursiveMode::NonRecursive) {
                Ok(()) => {
                    tracing::info!(path = %dir.path().display(), "watching keystore directory");
                    Some(watcher)
                }
                Err(err) => {
                    tracing::warn!(?err, "failed to watch keystore directory, polling instead");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(?err, "failed to initialize file watcher, polling instead");
                None
            }
        };
        let native = watcher.is_some();

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut present = dir.has_keystore();

        loop {
            tokio::select! {
                _ = ticker.tick(), if !native => {}
                event = notify_rx.recv(), if native => {
                    match event {
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(?err, "file watcher error");
                            continue;
                        }
                        None => break,
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let now_present = dir.has_keystore();
            if now_present != present {
                present = now_present;
                let event = KeystoreEvent::from_presence(present);
                tracing::debug!(?event, "keystore presence changed");
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }

        drop(watcher);
        tracing::debug!("keystore watcher stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
