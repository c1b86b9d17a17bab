//! IPC client with request/response correlation.
//!
//! Outgoing requests register a `oneshot` under their id in a pending
//! map; a reader task resolves waiters as replies arrive. A correlated
//! request fails with `Timeout` once the configured timeout passes, and
//! every outstanding request fails with `ConnectionClosed` when the
//! socket closes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keyward_protocol::ipc::{error_from_data, IpcMessage, ERROR};
use keyward_types::{KeywardError, Result};
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::IpcConfig;
use crate::server::read_line;

type Waiter = oneshot::Sender<Result<IpcMessage>>;

#[derive(Default)]
struct PendingMap {
    waiters: HashMap<String, Waiter>,
    /// Set by the reader task once the socket closed.
    closed: bool,
}

/// A connection to the daemon's management socket.
pub struct IpcClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingMap>>,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl IpcClient {
    /// Connects to the socket at `config.socket_path`.
    ///
    /// # Errors
    ///
    /// - `KeywardError::ConfigError` for an invalid config.
    /// - `KeywardError::ConnectionClosed` if nothing is listening.
    pub async fn connect(config: &IpcConfig) -> Result<Self> {
        config.validate()?;
        let stream = UnixStream::connect(&config.socket_path).await.map_err(|e| {
            tracing::debug!(%e, path = %config.socket_path.display(), "IPC connect failed");
            KeywardError::ConnectionClosed
        })?;
        let (read_half, write_half) = stream.into_split();

        let pending = Arc::new(Mutex::new(PendingMap::default()));
        let reader = tokio::spawn(read_responses(read_half, Arc::clone(&pending)));

        Ok(Self {
            writer: Mutex::new(write_half),
            pending,
            timeout: config.request_timeout,
            reader,
        })
    }

    /// Sends a correlated request and waits for its reply.
    ///
    /// # Errors
    ///
    /// - `KeywardError::Timeout` if no reply arrives in time.
    /// - `KeywardError::ConnectionClosed` if the socket closes first.
    /// - The daemon's error, rebuilt from an `error` reply.
    pub async fn request(&self, kind: &str, data: Value) -> Result<IpcMessage> {
        let message = IpcMessage::new(kind, data);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(KeywardError::ConnectionClosed);
            }
            pending.waiters.insert(message.id.clone(), tx);
        }

        if let Err(err) = self.write(&message).await {
            self.pending.lock().await.waiters.remove(&message.id);
            return Err(err);
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply?,
            Ok(Err(_)) => return Err(KeywardError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.waiters.remove(&message.id);
                return Err(KeywardError::Timeout {
                    millis: self.timeout.as_millis() as u64,
                });
            }
        };

        if reply.kind == ERROR {
            return Err(error_from_data(&reply.data));
        }
        Ok(reply)
    }

    /// Sends a request without waiting for, or correlating, a reply.
    ///
    /// # Errors
    ///
    /// `KeywardError::ConnectionClosed` if the write fails.
    pub async fn send(&self, kind: &str, data: Value) -> Result<()> {
        self.write(&IpcMessage::new(kind, data)).await
    }

    async fn write(&self, message: &IpcMessage) -> Result<()> {
        let line = message.to_line()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.map_err(|e| {
            tracing::debug!(%e, "IPC write failed");
            KeywardError::ConnectionClosed
        })
    }

    // -- Convenience ------------------------------------------------------

    /// `get_status`, returning the status object.
    ///
    /// # Errors
    ///
    /// See [`IpcClient::request`].
    pub async fn status(&self) -> Result<Value> {
        Ok(self.request("get_status", json!({})).await?.data)
    }

    /// `unlock_keystore`, returning the `unlock_response` payload.
    ///
    /// # Errors
    ///
    /// See [`IpcClient::request`].
    pub async fn unlock(&self, password: &str) -> Result<Value> {
        Ok(self
            .request("unlock_keystore", json!({ "password": password }))
            .await?
            .data)
    }

    /// Fire-and-forget `lock_keystore`.
    ///
    /// # Errors
    ///
    /// See [`IpcClient::send`].
    pub async fn lock(&self) -> Result<()> {
        self.send("lock_keystore", json!({})).await
    }

    /// Fire-and-forget `shutdown`.
    ///
    /// # Errors
    ///
    /// See [`IpcClient::send`].
    pub async fn shutdown(&self) -> Result<()> {
        self.send("shutdown", json!({})).await
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(read_half: OwnedReadHalf, pending: Arc<Mutex<PendingMap>>) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        match read_line(&mut reader, &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(%err, "IPC reader stopped");
                break;
            }
        }

        let Ok(text) = std::str::from_utf8(&line) else {
            continue;
        };
        if text.trim().is_empty() {
            continue;
        }
        match IpcMessage::from_line(text) {
            Ok(message) => {
                let waiter = pending.lock().await.waiters.remove(&message.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => tracing::debug!(id = %message.id, kind = %message.kind, "uncorrelated IPC reply"),
                }
            }
            Err(err) => tracing::warn!(%err, "malformed IPC reply"),
        }
    }

    let mut pending = pending.lock().await;
    pending.closed = true;
    for (_, tx) in pending.waiters.drain() {
        let _ = tx.send(Err(KeywardError::ConnectionClosed));
    }
}
