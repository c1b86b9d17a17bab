//! IPC server entry point.
//!
//! [`IpcServer::start`] binds the Unix socket and spawns the accept
//! loop as a tokio task. Each connection gets its own task; messages on
//! one connection are handled strictly in arrival order (the next line
//! is not read until the previous reply has been written), while
//! separate connections proceed independently.
//!
//! # Graceful shutdown
//!
//! The server takes a `watch::Receiver<bool>`. When it flips to `true`
//! the accept loop and every connection task stop, and the socket file
//! is removed.

use std::path::PathBuf;

use keyward_node::command::DaemonCommand;
use keyward_protocol::ipc::{error_data, response_type, IpcMessage, DELIMITER, ERROR};
use keyward_types::{KeywardError, Result};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{IpcConfig, MAX_LINE_LEN};
use crate::shutdown::shutdown_raised;

// ---------------------------------------------------------------------------
// Line reading
// ---------------------------------------------------------------------------

/// Reads one `\n`-terminated line into `buf`, returning the bytes read
/// (0 at EOF).
///
/// # Errors
///
/// - `KeywardError::ProtocolError` if the line exceeds
///   [`MAX_LINE_LEN`].
/// - `KeywardError::ConnectionClosed` on I/O failure.
pub(crate) async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LEN as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_until(DELIMITER, buf)
        .await
        .map_err(|e| {
            tracing::debug!(%e, "IPC read failed");
            KeywardError::ConnectionClosed
        })?;
    if buf.len() > MAX_LINE_LEN {
        return Err(KeywardError::ProtocolError {
            reason: format!("IPC line exceeds {MAX_LINE_LEN} bytes"),
        });
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// IpcServer
// ---------------------------------------------------------------------------

/// The local management socket.
pub struct IpcServer;

impl IpcServer {
    /// Binds the socket and spawns the accept loop.
    ///
    /// A socket file nobody answers on is left over from a previous run
    /// and is removed first. The new socket is restricted to the owning
    /// user (`0600`).
    ///
    /// # Errors
    ///
    /// - `KeywardError::ConfigError` if `config` is invalid.
    /// - `KeywardError::SocketInUse` if a live server answers on the path.
    /// - `KeywardError::StorageError` if the socket cannot be bound or
    ///   its permissions set.
    pub fn start(
        config: IpcConfig,
        command_tx: mpsc::Sender<DaemonCommand>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        use std::os::unix::fs::PermissionsExt;

        config.validate()?;
        let path = config.socket_path;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KeywardError::StorageError {
                reason: format!("failed to create socket directory '{}': {e}", parent.display()),
            })?;
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                tracing::warn!(path = %path.display(), "IPC socket is served by another daemon");
                return Err(KeywardError::SocketInUse);
            }
            std::fs::remove_file(&path).map_err(|e| KeywardError::StorageError {
                reason: format!("failed to remove stale socket '{}': {e}", path.display()),
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|e| KeywardError::StorageError {
            reason: format!("failed to bind Unix socket '{}': {e}", path.display()),
        })?;

        // Owner read/write only.
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            KeywardError::StorageError {
                reason: format!("failed to set socket permissions on '{}': {e}", path.display()),
            }
        })?;

        tracing::info!(path = %path.display(), "IPC server listening on Unix socket");

        Ok(tokio::spawn(accept_loop(listener, path, command_tx, shutdown_rx)))
    }
}

async fn accept_loop(
    listener: UnixListener,
    socket_path: PathBuf,
    command_tx: mpsc::Sender<DaemonCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    tracing::debug!("IPC client connected");
                    tokio::spawn(handle_connection(stream, command_tx.clone(), shutdown_rx.clone()));
                }
                Err(e) => tracing::warn!(%e, "failed to accept IPC connection"),
            },

            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Clean up socket file.
    let _ = std::fs::remove_file(&socket_path);
    tracing::info!("IPC server stopped");
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: UnixStream,
    command_tx: mpsc::Sender<DaemonCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if command_tx.send(DaemonCommand::SessionOpened).await.is_err() {
        return;
    }

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = read_line(&mut reader, &mut line) => read,
            () = shutdown_raised(&mut shutdown_rx) => break,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(%err, "closing IPC connection");
                break;
            }
        }

        let Some(response) = process_line(&line, &command_tx).await else {
            continue;
        };
        let bytes = match response.to_line() {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(%err, "failed to encode IPC response");
                continue;
            }
        };
        if let Err(e) = write_half.write_all(&bytes).await {
            tracing::debug!(%e, "IPC client went away before the reply");
            break;
        }
    }

    let _ = command_tx.send(DaemonCommand::SessionClosed).await;
    tracing::debug!("IPC client disconnected");
}

/// Handles one line, returning the reply (if any).
async fn process_line(line: &[u8], command_tx: &mpsc::Sender<DaemonCommand>) -> Option<IpcMessage> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(_) => {
            let err = KeywardError::ParseError {
                reason: "IPC message is not UTF-8".into(),
            };
            return Some(IpcMessage::new(ERROR, error_data(&err)));
        }
    };
    if text.trim().is_empty() {
        return None;
    }

    let message = match IpcMessage::from_line(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(%err, "malformed IPC message");
            return Some(IpcMessage::new(ERROR, error_data(&err)));
        }
    };

    // Keeps id and type for the reply; the payload may hold a password.
    let envelope = IpcMessage {
        id: message.id.clone(),
        kind: message.kind.clone(),
        data: Value::Null,
        timestamp: message.timestamp,
    };

    let request = match message.into_request() {
        Ok(request) => request,
        Err(err) => return Some(envelope.error_reply(&err)),
    };
    tracing::debug!(id = %request.id, kind = %request.kind, "IPC request");

    let kind = request.kind;
    let (cmd, rx) = DaemonCommand::request(request);
    if command_tx.send(cmd).await.is_err() {
        return Some(envelope.error_reply(&KeywardError::ConnectionClosed));
    }
    let result = rx.await.unwrap_or(Err(KeywardError::ConnectionClosed));

    Some(match result {
        Ok(data) => envelope.reply(response_type(kind), data),
        Err(err) => envelope.error_reply(&err),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
