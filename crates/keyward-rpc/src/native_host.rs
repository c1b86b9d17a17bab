//! Native-messaging host.
//!
//! The browser launches the daemon with the extension connected to its
//! stdin / stdout. Each direction carries `[u32 LE length][JSON]`
//! frames. One frame is handled at a time, in arrival order.
//!
//! A frame that is not valid JSON is answered with a `-32700` error and
//! the stream stays usable. An unknown method is answered with
//! `-32601`. An oversized frame ends the session, since the byte
//! stream can no longer be trusted.

use keyward_node::command::DaemonCommand;
use keyward_protocol::native::{parse_request, write_frame, FrameReader, NativeResponse};
use keyward_protocol::request::{Origin, Request, RequestType};
use keyward_types::{KeywardError, Result, NATIVE_UNKNOWN_METHOD};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::shutdown::shutdown_raised;

/// One native-messaging session over a reader / writer pair.
pub struct NativeHost<R, W> {
    reader: FrameReader<R>,
    writer: W,
    command_tx: mpsc::Sender<DaemonCommand>,
    /// Used when a request carries no `origin` of its own.
    default_origin: String,
}

impl<R, W> NativeHost<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a host. `default_origin` is typically the extension
    /// origin the browser passes on the command line.
    pub fn new(
        reader: R,
        writer: W,
        command_tx: mpsc::Sender<DaemonCommand>,
        default_origin: impl Into<String>,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer,
            command_tx,
            default_origin: default_origin.into(),
        }
    }

    /// Serves frames until EOF, a fatal stream error or shutdown.
    ///
    /// # Errors
    ///
    /// - `KeywardError::ProtocolError` for an oversized frame or a
    ///   failed write.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let _ = self.command_tx.send(DaemonCommand::SessionOpened).await;
        tracing::info!(origin = %self.default_origin, "native messaging session started");

        let outcome = loop {
            let frame = tokio::select! {
                frame = self.reader.read_frame() => frame,
                () = shutdown_raised(&mut shutdown_rx) => break Ok(()),
            };

            let payload = match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    tracing::info!("native messaging stream closed");
                    break Ok(());
                }
                Err(err) => {
                    tracing::warn!(%err, "native messaging stream unusable");
                    let _ = write_frame(&mut self.writer, &NativeResponse::from_error(Value::Null, &err)).await;
                    break Err(err);
                }
            };

            let response = self.handle_frame(&payload).await;
            if let Err(err) = write_frame(&mut self.writer, &response).await {
                break Err(err);
            }
        };

        let _ = self.command_tx.send(DaemonCommand::SessionClosed).await;
        outcome
    }

    async fn handle_frame(&self, payload: &[u8]) -> NativeResponse {
        let req = match parse_request(payload) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(%err, "malformed native message");
                return NativeResponse::parse_error(&err);
            }
        };

        let Some(kind) = RequestType::from_wire(&req.method).filter(RequestType::is_native) else {
            tracing::debug!(method = %req.method, "unknown native method");
            return NativeResponse::failure(
                req.id,
                NATIVE_UNKNOWN_METHOD,
                format!("unknown method: {}", req.method),
            );
        };

        // Never `Origin::parse`: a page must not be able to claim `cli`.
        let origin = Origin::Browser(req.origin.unwrap_or_else(|| self.default_origin.clone()));
        let request = Request::new(
            request_id(&req.id),
            kind,
            json!({ "params": req.params }),
            origin,
        );
        tracing::debug!(id = %request.id, %kind, origin = %request.origin, "native request");

        let (cmd, rx) = DaemonCommand::request(request);
        if self.command_tx.send(cmd).await.is_err() {
            return NativeResponse::from_error(req.id, &KeywardError::ConnectionClosed);
        }
        match rx.await.unwrap_or(Err(KeywardError::ConnectionClosed)) {
            Ok(result) => NativeResponse::success(req.id, result),
            Err(err) => NativeResponse::from_error(req.id, &err),
        }
    }
}

/// Daemon-side id for a native request. String ids keep their bare text.
fn request_id(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
