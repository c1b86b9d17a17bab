//! Native-messaging framing.
//!
//! Every message in either direction is a 4-byte little-endian length
//! followed by that many bytes of UTF-8 JSON, back to back on one byte
//! stream.
//!
//! [`FrameDecoder`] is a push-style decoder that tolerates arbitrary
//! chunking: a header is kept once read, and bytes are never dropped
//! while a payload is incomplete. [`FrameReader`] / [`write_frame`]
//! drive it over tokio I/O.

use keyward_types::{KeywardError, Result, NATIVE_PARSE_ERROR};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the frame header.
pub const HEADER_LEN: usize = 4;

/// Largest accepted payload, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serializes `value` into one frame.
///
/// # Errors
///
/// Returns [`KeywardError::ProtocolError`] if serialization fails or
/// the payload exceeds [`MAX_FRAME_LEN`].
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value).map_err(|e| KeywardError::ProtocolError {
        reason: format!("frame serialization failed: {e}"),
    })?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(KeywardError::ProtocolError {
            reason: format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", payload.len()),
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// FrameDecoder
// ---------------------------------------------------------------------------

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Payload length from a header already consumed from `buf`.
    pending_len: Option<usize>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns `true` if no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.pending_len.is_none()
    }

    /// Extracts the next complete payload, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`KeywardError::ProtocolError`] for a header above
    /// [`MAX_FRAME_LEN`]. The stream cannot be resynchronized after
    /// that.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if self.buf.len() < HEADER_LEN {
                    return Ok(None);
                }
                let mut header = [0u8; HEADER_LEN];
                header.copy_from_slice(&self.buf[..HEADER_LEN]);
                let len = u32::from_le_bytes(header) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(KeywardError::ProtocolError {
                        reason: format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
                    });
                }
                self.buf.drain(..HEADER_LEN);
                self.pending_len = Some(len);
                len
            }
        };

        if self.buf.len() < len {
            return Ok(None);
        }
        let rest = self.buf.split_off(len);
        let payload = std::mem::replace(&mut self.buf, rest);
        self.pending_len = None;
        Ok(Some(payload))
    }
}

// ---------------------------------------------------------------------------
// Async I/O
// ---------------------------------------------------------------------------

/// Reads frames from an async byte stream.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
        }
    }

    /// Waits for the next complete payload.
    ///
    /// Returns `Ok(None)` at end of input; that is a disconnect, not a
    /// failure. A partial frame at end of input is discarded.
    ///
    /// # Errors
    ///
    /// [`KeywardError::ProtocolError`] on oversize frames or I/O errors.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                return Ok(Some(payload));
            }
            let n = self
                .inner
                .read(&mut chunk)
                .await
                .map_err(|e| KeywardError::ProtocolError {
                    reason: format!("read failed: {e}"),
                })?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

/// Encodes and writes one frame, then flushes.
///
/// # Errors
///
/// [`KeywardError::ProtocolError`] on encode or I/O failure.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer
        .write_all(&frame)
        .await
        .and(writer.flush().await)
        .map_err(|e| KeywardError::ProtocolError {
            reason: format!("write failed: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A browser-extension request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeRequest {
    /// Correlation id, echoed in the response. Number or string.
    pub id: Value,
    /// Method name, e.g. `eth_sendTransaction`.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
    /// Requesting page origin, attached by the extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Parses a frame payload into a [`NativeRequest`].
///
/// # Errors
///
/// Returns [`KeywardError::ParseError`] for malformed JSON. The stream
/// stays usable.
pub fn parse_request(payload: &[u8]) -> Result<NativeRequest> {
    serde_json::from_slice(payload).map_err(|e| KeywardError::ParseError {
        reason: e.to_string(),
    })
}

/// Error object of a [`NativeResponse`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeError {
    /// Numeric code (`4001`, `-1`, `-32700`, `-32601`).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// A response to the browser extension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeResponse {
    /// The request id.
    pub id: Value,
    /// Result on success, `null` otherwise.
    pub result: Option<Value>,
    /// Error on failure, `null` otherwise.
    pub error: Option<NativeError>,
}

impl NativeResponse {
    /// A successful response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response with an explicit code.
    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(NativeError {
                code,
                message: message.into(),
            }),
        }
    }

    /// A failed response for `err`, using its native code and display text.
    pub fn from_error(id: Value, err: &KeywardError) -> Self {
        Self::failure(id, err.native_code(), err.to_string())
    }

    /// Response to an unparseable frame. The id is unknown.
    pub fn parse_error(err: &KeywardError) -> Self {
        Self::failure(Value::Null, NATIVE_PARSE_ERROR, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
