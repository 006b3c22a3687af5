//! Wire messages and length-prefixed framing.
//!
//! Every frame is a 4-byte big-endian payload length followed by that many
//! bytes of JSON. The JSON is either a [`Request`] or a [`Response`]; the two
//! shapes share only `id`, so the receiver tells them apart structurally.
//!
//! ```text
//! [u32 BE: len][JSON bytes of len]
//! ```

use crate::config::WireConfig;
use crate::error::{RpcError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A remote method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub id: String,
    /// `interface_version`
    pub service: String,
    /// `name(arity)`
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    /// Build a request; `service` and `method` are already-formatted names.
    pub fn new(
        id: impl Into<String>,
        service: impl Into<String>,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            service: service.into(),
            method: method.into(),
            params,
        }
    }
}

/// Diagnostic carried by an error Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

/// The answer to exactly one [`Request`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Response {
    pub id: String,
    pub has_error: bool,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub result: Value,
}

impl Response {
    /// Create a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            has_error: false,
            error: None,
            result,
        }
    }

    /// Create an error response.
    pub fn error(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            has_error: true,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
            }),
            result: Value::Null,
        }
    }

    /// Create an error response from a local error.
    pub fn from_error(id: impl Into<String>, err: &RpcError) -> Self {
        Self::error(id, err.code(), err.to_string())
    }

    /// Turn the response into the caller-facing result.
    ///
    /// Error responses surface as [`RpcError::Invocation`] whatever the
    /// provider-side cause was; the wire code is preserved.
    pub fn into_result(self, service: &str, method: &str) -> Result<Value> {
        if !self.has_error {
            return Ok(self.result);
        }
        let payload = self.error.unwrap_or(ErrorPayload {
            code: crate::error::CODE_INVOCATION,
            message: "remote call failed without diagnostic".to_string(),
        });
        Err(RpcError::Invocation {
            service: service.to_string(),
            method: method.to_string(),
            code: payload.code,
            message: payload.message,
        })
    }
}

/// Anything that can travel in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Correlation id of either shape.
    pub fn id(&self) -> &str {
        match self {
            Message::Request(req) => &req.id,
            Message::Response(resp) => &resp.id,
        }
    }

    /// Parse one frame payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| RpcError::Json {
            message: format!("Failed to parse frame: {}", e),
            source: Some(e),
        })
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}

/// Length-prefixed framing with a bounded frame size.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(WireConfig::DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameCodec {
    /// Codec rejecting payloads longer than `max_frame_len` bytes. Limits
    /// past what the 4-byte length field can carry are clamped to `u32::MAX`.
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.min(u32::MAX as usize),
        }
    }

    /// Largest accepted payload length.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Serialize `message` into a complete frame, length prefix included.
    pub fn encode(&self, message: &Message) -> Result<Bytes> {
        let payload = serde_json::to_vec(message)?;
        if payload.len() > self.max_frame_len {
            return Err(RpcError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let len = u32::try_from(payload.len()).map_err(|_| RpcError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame_len,
        })?;
        let mut frame = BytesMut::with_capacity(WireConfig::LENGTH_FIELD_LEN + payload.len());
        frame.put_u32(len);
        frame.extend_from_slice(&payload);
        Ok(frame.freeze())
    }

    /// Split one complete frame payload off the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is incomplete, leaving `buf`
    /// untouched. A declared length above the maximum is rejected before
    /// any payload is buffered.
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if buf.len() < WireConfig::LENGTH_FIELD_LEN {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[..WireConfig::LENGTH_FIELD_LEN]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > self.max_frame_len {
            return Err(RpcError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = WireConfig::LENGTH_FIELD_LEN + len;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        buf.advance(WireConfig::LENGTH_FIELD_LEN);
        Ok(Some(buf.split_to(len).freeze()))
    }

    /// Decode one message from the front of `buf`.
    ///
    /// The frame is consumed even when its payload fails to parse, so the
    /// next call starts at the following frame.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>> {
        match self.decode_frame(buf)? {
            Some(frame) => Message::from_slice(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Buffered frame reader over one half of a socket.
///
/// `next_frame` is cancel-safe: partially read frames stay in the buffer.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap `reader`, enforcing the limits of `codec`.
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(8 * 1024),
            codec,
        }
    }

    /// Read the next frame payload.
    ///
    /// Returns `None` on clean EOF (peer closed between frames).
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.codec.decode_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }

            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(RpcError::Protocol(format!(
                    "peer closed with {} bytes of an incomplete frame buffered",
                    self.buf.len()
                )));
            }
        }
    }
}

/// Write one already-encoded frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
