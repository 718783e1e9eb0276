//! Beambox wire protocol: frame codec and message bodies.
//!
//! Every protocol in the stack (FileExplore, broadcast and QR-code discovery,
//! file transfer) exchanges the same frame shape.
//!
//! ## Stream Frame Format (TCP)
//!
//! ```text
//! ┌────────────┬────────────────────────┬────────────┬──────────────────┐
//! │    Type    │       Message Id       │   Length   │       Body       │
//! │  4 bytes   │        8 bytes         │  4 bytes   │  Length bytes    │
//! └────────────┴────────────────────────┴────────────┴──────────────────┘
//! ```
//!
//! ## Datagram Frame Format (UDP)
//!
//! ```text
//! ┌────────────┬────────────────────────┬─────────────────────────────┐
//! │    Type    │       Message Id       │   Body (rest of datagram)   │
//! │  4 bytes   │        8 bytes         │                             │
//! └────────────┴────────────────────────┴─────────────────────────────┘
//! ```
//!
//! All integers are big-endian. Application bodies are JSON; see [`messages`].

pub mod messages;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};

/// Stream header size in bytes (type + message id + length)
pub const STREAM_HEADER_SIZE: usize = 16;

/// Datagram header size in bytes (type + message id)
pub const DATAGRAM_HEADER_SIZE: usize = 12;

/// Maximum body size (16 MB)
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Maximum UDP datagram payload we accept.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// One unit of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request/response kind, interpreted per protocol
    pub message_type: i32,
    /// Correlation id, unique per outstanding request on a connection
    pub message_id: i64,
    /// Opaque body
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    #[must_use]
    pub fn new(message_type: i32, message_id: i64, body: Vec<u8>) -> Self {
        Self {
            message_type,
            message_id,
            body,
        }
    }

    /// Create a frame whose body is the JSON encoding of `payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn json<T: Serialize>(message_type: i32, message_id: i64, payload: &T) -> Result<Self> {
        Ok(Self::new(message_type, message_id, encode_body(payload)?))
    }

    /// Encode the frame for a stream transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds [`MAX_BODY_SIZE`].
    pub fn encode_stream(&self) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(Error::Framing(format!(
                "body too large: {} bytes",
                self.body.len()
            )));
        }
        let mut buf = Vec::with_capacity(STREAM_HEADER_SIZE + self.body.len());
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&(self.body.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Encode the frame as a single datagram. The datagram boundary is the
    /// frame boundary, so no length field is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame does not fit in one datagram.
    pub fn encode_datagram(&self) -> Result<Vec<u8>> {
        if DATAGRAM_HEADER_SIZE + self.body.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::Framing(format!(
                "datagram too large: {} bytes",
                DATAGRAM_HEADER_SIZE + self.body.len()
            )));
        }
        let mut buf = Vec::with_capacity(DATAGRAM_HEADER_SIZE + self.body.len());
        buf.extend_from_slice(&self.message_type.to_be_bytes());
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.body);
        Ok(buf)
    }

    /// Decode one datagram.
    ///
    /// # Errors
    ///
    /// Returns a framing error if the datagram is shorter than the header.
    pub fn decode_datagram(data: &[u8]) -> Result<Self> {
        if data.len() < DATAGRAM_HEADER_SIZE {
            return Err(Error::Framing(format!(
                "datagram too short: {} bytes",
                data.len()
            )));
        }
        let (message_type, message_id) = decode_type_and_id(data);
        Ok(Self::new(
            message_type,
            message_id,
            data[DATAGRAM_HEADER_SIZE..].to_vec(),
        ))
    }
}

fn decode_type_and_id(data: &[u8]) -> (i32, i64) {
    let message_type = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let message_id = i64::from_be_bytes([
        data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
    ]);
    (message_type, message_id)
}

fn decode_body_length(header: &[u8]) -> Result<usize> {
    let length = i32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    if length < 0 {
        return Err(Error::Framing(format!("negative body length: {length}")));
    }
    let length = length as usize;
    if length > MAX_BODY_SIZE {
        return Err(Error::Framing(format!("body too large: {length} bytes")));
    }
    Ok(length)
}

/// Accumulates bytes from a stream transport and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` while the frame is still partial. On a malformed
    /// header the header prefix is discarded and a framing error returned;
    /// the next call resumes with the bytes that followed it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] on an invalid length field.
    pub fn decode_next(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < STREAM_HEADER_SIZE {
            return Ok(None);
        }
        let length = match decode_body_length(&self.buf) {
            Ok(length) => length,
            Err(e) => {
                self.buf.drain(..STREAM_HEADER_SIZE);
                return Err(e);
            }
        };
        if self.buf.len() < STREAM_HEADER_SIZE + length {
            return Ok(None);
        }
        let (message_type, message_id) = decode_type_and_id(&self.buf);
        let body = self.buf[STREAM_HEADER_SIZE..STREAM_HEADER_SIZE + length].to_vec();
        self.buf.drain(..STREAM_HEADER_SIZE + length);
        Ok(Some(Frame::new(message_type, message_id, body)))
    }
}

/// Read a complete frame from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the frame is invalid.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncReadExt + Unpin,
{
    let mut header = [0u8; STREAM_HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let length = decode_body_length(&header)?;
    let (message_type, message_id) = decode_type_and_id(&header);

    let mut body = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut body).await?;
    }

    Ok(Frame::new(message_type, message_id, body))
}

/// Write a complete frame to a stream.
///
/// # Errors
///
/// Returns an error if writing fails.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let encoded = frame.encode_stream()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a message body to JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_body<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message body from JSON bytes.
///
/// An empty body is read as JSON `null`, so unit bodies tolerate peers that
/// send nothing at all.
///
/// # Errors
///
/// Returns an error if deserialization fails.
pub fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    let data = if data.is_empty() { b"null".as_slice() } else { data };
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}
