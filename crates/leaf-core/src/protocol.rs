//! Relay wire protocol.
//!
//! Every frame on a relay connection is a 4-byte big-endian length followed
//! by a bincode-encoded [`RelayMessage`]:
//!
//! ```text
//! +----------------+---------------------------------+
//! | length (u32be) | bincode(RelayMessage)           |
//! +----------------+---------------------------------+
//! ```
//!
//! The client opens with `Hello`, the relay answers `HelloAck` or `Reject`.
//! After that both sides exchange stream frames (`Open`, `Data`, `Close`,
//! `Reset`) and keepalives (`Ping`, `Pong`) until one side sends `Goodbye`
//! or drops the connection.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay protocol version sent in `Hello`
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame length prefix size
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest application payload carried by one `Data` frame (64 KiB)
pub const MAX_DATA_PAYLOAD: usize = 64 * 1024;

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Handshake header carrying the partner identifier
pub const PARTNER_ID_HEADER: &str = "x-partner-id";

/// Relay protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayMessage {
    /// Client opens a session
    Hello {
        /// Wire protocol version
        protocol_version: u16,
        /// Client library version
        client_version: String,
        /// Stable per-client device identifier
        device_id: String,
        /// Optional handshake headers (lowercase names)
        headers: Vec<(String, String)>,
    },

    /// Relay accepts the session
    HelloAck {
        /// Relay's identifier
        relay_id: String,
        /// Client address as observed by the relay
        exit_address: String,
    },

    /// Relay refuses the session
    Reject {
        /// Relay-defined code
        code: u16,
        /// Human-readable reason
        reason: String,
    },

    /// Announce a new stream
    Open {
        /// Stream identifier
        stream_id: u64,
    },

    /// Stream payload
    Data {
        /// Stream identifier
        stream_id: u64,
        /// Payload bytes (at most [`MAX_DATA_PAYLOAD`])
        payload: Vec<u8>,
    },

    /// Sender will send no more data on this stream
    Close {
        /// Stream identifier
        stream_id: u64,
    },

    /// Abort a stream in both directions
    Reset {
        /// Stream identifier
        stream_id: u64,
    },

    /// Keepalive probe
    Ping {
        /// Echoed back in `Pong`
        nonce: u64,
    },

    /// Keepalive answer
    Pong {
        /// Nonce from the `Ping`
        nonce: u64,
    },

    /// Orderly session shutdown
    Goodbye,
}

impl RelayMessage {
    /// Build the client `Hello`
    ///
    /// The partner header is included only when `partner_id` is non-empty.
    #[must_use]
    pub fn hello(client_version: &str, device_id: &str, partner_id: Option<&str>) -> Self {
        let headers = partner_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| vec![(PARTNER_ID_HEADER.to_string(), id.to_string())])
            .unwrap_or_default();
        RelayMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_version: client_version.to_string(),
            device_id: device_id.to_string(),
            headers,
        }
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Encode as a length-prefixed frame
    pub fn encode_frame(&self, max_frame_size: usize) -> Result<Vec<u8>, ProtocolError> {
        let body = self.to_bytes()?;
        if body.len() > max_frame_size || u32::try_from(body.len()).is_err() {
            return Err(ProtocolError::FrameTooLarge {
                size: body.len(),
                max: max_frame_size,
            });
        }
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Hello { .. } => "Hello",
            RelayMessage::HelloAck { .. } => "HelloAck",
            RelayMessage::Reject { .. } => "Reject",
            RelayMessage::Open { .. } => "Open",
            RelayMessage::Data { .. } => "Data",
            RelayMessage::Close { .. } => "Close",
            RelayMessage::Reset { .. } => "Reset",
            RelayMessage::Ping { .. } => "Ping",
            RelayMessage::Pong { .. } => "Pong",
            RelayMessage::Goodbye => "Goodbye",
        }
    }

    /// Stream the message belongs to, for stream frames
    #[must_use]
    pub fn stream_id(&self) -> Option<u64> {
        match self {
            RelayMessage::Open { stream_id }
            | RelayMessage::Data { stream_id, .. }
            | RelayMessage::Close { stream_id }
            | RelayMessage::Reset { stream_id } => Some(*stream_id),
            _ => None,
        }
    }

    /// Value of a `Hello` header, if present
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            RelayMessage::Hello { headers, .. } => headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

/// Write one frame
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the encoded message exceeds
/// `max_frame_size`, or [`ProtocolError::Io`] if the write fails.
pub async fn write_frame<W>(
    writer: &mut W,
    message: &RelayMessage,
    max_frame_size: usize,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode_frame(max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] for an oversized length prefix
/// (the body is not read), [`ProtocolError::Decode`] for a malformed body and
/// [`ProtocolError::Io`] for transport failures including EOF mid-frame.
pub async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<RelayMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }

    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    RelayMessage::from_bytes(&body).map(Some)
}
