//! JAUS TCP transport framing (AS5669A general transport header).
//!
//! Each side of the TCP stream first sends a single transport version byte
//! (`0x02`).  After that the stream is a sequence of frames:
//!
//! ```text
//! offset size field
//!      0    1  message type (bits 0-5) | header compression flags (bits 6-7)
//!      1    2  data size: whole frame, header and trailer included
//!      3    1  priority (0-1) | broadcast (2-3) | ack/nak (4-5) | data flags (6-7)
//!      4    4  destination id: component, node, subsystem (u16)
//!      8    4  source id
//!     12    N  payload (data frames: message id u16 + message body)
//!   12+N    2  sequence number
//! ```
//!
//! All multi-byte integers are little-endian.  Header compression and
//! large-message data flags are not supported; a frame that uses them is
//! malformed.

use thiserror::Error;

use crate::protocol::address::JausAddress;
use crate::schema::MessageId;

/// First byte of a JAUS TCP stream.
pub const TRANSPORT_VERSION: u8 = 0x02;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Size of the sequence-number trailer in bytes.
pub const TRAILER_SIZE: usize = 2;

/// Smallest possible frame (empty payload).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TRAILER_SIZE;

/// Largest frame the 16-bit data size can describe.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Normal priority, the JAUS default for application traffic.
pub const DEFAULT_PRIORITY: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough bytes yet.  Not an error for a stream reader: wait for more.
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unsupported transport version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("frame of {0} bytes exceeds the transport limit")]
    Oversized(usize),
}

/// Transport-level message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries a JAUS message.
    Data = 0,
    /// Registers the source address with the Node Manager.
    Connect = 1,
    /// Node Manager's answer to `Connect`.
    Accept = 2,
    /// Withdraws a registration.
    Cancel = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Connect),
            2 => Ok(FrameKind::Accept),
            3 => Ok(FrameKind::Cancel),
            other => Err(FrameError::Malformed(format!("unknown message type {other}"))),
        }
    }
}

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub priority: u8,
    pub destination: JausAddress,
    pub source: JausAddress,
    pub payload: Vec<u8>,
    /// Filled in by the sender just before the frame is written.
    pub sequence: u16,
}

impl Frame {
    /// A data frame carrying `message_id` followed by `body`.
    pub fn data(
        message_id: MessageId,
        body: &[u8],
        source: JausAddress,
        destination: JausAddress,
    ) -> Self {
        let mut payload = Vec::with_capacity(2 + body.len());
        payload.extend_from_slice(&message_id.to_le_bytes());
        payload.extend_from_slice(body);
        Self {
            kind: FrameKind::Data,
            priority: DEFAULT_PRIORITY,
            destination,
            source,
            payload,
            sequence: 0,
        }
    }

    /// A payload-less control frame (`Connect`, `Cancel`, ...) for `source`.
    pub fn command(kind: FrameKind, source: JausAddress) -> Self {
        Self {
            kind,
            priority: DEFAULT_PRIORITY,
            destination: source,
            source,
            payload: Vec::new(),
            sequence: 0,
        }
    }

    /// Message id of a data frame.
    pub fn message_id(&self) -> Option<MessageId> {
        match (self.kind, self.payload.as_slice()) {
            (FrameKind::Data, [lo, hi, ..]) => Some(MessageId::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    /// Message body of a data frame (payload without the message id).
    pub fn body(&self) -> &[u8] {
        match self.kind {
            FrameKind::Data if self.payload.len() >= 2 => &self.payload[2..],
            _ => &[],
        }
    }

    /// Size of the encoded frame in bytes.
    pub fn wire_size(&self) -> usize {
        MIN_FRAME_SIZE + self.payload.len()
    }
}

/// Encodes a frame, header and trailer included.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let size = frame.wire_size();
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(size));
    }

    let mut buf = Vec::with_capacity(size);
    buf.push(frame.kind as u8);
    buf.extend_from_slice(&(size as u16).to_le_bytes());
    buf.push(frame.priority & 0x03);
    buf.extend_from_slice(&frame.destination.to_le_bytes());
    buf.extend_from_slice(&frame.source.to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    buf.extend_from_slice(&frame.sequence.to_le_bytes());
    Ok(buf)
}

/// Decodes one frame from the start of `bytes`.
///
/// Returns the frame and the number of bytes it occupied.
/// [`FrameError::Incomplete`] means the caller should read more.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::Incomplete {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    if bytes[0] >> 6 != 0 {
        return Err(FrameError::Malformed(
            "header compression is not supported".to_string(),
        ));
    }
    let kind = FrameKind::try_from(bytes[0] & 0x3F)?;

    let size = usize::from(u16::from_le_bytes([bytes[1], bytes[2]]));
    if size < MIN_FRAME_SIZE {
        return Err(FrameError::Malformed(format!(
            "data size {size} is smaller than the {MIN_FRAME_SIZE}-byte minimum"
        )));
    }

    let flags = bytes[3];
    if flags >> 6 != 0 {
        return Err(FrameError::Malformed(
            "multi-packet data flags are not supported".to_string(),
        ));
    }

    if bytes.len() < size {
        return Err(FrameError::Incomplete {
            needed: size,
            available: bytes.len(),
        });
    }

    let payload = bytes[HEADER_SIZE..size - TRAILER_SIZE].to_vec();
    if kind == FrameKind::Data && payload.len() < 2 {
        return Err(FrameError::Malformed(
            "data frame without a message id".to_string(),
        ));
    }

    let frame = Frame {
        kind,
        priority: flags & 0x03,
        destination: JausAddress::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        source: JausAddress::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        payload,
        sequence: u16::from_le_bytes([bytes[size - 2], bytes[size - 1]]),
    };
    Ok((frame, size))
}

// ── Stream reassembly ─────────────────────────────────────────────────────────

/// Accumulates bytes read from the Node Manager stream and yields whole frames.
///
/// TCP delivers a byte stream, not messages: one read may hold half a frame
/// or several frames.  Feed every read into [`extend`](Self::extend), then
/// call [`next_frame`](Self::next_frame) until it returns `Ok(None)`.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    version_seen: bool,
}

impl FrameBuffer {
    /// A buffer for a fresh stream, which starts with the version byte.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held that do not yet form a whole frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    ///
    /// An error leaves the stream unusable; there is no resynchronisation.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if !self.version_seen {
            let Some(&version) = self.buf.first() else {
                return Ok(None);
            };
            if version != TRANSPORT_VERSION {
                return Err(FrameError::UnsupportedVersion(version));
            }
            self.buf.drain(..1);
            self.version_seen = true;
        }

        match decode_frame(&self.buf) {
            Ok((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            Err(FrameError::Incomplete { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
