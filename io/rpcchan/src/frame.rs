//! Length-prefixed message framing.
//!
//! A call body is a sequence of frames with the following format:
//! - 4 bytes: payload length (big-endian u32)
//! - 1 byte: frame kind (0 = DATA, 1 = TRAILER)
//! - N bytes: payload
//!
//! A DATA payload is one raw message. A TRAILER payload is an encoded
//! [`Status`] (see [`crate::trailer`]) and is always the last frame of a
//! body that completed normally.

use crate::status::Status;
use crate::trailer;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the frame header (4 bytes length + 1 byte kind).
pub const HEADER_SIZE: usize = 5;

/// Default maximum size of a received message (4MB).
pub const DEFAULT_MAX_RECV_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Fixed ceiling for trailer frames (1MB).
pub const MAX_TRAILER_SIZE: usize = 1024 * 1024;

/// Frame type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Trailer = 1,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Trailer),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// One message.
    Data(Bytes),
    /// The terminal status of the call.
    Trailer(Status),
}

/// Errors produced while decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown frame type {0}")]
    UnknownKind(u8),

    #[error("message of {len} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    #[error("trailer of {0} bytes exceeds maximum size")]
    TrailerTooLarge(usize),

    #[error("trailer metadata key of {0} bytes is too long")]
    TrailerKeyTooLong(usize),

    #[error("body ended with {0} bytes of an incomplete frame")]
    Truncated(usize),

    #[error("malformed trailer: {0}")]
    MalformedTrailer(String),
}

impl From<FrameError> for Status {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::MessageTooLarge { .. } => Status::resource_exhausted(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

/// Encode a message as a DATA frame.
pub fn encode_data(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    put_header(&mut buf, data.len(), FrameKind::Data);
    buf.put_slice(data);
    buf.freeze()
}

/// Encode a terminal status as a TRAILER frame.
pub fn encode_trailer(status: &Status) -> Result<Bytes, FrameError> {
    trailer::encode_status(status).map(|payload| trailer_frame(&payload))
}

/// Encode a TRAILER frame carrying only the code and message of `status`.
///
/// Metadata and details are dropped and the message is cut short if needed,
/// so the result always fits within [`MAX_TRAILER_SIZE`].
pub fn encode_trailer_stripped(status: &Status) -> Bytes {
    trailer_frame(&trailer::encode_code_and_message(status))
}

fn trailer_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    put_header(&mut buf, payload.len(), FrameKind::Trailer);
    buf.put_slice(payload);
    buf.freeze()
}

fn put_header(buf: &mut BytesMut, len: usize, kind: FrameKind) {
    buf.put_u32(len as u32);
    buf.put_u8(kind as u8);
}

/// Decode a single frame.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)` if
/// more data is needed, or `Err` on protocol error. Size limits are checked
/// as soon as the header is available, before the payload arrives.
pub fn decode_frame(buf: &mut BytesMut, max_message_size: usize) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    // Peek at header without consuming
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let kind = FrameKind::from_u8(buf[4]).ok_or(FrameError::UnknownKind(buf[4]))?;

    match kind {
        FrameKind::Data if length > max_message_size => {
            return Err(FrameError::MessageTooLarge {
                len: length,
                max: max_message_size,
            });
        }
        FrameKind::Trailer if length > MAX_TRAILER_SIZE => {
            return Err(FrameError::TrailerTooLarge(length));
        }
        _ => {}
    }

    let total_size = HEADER_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(HEADER_SIZE);
    let payload = buf.split_to(length).freeze();

    match kind {
        FrameKind::Data => Ok(Some(Frame::Data(payload))),
        FrameKind::Trailer => Ok(Some(Frame::Trailer(trailer::decode_status(payload)?))),
    }
}

/// Stateful frame decoder.
///
/// Buffers partial reads until a frame is complete.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a decoder with the default maximum message size.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_RECV_MESSAGE_SIZE)
    }

    /// Create a decoder that rejects DATA frames larger than `max`.
    pub fn with_max_message_size(max: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_message_size: max,
        }
    }

    /// Feed data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame.
    pub fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        decode_frame(&mut self.buffer, self.max_message_size)
    }

    /// Signal end of input.
    ///
    /// Fails if a partial frame is still buffered.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated(self.buffer.len()))
        }
    }

    /// Check if there's any buffered data.
    pub fn has_buffered_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get the amount of buffered data.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Maximum accepted DATA payload size.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
