//! Trailer payload encoding.
//!
//! A trailer carries the terminal [`Status`] of a call. All integers are
//! big-endian:
//!
//! ```text
//! u32 code
//! u32 message length, message (UTF-8)
//! u32 metadata count
//!   u16 key length, key
//!   u32 value length, value
//! u8  details flag (0 = absent, 1 = present)
//! [u32 details length, details]
//! ```

use crate::frame::{FrameError, MAX_TRAILER_SIZE};
use crate::metadata::{Metadata, MetadataValue, is_binary_key};
use crate::status::{Code, Status};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Serialize a status into a trailer payload.
///
/// Fails when a metadata key is longer than a u16 length prefix allows or
/// when the payload would exceed [`MAX_TRAILER_SIZE`].
pub fn encode_status(status: &Status) -> Result<Bytes, FrameError> {
    let mut len = 4 + 4 + status.message().len() + 4 + 1;
    for (key, value) in status.metadata().iter() {
        if key.len() > u16::MAX as usize {
            return Err(FrameError::TrailerKeyTooLong(key.len()));
        }
        len += 2 + key.len() + 4 + value.as_bytes().len();
    }
    if let Some(details) = status.details() {
        len += 4 + details.len();
    }
    if len > MAX_TRAILER_SIZE {
        return Err(FrameError::TrailerTooLarge(len));
    }

    Ok(write_status(status, len))
}

/// Serialize only the code and message, cutting the message to fit.
pub(crate) fn encode_code_and_message(status: &Status) -> Bytes {
    let full = status.message();
    let mut end = full.len().min(MAX_TRAILER_SIZE - 13);
    while !full.is_char_boundary(end) {
        end -= 1;
    }
    let message = &full[..end];
    let stripped = Status::new(status.code(), message);
    write_status(&stripped, 13 + message.len())
}

fn write_status(status: &Status, len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(len);

    buf.put_u32(status.code().as_u32());

    let message = status.message().as_bytes();
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);

    buf.put_u32(status.metadata().len() as u32);
    for (key, value) in status.metadata().iter() {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        let value = value.as_bytes();
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }

    match status.details() {
        Some(details) => {
            buf.put_u8(1);
            buf.put_u32(details.len() as u32);
            buf.put_slice(details);
        }
        None => buf.put_u8(0),
    }

    buf.freeze()
}

/// Reconstruct a status from a trailer payload.
pub fn decode_status(mut buf: Bytes) -> Result<Status, FrameError> {
    let code = Code::from_u32(get_u32(&mut buf, "code")?);

    let message_len = get_u32(&mut buf, "message length")? as usize;
    let message = take(&mut buf, message_len, "message")?;
    let message = String::from_utf8(message.to_vec())
        .map_err(|_| malformed("message is not valid UTF-8"))?;

    let count = get_u32(&mut buf, "metadata count")?;
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key_len = get_u16(&mut buf)? as usize;
        let key = take(&mut buf, key_len, "metadata key")?;
        let key = String::from_utf8(key.to_vec())
            .map_err(|_| malformed("metadata key is not valid UTF-8"))?;

        let value_len = get_u32(&mut buf, "metadata value length")? as usize;
        let value = take(&mut buf, value_len, "metadata value")?;

        let value = if is_binary_key(&key) {
            MetadataValue::Binary(value)
        } else {
            let text = String::from_utf8(value.to_vec())
                .map_err(|_| malformed("metadata value is not valid UTF-8"))?;
            MetadataValue::Ascii(text)
        };
        metadata.insert_value(key, value);
    }

    if !buf.has_remaining() {
        return Err(malformed("missing details flag"));
    }
    let details = match buf.get_u8() {
        0 => None,
        1 => {
            let len = get_u32(&mut buf, "details length")? as usize;
            Some(take(&mut buf, len, "details")?)
        }
        flag => return Err(malformed(format!("invalid details flag {}", flag))),
    };

    if buf.has_remaining() {
        return Err(malformed(format!("{} trailing bytes", buf.remaining())));
    }

    let mut status = Status::new(code, message).with_metadata(metadata);
    if let Some(details) = details {
        status = status.with_details(details);
    }
    Ok(status)
}

fn malformed(reason: impl Into<String>) -> FrameError {
    FrameError::MalformedTrailer(reason.into())
}

fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32, FrameError> {
    if buf.remaining() < 4 {
        return Err(malformed(format!("truncated {}", what)));
    }
    Ok(buf.get_u32())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, FrameError> {
    if buf.remaining() < 2 {
        return Err(malformed("truncated metadata key length"));
    }
    Ok(buf.get_u16())
}

fn take(buf: &mut Bytes, len: usize, what: &str) -> Result<Bytes, FrameError> {
    if buf.remaining() < len {
        return Err(malformed(format!("truncated {}", what)));
    }
    Ok(buf.split_to(len))
}
