//! Metadata carried in HTTP headers.
//!
//! Text metadata maps to header values as-is. Binary (`-bin`) values are
//! base64 encoded, and decoding accepts both padded and unpadded input.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use rpcchan::{Metadata, MetadataValue, Status, is_binary_key};
use tracing::debug;

/// Content type of request and response bodies.
pub const CONTENT_TYPE: &str = "application/x-rpcchan-frames";

/// Header carrying the call deadline.
pub const TIMEOUT_HEADER: &str = "grpc-timeout";

/// Headers owned by the transport, never exposed as metadata.
const RESERVED_HEADERS: &[&str] = &[
    "accept-encoding",
    "connection",
    "content-encoding",
    "content-length",
    "content-type",
    "date",
    "host",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    TIMEOUT_HEADER,
];

fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.contains(&name)
}

/// Check whether a content type header names the frame content type.
///
/// Parameters after `;` are ignored.
pub fn is_frame_content_type(value: Option<&HeaderValue>) -> bool {
    let Some(value) = value.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let media_type = value.split(';').next().unwrap_or("").trim();
    media_type.eq_ignore_ascii_case(CONTENT_TYPE)
}

/// Append metadata to a header map.
///
/// Reserved transport headers are skipped. Keys or text values that are
/// not valid in HTTP headers fail with INTERNAL.
pub fn encode_metadata(metadata: &Metadata, headers: &mut HeaderMap) -> Result<(), Status> {
    for (key, value) in metadata.iter() {
        if is_reserved(key) {
            debug!(key, "skipping reserved metadata key");
            continue;
        }

        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| Status::internal(format!("invalid metadata key {:?}", key)))?;

        let value = match value {
            MetadataValue::Ascii(text) => HeaderValue::from_str(text).map_err(|_| {
                Status::internal(format!("invalid value for metadata key {:?}", key))
            })?,
            MetadataValue::Binary(data) => HeaderValue::from_str(&STANDARD.encode(data))
                .map_err(|_| Status::internal("base64 produced an invalid header value"))?,
        };

        headers.append(name, value);
    }
    Ok(())
}

/// Extract metadata from a header map.
///
/// Reserved transport headers are skipped, as are values that cannot be
/// decoded.
pub fn decode_metadata(headers: &HeaderMap) -> Metadata {
    let mut metadata = Metadata::new();

    for (name, value) in headers.iter() {
        let key = name.as_str();
        if is_reserved(key) {
            continue;
        }

        if is_binary_key(key) {
            let raw = value.as_bytes();
            let decoded = STANDARD
                .decode(raw)
                .or_else(|_| STANDARD_NO_PAD.decode(raw));
            match decoded {
                Ok(data) => metadata.insert_bin(key, data),
                Err(e) => debug!(key, error = %e, "dropping undecodable binary header"),
            }
        } else {
            match value.to_str() {
                Ok(text) => metadata.insert(key, text),
                Err(_) => debug!(key, "dropping non-text header"),
            }
        }
    }

    metadata
}
