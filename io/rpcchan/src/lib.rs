//! rpcchan - RPC channels over alternate transports.
//!
//! This crate defines the transport seam between generated RPC code and
//! the wire: client stubs call through a [`Channel`], server registrars
//! register with a [`ServiceRegistry`]. Transports implement these traits.
//!
//! # Features
//!
//! - Status codes, status errors and ordered text/binary metadata
//! - Length-prefixed DATA/TRAILER framing for transports without native
//!   stream support
//! - Per-call context with cancellation, deadlines and metadata
//! - Typed call options, per-RPC credentials and client interceptors
//! - An in-memory [`HandlerMap`] registry
//! - A conformance kit for channel implementations (feature `testing`)
//!
//! # Framing
//!
//! A call body is a sequence of frames:
//! - 4 bytes: payload length (big-endian u32)
//! - 1 byte: frame kind (0 = DATA, 1 = TRAILER)
//! - N bytes: payload
//!
//! Exactly one TRAILER frame, carrying the terminal status, ends every body
//! that completed normally.

mod channel;
mod context;
mod credentials;
mod frame;
mod metadata;
mod options;
mod registry;
mod status;
mod trailer;

#[cfg(feature = "testing")]
pub mod testing;

pub use channel::{
    Channel, ClientInterceptor, ClientStream, InterceptedChannel, StreamDesc, split_method_name,
};
pub use context::Context;
pub use credentials::{BearerToken, PerRpcCredentials};
pub use frame::{
    DEFAULT_MAX_RECV_MESSAGE_SIZE, Frame, FrameDecoder, FrameError, FrameKind, HEADER_SIZE,
    MAX_TRAILER_SIZE, decode_frame, encode_data, encode_trailer, encode_trailer_stripped,
};
pub use metadata::{BINARY_SUFFIX, Metadata, MetadataValue, Timeout, is_binary_key};
pub use options::{CallOption, CallOptionVisitor, CallOptions, Capture};
pub use registry::{
    HandlerMap, Implementation, MethodDesc, MethodHandler, RegisteredService, ResponseMetadata,
    ServerStream, ServiceDesc, ServiceRegistry, StreamHandler, UnaryCall, UnaryHandler,
    stream_handler, unary_handler,
};
pub use status::{Code, Status};
pub use trailer::{decode_status, encode_status};

// Re-export useful types from dependencies
pub use async_trait::async_trait;
pub use bytes::Bytes;
