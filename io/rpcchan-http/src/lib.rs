//! RPC over plain HTTP/1.1.
//!
//! Each call is one `POST {base}/{service}/{method}` request. The request
//! body carries length-prefixed DATA frames; the response body carries DATA
//! frames followed by exactly one TRAILER frame with the final status.
//! Metadata travels in HTTP headers, with binary values base64 encoded.
//!
//! [`HttpChannel`] is the client side and [`Server`] the server side.
//!
//! # Example
//!
//! ```ignore
//! use rpcchan_http::{HttpChannel, Server};
//! use std::sync::Arc;
//!
//! let mut server = Server::new().with_base_path("/rpc/");
//! rpcchan::testing::register_test_service(&mut server, Arc::new(TestServer::new()));
//! tokio::spawn(Arc::new(server).serve(listener, shutdown));
//!
//! let channel = HttpChannel::new("http://127.0.0.1:8080/rpc/")?;
//! ```

mod body;
mod client;
mod codes;
mod headers;
mod server;

pub use body::{BoxBody, FrameBody, FrameSender};
pub use client::{HttpChannel, HttpClientStream};
pub use codes::code_from_http_status;
pub use headers::{CONTENT_TYPE, TIMEOUT_HEADER, decode_metadata, encode_metadata};
pub use server::{Authenticator, ErrorRenderer, Server, default_error_renderer};
