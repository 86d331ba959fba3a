//! RPC server handler over HTTP/1.1.
//!
//! Requests are routed by path, `{base_path}{service}/{method}`, to the
//! registered handlers. Every call that reaches dispatch gets an HTTP 200
//! response whose body ends with exactly one TRAILER frame, unless the
//! client went away first. Requests rejected before dispatch are rendered
//! by the [`ErrorRenderer`].

use crate::body::{self, BoxBody, FrameSender};
use crate::headers::{
    CONTENT_TYPE, TIMEOUT_HEADER, decode_metadata, encode_metadata, is_frame_content_type,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::{Method, Request, Response, StatusCode, header};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rpcchan::{
    Context, DEFAULT_MAX_RECV_MESSAGE_SIZE, Frame, FrameDecoder, HandlerMap, Implementation,
    Metadata, MethodHandler, ResponseMetadata, ServerStream, ServiceDesc, ServiceRegistry, Status,
    Timeout, UnaryCall, encode_data, encode_trailer, encode_trailer_stripped, split_method_name,
};
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Renders requests rejected before dispatch.
///
/// Receives the suggested HTTP status and an RPC status describing the
/// failure.
pub type ErrorRenderer = Arc<dyn Fn(StatusCode, &Status) -> Response<BoxBody> + Send + Sync>;

/// Default renderer: the suggested status with the message as plain text.
pub fn default_error_renderer(http_status: StatusCode, status: &Status) -> Response<BoxBody> {
    let mut response = Response::new(Full::new(Bytes::from(status.message().to_string())).boxed());
    *response.status_mut() = http_status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Decides whether a call may proceed.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Inspect the call context (incoming metadata, peer) and the full
    /// method name. An error rejects the call with that status.
    async fn authenticate(&self, ctx: &Context, method: &str) -> Result<(), Status>;
}

/// Serves registered services over HTTP/1.1.
pub struct Server {
    handlers: HandlerMap,
    base_path: String,
    error_renderer: ErrorRenderer,
    authenticator: Option<Arc<dyn Authenticator>>,
    max_recv_message_size: usize,
    max_send_message_size: Option<usize>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.handlers.service_names())
            .field("base_path", &self.base_path)
            .field("max_recv_message_size", &self.max_recv_message_size)
            .field("max_send_message_size", &self.max_send_message_size)
            .finish()
    }
}

impl Server {
    /// Create a server rooted at `/` with default limits.
    pub fn new() -> Self {
        Self {
            handlers: HandlerMap::new(),
            base_path: "/".to_string(),
            error_renderer: Arc::new(default_error_renderer),
            authenticator: None,
            max_recv_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
            max_send_message_size: None,
        }
    }

    /// Serve methods under `path`. Leading and trailing slashes are added
    /// when missing.
    pub fn with_base_path(mut self, path: impl AsRef<str>) -> Self {
        let path = path.as_ref().trim_matches('/');
        self.base_path = if path.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", path)
        };
        self
    }

    /// Render requests rejected before dispatch with `renderer` instead of
    /// [`default_error_renderer`].
    pub fn with_error_renderer(
        mut self,
        renderer: impl Fn(StatusCode, &Status) -> Response<BoxBody> + Send + Sync + 'static,
    ) -> Self {
        self.error_renderer = Arc::new(renderer);
        self
    }

    /// Check every dispatched call with `authenticator` before its handler
    /// runs.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Largest request message accepted, in bytes.
    pub fn with_max_recv_message_size(mut self, size: usize) -> Self {
        self.max_recv_message_size = size;
        self
    }

    /// Largest response message sent, in bytes.
    pub fn with_max_send_message_size(mut self, size: usize) -> Self {
        self.max_send_message_size = Some(size);
        self
    }

    /// The normalized base path, always starting and ending with `/`.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// The registered services.
    pub fn handlers(&self) -> &HandlerMap {
        &self.handlers
    }

    /// Handle one HTTP request.
    ///
    /// `peer` is recorded in the call context when known.
    pub async fn handle<B>(&self, request: Request<B>, peer: Option<SocketAddr>) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: fmt::Display,
    {
        let path = request.uri().path().to_string();

        let Some(method_path) = path.strip_prefix(&self.base_path) else {
            return self.render_error(
                StatusCode::NOT_FOUND,
                Status::unimplemented(format!("no handler for path {}", path)),
            );
        };
        if request.method() != Method::POST {
            return self.render_error(
                StatusCode::METHOD_NOT_ALLOWED,
                Status::unimplemented(format!("method {} not allowed", request.method())),
            );
        }
        if !is_frame_content_type(request.headers().get(header::CONTENT_TYPE)) {
            return self.render_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                Status::internal(format!(
                    "unsupported content type {:?}",
                    request.headers().get(header::CONTENT_TYPE)
                )),
            );
        }

        let full_method = format!("/{}", method_path);
        let Some((service, method)) = split_method_name(method_path) else {
            return trailer_only(Status::unimplemented(format!("unknown method {}", full_method)));
        };
        let Some((desc, implementation)) = self.handlers.lookup(service, method) else {
            debug!(method = %full_method, "unknown method");
            return trailer_only(Status::unimplemented(format!("unknown method {}", full_method)));
        };

        let ctx = match self.call_context(&request, peer) {
            Ok(ctx) => ctx,
            Err(status) => return trailer_only(status),
        };

        if let Some(authenticator) = &self.authenticator
            && let Err(status) = authenticator.authenticate(&ctx, &full_method).await
        {
            warn!(method = %full_method, peer = ?peer, code = %status.code(), "call rejected");
            return trailer_only(status);
        }

        debug!(method = %full_method, peer = ?peer, "dispatching call");

        let (response_md, header_rx) = ResponseMetadata::new();
        let (frames, response_body) = body::channel(Some(ctx.token().clone().drop_guard()));
        let call = Call {
            ctx,
            method: full_method,
            response: response_md,
            frames,
            reader: RequestReader::new(request.into_body(), self.max_recv_message_size),
            max_send_message_size: self.max_send_message_size,
        };
        tokio::spawn(call.run(desc.handler.clone(), implementation.clone()));

        // Headers are flushed before any frame is written, at the latest
        // just ahead of the trailer.
        let header = header_rx.await.unwrap_or_default();

        let mut response = Response::new(response_body.boxed());
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static(CONTENT_TYPE),
        );
        if let Err(status) = encode_metadata(&header, response.headers_mut()) {
            warn!(code = %status.code(), message = status.message(), "dropping invalid header metadata");
        }
        response
    }

    fn render_error(&self, http_status: StatusCode, status: Status) -> Response<BoxBody> {
        debug!(%http_status, %status, "rejecting request");
        (self.error_renderer)(http_status, &status)
    }

    fn call_context<B>(
        &self,
        request: &Request<B>,
        peer: Option<SocketAddr>,
    ) -> Result<Context, Status> {
        let mut ctx = Context::background().with_metadata(decode_metadata(request.headers()));
        if let Some(peer) = peer {
            ctx = ctx.with_peer(peer);
        }
        if let Some(value) = request.headers().get(TIMEOUT_HEADER) {
            let timeout = value
                .to_str()
                .ok()
                .and_then(Timeout::parse)
                .ok_or_else(|| Status::internal(format!("malformed {} header", TIMEOUT_HEADER)))?;
            ctx = ctx.with_timeout(timeout.as_duration());
        }
        Ok(ctx)
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Connections in progress are shut down gracefully.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.serve_connection(stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                }
            }
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |request| {
            let server = self.clone();
            async move { Ok::<_, Infallible>(server.handle(request, Some(peer)).await) }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };
        if let Err(e) = result {
            debug!("HTTP connection from {peer} ended: {e}");
        }
    }
}

impl ServiceRegistry for Server {
    fn register_service(&mut self, desc: ServiceDesc, implementation: Implementation) {
        self.handlers.register_service(desc, implementation);
    }
}

/// Encode the trailer, keeping code and message when the rest does not fit.
fn trailer_frame(status: &Status) -> Bytes {
    encode_trailer(status).unwrap_or_else(|e| {
        warn!(code = %status.code(), error = %e, "dropping trailer metadata");
        encode_trailer_stripped(status)
    })
}

/// An HTTP 200 response whose body is a single TRAILER frame.
fn trailer_only(status: Status) -> Response<BoxBody> {
    let mut response = Response::new(Full::new(trailer_frame(&status)).boxed());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static(CONTENT_TYPE),
    );
    response
}

type RequestBody = Pin<Box<dyn Body<Data = Bytes, Error = String> + Send>>;

/// Reads DATA frames from a request body.
struct RequestReader {
    body: RequestBody,
    decoder: FrameDecoder,
    eof: bool,
}

impl RequestReader {
    fn new<B>(body: B, max_message_size: usize) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: fmt::Display,
    {
        Self {
            body: Box::pin(body.map_err(|e| e.to_string())),
            decoder: FrameDecoder::with_max_message_size(max_message_size),
            eof: false,
        }
    }

    /// Next request message, `None` at the end of the body.
    async fn next(&mut self, ctx: &Context) -> Result<Option<Bytes>, Status> {
        loop {
            match self.decoder.decode()? {
                Some(Frame::Data(message)) => return Ok(Some(message)),
                Some(Frame::Trailer(_)) => {
                    return Err(Status::internal("unexpected trailer frame in request"));
                }
                None => {}
            }
            if self.eof {
                return Ok(None);
            }

            let frame = tokio::select! {
                frame = self.body.frame() => frame,
                status = ctx.done() => return Err(status),
            };
            match frame {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.decoder.feed(&data);
                    }
                }
                Some(Err(e)) => {
                    return Err(Status::cancelled(format!("failed to read request: {}", e)));
                }
                None => {
                    self.decoder.finish()?;
                    self.eof = true;
                }
            }
        }
    }
}

/// One dispatched call.
struct Call {
    ctx: Context,
    method: String,
    response: ResponseMetadata,
    frames: FrameSender,
    reader: RequestReader,
    max_send_message_size: Option<usize>,
}

impl Call {
    async fn run(self, handler: MethodHandler, implementation: Implementation) {
        let Call {
            ctx,
            method,
            response,
            frames,
            mut reader,
            max_send_message_size,
        } = self;

        let outcome = match handler {
            MethodHandler::Unary(handler) => {
                let request = match read_unary_request(&mut reader, &ctx).await {
                    Ok(request) => request,
                    Err(status) => {
                        finish(&ctx, &method, &response, &frames, Err(status)).await;
                        return;
                    }
                };

                let call = UnaryCall::new(ctx.clone(), response.clone());
                let result = AssertUnwindSafe(handler(implementation, call, request))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(method = %method, "handler panicked");
                        Err(Status::internal("handler panicked"))
                    });

                match result {
                    Ok(message) => {
                        let stream = ResponseWriter {
                            ctx: ctx.clone(),
                            response: response.clone(),
                            frames: frames.clone(),
                            max_send_message_size,
                        };
                        stream.write(message).await
                    }
                    Err(status) => Err(status),
                }
            }
            MethodHandler::Streaming { handler, .. } => {
                let stream = HttpServerStream {
                    writer: ResponseWriter {
                        ctx: ctx.clone(),
                        response: response.clone(),
                        frames: frames.clone(),
                        max_send_message_size,
                    },
                    reader,
                };
                AssertUnwindSafe(handler(implementation, Box::new(stream)))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(method = %method, "handler panicked");
                        Err(Status::internal("handler panicked"))
                    })
            }
        };

        finish(&ctx, &method, &response, &frames, outcome).await;
    }
}

async fn read_unary_request(reader: &mut RequestReader, ctx: &Context) -> Result<Bytes, Status> {
    let request = reader
        .next(ctx)
        .await?
        .ok_or_else(|| Status::internal("no request message for unary call"))?;
    if reader.next(ctx).await?.is_some() {
        return Err(Status::internal("more than one request message for unary call"));
    }
    Ok(request)
}

/// Write the trailer for `outcome` and end the response body.
async fn finish(
    ctx: &Context,
    method: &str,
    response: &ResponseMetadata,
    frames: &FrameSender,
    outcome: Result<(), Status>,
) {
    response.flush_header();

    let status = outcome.err().unwrap_or_default();
    let mut trailer = response.take_trailer();
    trailer.extend(status.metadata().clone());
    let mut final_status = Status::new(status.code(), status.message()).with_metadata(trailer);
    if let Some(details) = status.details() {
        final_status = final_status.with_details(details.clone());
    }

    debug!(method, code = %final_status.code(), "call finished");

    if ctx.is_cancelled() {
        debug!(method, "client gone, not writing trailer");
        return;
    }
    if frames.send(trailer_frame(&final_status)).await.is_err() {
        debug!(method, "response body dropped before trailer");
    }
}

/// Writes response frames of one call.
struct ResponseWriter {
    ctx: Context,
    response: ResponseMetadata,
    frames: FrameSender,
    max_send_message_size: Option<usize>,
}

impl ResponseWriter {
    async fn write(&self, message: Bytes) -> Result<(), Status> {
        if let Some(status) = self.ctx.err() {
            return Err(status);
        }
        if let Some(max) = self.max_send_message_size
            && message.len() > max
        {
            return Err(Status::resource_exhausted(format!(
                "response message of {} bytes exceeds maximum of {} bytes",
                message.len(),
                max
            )));
        }

        self.response.flush_header();
        tokio::select! {
            result = self.frames.send(encode_data(&message)) => {
                result.map_err(|_| Status::cancelled("client disconnected"))
            }
            status = self.ctx.done() => Err(status),
        }
    }
}

/// Server half of a streaming call.
struct HttpServerStream {
    writer: ResponseWriter,
    reader: RequestReader,
}

#[async_trait]
impl ServerStream for HttpServerStream {
    fn context(&self) -> &Context {
        &self.writer.ctx
    }

    fn set_header(&mut self, metadata: Metadata) -> Result<(), Status> {
        self.writer.response.set_header(metadata)
    }

    fn send_header(&mut self, metadata: Metadata) -> Result<(), Status> {
        self.writer.response.send_header(metadata)
    }

    fn set_trailer(&mut self, metadata: Metadata) {
        self.writer.response.set_trailer(metadata)
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.writer.write(message).await
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        let ctx = self.writer.ctx.clone();
        self.reader.next(&ctx).await
    }
}
