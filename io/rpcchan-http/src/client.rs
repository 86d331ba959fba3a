//! RPC channel over HTTP/1.1.
//!
//! Every call is one POST request. The request body carries DATA frames,
//! one per sent message; the response body carries DATA frames followed by
//! exactly one TRAILER frame with the terminal status.

use crate::body::{self, FrameBody, FrameSender};
use crate::codes::code_from_http_status;
use crate::headers::{
    CONTENT_TYPE, TIMEOUT_HEADER, decode_metadata, encode_metadata, is_frame_content_type,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::{HttpConnector, HttpInfo};
use hyper_util::rt::TokioExecutor;
use rpcchan::{
    CallOption, CallOptionVisitor, CallOptions, Capture, Channel, ClientStream, Context,
    DEFAULT_MAX_RECV_MESSAGE_SIZE, Frame, FrameDecoder, Metadata, PerRpcCredentials, Status,
    StreamDesc, Timeout, encode_data,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// A [`Channel`] that sends calls to an HTTP server hosting a
/// [`Server`](crate::Server).
#[derive(Clone)]
pub struct HttpChannel {
    client: Client<HttpConnector, FrameBody>,
    base_url: String,
}

impl HttpChannel {
    /// Create a channel for the server at `base_url`.
    ///
    /// Method paths are appended to the base URL, which is normalized to
    /// end in `/`. Only `http` URLs are supported.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, Status> {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self::with_client(client, base_url)
    }

    /// Create a channel using an existing HTTP client.
    pub fn with_client(
        client: Client<HttpConnector, FrameBody>,
        base_url: impl AsRef<str>,
    ) -> Result<Self, Status> {
        let mut base_url = base_url.as_ref().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        let uri: http::Uri = base_url
            .parse()
            .map_err(|e| Status::invalid_argument(format!("invalid base URL: {}", e)))?;
        if uri.scheme_str() != Some("http") {
            return Err(Status::invalid_argument(format!(
                "unsupported base URL {:?}: only http is supported",
                base_url
            )));
        }
        if uri.host().is_none() {
            return Err(Status::invalid_argument(format!(
                "base URL {:?} has no host",
                base_url
            )));
        }

        Ok(Self { client, base_url })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn method_url(&self, method: &str) -> String {
        let method = method.strip_prefix('/').unwrap_or(method);
        format!("{}{}", self.base_url, method)
    }

    async fn start_call(
        &self,
        ctx: &Context,
        method: &str,
        options: &CallOptions,
    ) -> Result<HttpClientStream, Status> {
        let mut settings = CallSettings::default();
        options.visit(&mut settings);

        if let Some(status) = ctx.err() {
            return Err(status);
        }

        let url = self.method_url(method);
        let metadata = tokio::select! {
            result = settings.request_metadata(ctx, &url) => result?,
            status = ctx.done() => return Err(status),
        };

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&url)
            .header(header::CONTENT_TYPE, CONTENT_TYPE);
        if let Some(remaining) = ctx.remaining() {
            if remaining.is_zero() {
                return Err(Status::deadline_exceeded("context deadline exceeded"));
            }
            builder = builder.header(
                TIMEOUT_HEADER,
                Timeout::from_duration(remaining).to_header_value(),
            );
        }

        let (frames, body) = body::channel(None);
        let mut request = builder
            .body(body)
            .map_err(|e| Status::internal(format!("failed to build request: {}", e)))?;
        encode_metadata(&metadata, request.headers_mut())?;

        debug!(method, url = %url, "starting call");

        let (response_tx, response_rx) = oneshot::channel();
        let response = self.client.request(request);
        let task = tokio::spawn(async move {
            let result = response.await.map_err(|e| {
                let reason = match std::error::Error::source(&e) {
                    Some(source) => format!("{}: {}", e, source),
                    None => e.to_string(),
                };
                Status::unavailable(format!("request failed: {}", reason))
            });
            let _ = response_tx.send(result);
        });

        Ok(HttpClientStream {
            ctx: ctx.clone(),
            frames: Some(frames),
            state: CallState::Waiting(response_rx),
            task,
            header: None,
            trailer: Metadata::new(),
            pending: VecDeque::new(),
            settings,
        })
    }
}

#[async_trait]
impl Channel for HttpChannel {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> Result<Bytes, Status> {
        let mut call = self.start_call(ctx, method, options).await?;
        call.send(request).await?;
        call.close_send().await?;

        let response = call
            .recv()
            .await?
            .ok_or_else(|| Status::internal("call completed without a response message"))?;
        match call.recv().await? {
            None => Ok(response),
            Some(_) => Err(Status::internal("unary call returned more than one response message")),
        }
    }

    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
    ) -> Result<Box<dyn ClientStream>, Status> {
        trace!(
            method,
            client_streams = desc.client_streams,
            server_streams = desc.server_streams,
            "new stream"
        );
        let call = self.start_call(ctx, method, options).await?;
        Ok(Box::new(call))
    }
}

/// Call options understood by this channel.
struct CallSettings {
    headers: Vec<Capture<Metadata>>,
    trailers: Vec<Capture<Metadata>>,
    peers: Vec<Capture<SocketAddr>>,
    credentials: Vec<Arc<dyn PerRpcCredentials>>,
    max_recv_message_size: usize,
    max_send_message_size: Option<usize>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            trailers: Vec::new(),
            peers: Vec::new(),
            credentials: Vec::new(),
            max_recv_message_size: DEFAULT_MAX_RECV_MESSAGE_SIZE,
            max_send_message_size: None,
        }
    }
}

impl CallSettings {
    /// Outgoing metadata: the context's plus every credential's.
    async fn request_metadata(&self, ctx: &Context, url: &str) -> Result<Metadata, Status> {
        let mut metadata = ctx.metadata().clone();
        for creds in &self.credentials {
            // Base URLs are always plaintext http.
            if creds.require_transport_security() {
                return Err(Status::unauthenticated(
                    "credentials require transport security",
                ));
            }
            metadata.extend(creds.request_metadata(url).await?);
        }
        Ok(metadata)
    }
}

impl CallOptionVisitor for CallSettings {
    fn header(&mut self, capture: &Capture<Metadata>) {
        self.headers.push(capture.clone());
    }

    fn trailer(&mut self, capture: &Capture<Metadata>) {
        self.trailers.push(capture.clone());
    }

    fn peer(&mut self, capture: &Capture<SocketAddr>) {
        self.peers.push(capture.clone());
    }

    fn per_rpc_credentials(&mut self, creds: &Arc<dyn PerRpcCredentials>) {
        self.credentials.push(creds.clone());
    }

    fn max_recv_message_size(&mut self, size: usize) {
        self.max_recv_message_size = size;
    }

    fn max_send_message_size(&mut self, size: usize) {
        self.max_send_message_size = Some(size);
    }

    fn unrecognized(&mut self, option: &CallOption) {
        trace!(?option, "ignoring call option");
    }
}

enum CallState {
    /// Request sent, waiting for the response head.
    Waiting(oneshot::Receiver<Result<Response<Incoming>, Status>>),
    /// Reading frames from the response body.
    Reading {
        body: Incoming,
        decoder: FrameDecoder,
    },
    /// Terminal outcome known.
    Done(Result<(), Status>),
}

/// Client half of a call made through [`HttpChannel`].
pub struct HttpClientStream {
    ctx: Context,
    frames: Option<FrameSender>,
    state: CallState,
    task: JoinHandle<()>,
    header: Option<Metadata>,
    trailer: Metadata,
    /// Messages read while looking for the outcome of a failed send.
    pending: VecDeque<Bytes>,
    settings: CallSettings,
}

/// What the next read from the response produced.
enum Step {
    Message(Bytes),
    Again,
}

impl HttpClientStream {
    fn finish(&mut self, outcome: Result<(), Status>) {
        if let Err(status) = &outcome {
            debug!(code = %status.code(), message = status.message(), "call failed");
        }
        self.task.abort();
        self.frames = None;
        for capture in &self.settings.trailers {
            capture.set(self.trailer.clone());
        }
        self.state = CallState::Done(outcome);
    }

    fn on_trailer(&mut self, status: Status) {
        self.trailer = status.metadata().clone();
        let outcome = if status.is_ok() { Ok(()) } else { Err(status) };
        self.finish(outcome);
    }

    fn on_response(&mut self, response: Response<Incoming>) {
        if let Some(info) = response.extensions().get::<HttpInfo>() {
            let remote = info.remote_addr();
            for capture in &self.settings.peers {
                capture.set(remote);
            }
        }

        let status = response.status();
        if status != StatusCode::OK {
            let code = code_from_http_status(status);
            self.finish(Err(Status::new(
                code,
                format!("unexpected HTTP status {}", status),
            )));
            return;
        }

        if !is_frame_content_type(response.headers().get(header::CONTENT_TYPE)) {
            self.finish(Err(Status::internal(format!(
                "unexpected response content type {:?}",
                response.headers().get(header::CONTENT_TYPE)
            ))));
            return;
        }

        let header = decode_metadata(response.headers());
        for capture in &self.settings.headers {
            capture.set(header.clone());
        }
        self.header = Some(header);

        self.state = CallState::Reading {
            body: response.into_body(),
            decoder: FrameDecoder::with_max_message_size(self.settings.max_recv_message_size),
        };
    }

    /// Advance the call by one event.
    async fn step(&mut self) -> Result<Option<Step>, Status> {
        let ctx = self.ctx.clone();

        // Buffered messages are not delivered once the call is cancelled.
        if !matches!(self.state, CallState::Done(_))
            && let Some(status) = ctx.err()
        {
            self.finish(Err(status));
            return Ok(Some(Step::Again));
        }

        match &mut self.state {
            CallState::Done(outcome) => outcome.clone().map(|()| None),
            CallState::Waiting(response) => {
                let result = tokio::select! {
                    result = response => result,
                    status = ctx.done() => {
                        self.finish(Err(status));
                        return Ok(Some(Step::Again));
                    }
                };
                match result {
                    Ok(Ok(response)) => self.on_response(response),
                    Ok(Err(status)) => self.finish(Err(status)),
                    Err(_) => self.finish(Err(Status::unavailable("request task ended"))),
                }
                Ok(Some(Step::Again))
            }
            CallState::Reading { body, decoder } => {
                match decoder.decode() {
                    Ok(Some(Frame::Data(message))) => return Ok(Some(Step::Message(message))),
                    Ok(Some(Frame::Trailer(status))) => {
                        self.on_trailer(status);
                        return Ok(Some(Step::Again));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.finish(Err(e.into()));
                        return Ok(Some(Step::Again));
                    }
                }

                let frame = tokio::select! {
                    frame = body.frame() => frame,
                    status = ctx.done() => {
                        self.finish(Err(status));
                        return Ok(Some(Step::Again));
                    }
                };

                match frame {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            decoder.feed(&data);
                        }
                    }
                    Some(Err(e)) => {
                        let status = Status::unavailable(format!("failed to read response: {}", e));
                        self.finish(Err(status));
                    }
                    None => {
                        let status = match decoder.finish() {
                            Err(e) => e.into(),
                            Ok(()) => Status::unknown("response body ended without a trailer"),
                        };
                        self.finish(Err(status));
                    }
                }
                Ok(Some(Step::Again))
            }
        }
    }

    /// Wait until the response head arrived or the call completed.
    async fn wait_for_response(&mut self) {
        while matches!(self.state, CallState::Waiting(_)) {
            let _ = self.step().await;
        }
    }

    /// Read the response to its end after the request body was closed
    /// under us, and report why.
    async fn send_failure(&mut self) -> Status {
        self.frames = None;
        loop {
            match self.step().await {
                Ok(Some(Step::Message(message))) => self.pending.push_back(message),
                Ok(Some(Step::Again)) => continue,
                Ok(None) => {
                    return Status::failed_precondition(
                        "server completed the call before the request was sent; \
                         call recv for the response",
                    );
                }
                Err(status) => return status,
            }
        }
    }

    fn outcome(&self) -> Option<&Result<(), Status>> {
        match &self.state {
            CallState::Done(outcome) => Some(outcome),
            _ => None,
        }
    }
}

#[async_trait]
impl ClientStream for HttpClientStream {
    async fn header(&mut self) -> Result<Metadata, Status> {
        self.wait_for_response().await;
        if let Some(header) = &self.header {
            return Ok(header.clone());
        }
        match self.outcome() {
            Some(Err(status)) => Err(status.clone()),
            _ => Ok(Metadata::new()),
        }
    }

    fn trailer(&self) -> Metadata {
        self.trailer.clone()
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        if self.outcome().is_some() {
            return Err(Status::failed_precondition("send on a completed call"));
        }
        let Some(frames) = self.frames.clone() else {
            return Err(Status::failed_precondition("send after close_send"));
        };

        if let Some(max) = self.settings.max_send_message_size
            && message.len() > max
        {
            let status = Status::resource_exhausted(format!(
                "message of {} bytes exceeds maximum of {} bytes",
                message.len(),
                max
            ));
            self.finish(Err(status.clone()));
            return Err(status);
        }

        let ctx = self.ctx.clone();
        let sent = tokio::select! {
            result = frames.send(encode_data(&message)) => result.is_ok(),
            status = ctx.done() => {
                self.finish(Err(status.clone()));
                return Err(status);
            }
        };
        if sent {
            Ok(())
        } else {
            debug!("request body closed before send completed");
            Err(self.send_failure().await)
        }
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.frames = None;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        if self.ctx.err().is_none()
            && let Some(message) = self.pending.pop_front()
        {
            return Ok(Some(message));
        }
        loop {
            match self.step().await? {
                Some(Step::Message(message)) => return Ok(Some(message)),
                Some(Step::Again) => continue,
                None => return Ok(None),
            }
        }
    }

    fn context(&self) -> &Context {
        &self.ctx
    }
}

impl Drop for HttpClientStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpcchan::{BearerToken, Code};

    #[test]
    fn test_base_url_normalized() {
        let channel = HttpChannel::new("http://127.0.0.1:8080/rpc").unwrap();
        assert_eq!(channel.base_url(), "http://127.0.0.1:8080/rpc/");
        assert_eq!(
            channel.method_url("/svc.Test/Unary"),
            "http://127.0.0.1:8080/rpc/svc.Test/Unary"
        );
        assert_eq!(
            channel.method_url("svc.Test/Unary"),
            "http://127.0.0.1:8080/rpc/svc.Test/Unary"
        );
    }

    #[test]
    fn test_base_url_rejected() {
        let err = HttpChannel::new("https://example.com/").err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(HttpChannel::new("not a url").is_err());
        assert!(HttpChannel::new("/relative/").is_err());
    }

    #[test]
    fn test_call_settings_defaults() {
        let settings = CallSettings::default();
        assert_eq!(settings.max_recv_message_size, DEFAULT_MAX_RECV_MESSAGE_SIZE);
        assert_eq!(settings.max_send_message_size, None);
    }

    #[test]
    fn test_call_settings_visit() {
        let header = Capture::new();
        let options = CallOptions::new()
            .with(CallOption::Header(header))
            .with(CallOption::MaxRecvMessageSize(10))
            .with(CallOption::MaxSendMessageSize(20))
            .with(CallOption::WaitForReady(true));

        let mut settings = CallSettings::default();
        options.visit(&mut settings);
        assert_eq!(settings.headers.len(), 1);
        assert_eq!(settings.max_recv_message_size, 10);
        assert_eq!(settings.max_send_message_size, Some(20));
    }

    #[tokio::test]
    async fn test_secure_credentials_refused() {
        let mut settings = CallSettings::default();
        settings
            .credentials
            .push(Arc::new(BearerToken::new("secret")));

        let err = settings
            .request_metadata(&Context::background(), "http://localhost/")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_credentials_metadata_merged() {
        let mut md = Metadata::new();
        md.insert("x-a", "1");
        let ctx = Context::background().with_metadata(md);

        let mut settings = CallSettings::default();
        settings
            .credentials
            .push(Arc::new(BearerToken::new("t").allow_insecure()));

        let metadata = settings
            .request_metadata(&ctx, "http://localhost/")
            .await
            .unwrap();
        assert_eq!(metadata.get("x-a"), Some("1"));
        assert_eq!(metadata.get("authorization"), Some("Bearer t"));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let channel = HttpChannel::new("http://127.0.0.1:1/").unwrap();
        let ctx = Context::background().child();
        ctx.cancel();

        let err = channel
            .invoke(&ctx, "/svc/M", Bytes::new(), &CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        // Bind and drop a listener to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let channel = HttpChannel::new(format!("http://{}/", addr)).unwrap();
        let err = channel
            .invoke(&Context::background(), "/svc/M", Bytes::new(), &CallOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
