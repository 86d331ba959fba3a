//! Conformance kit for channel implementations.
//!
//! Provides a small test service with all four method shapes, the client
//! stub and registrar a code generator would emit for it, and
//! [`run_channel_test_cases`], which exercises any [`Channel`] connected to
//! a server hosting [`TestServer`].

use crate::channel::{Channel, ClientStream, StreamDesc};
use crate::context::Context;
use crate::metadata::{Metadata, MetadataValue};
use crate::options::{CallOption, CallOptions, Capture};
use crate::registry::{
    MethodDesc, ServerStream, ServiceDesc, ServiceRegistry, UnaryCall, stream_handler,
    unary_handler,
};
use crate::status::{Code, Status};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Fully qualified name of the test service.
pub const SERVICE_NAME: &str = "rpcchan.testing.TestService";

pub const UNARY_METHOD: &str = "/rpcchan.testing.TestService/Unary";
pub const CLIENT_STREAM_METHOD: &str = "/rpcchan.testing.TestService/ClientStream";
pub const SERVER_STREAM_METHOD: &str = "/rpcchan.testing.TestService/ServerStream";
pub const BIDI_STREAM_METHOD: &str = "/rpcchan.testing.TestService/BidiStream";

/// Request and response message of the test service.
///
/// Requests instruct the server what to do; fields that only make sense
/// in one direction are left at their defaults in the other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestMessage {
    pub payload: String,
    /// Request: number of responses to stream. Response: sequence number
    /// or number of requests received.
    pub count: u32,
    /// Status code to fail with, 0 for OK.
    pub code: u32,
    /// Status message to fail with.
    pub message: String,
    /// Status details to fail with.
    pub details: Option<String>,
    /// Delay before each response, in milliseconds.
    pub delay_ms: u64,
    /// Response header metadata to set.
    pub headers: BTreeMap<String, String>,
    /// Response trailer metadata to set.
    pub trailers: BTreeMap<String, String>,
    /// Response: text request metadata seen by the server.
    pub echo: BTreeMap<String, String>,
}

impl TestMessage {
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Result<Bytes, Status> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Status::internal(format!("failed to encode message: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, Status> {
        serde_json::from_slice(data)
            .map_err(|e| Status::internal(format!("failed to decode message: {}", e)))
    }

    /// The status this request asks the server to finish with.
    fn requested_status(&self) -> Result<(), Status> {
        if self.code == 0 {
            return Ok(());
        }
        let mut status = Status::new(Code::from_u32(self.code), self.message.clone());
        if let Some(details) = &self.details {
            status = status.with_details(details.clone());
        }
        Err(status)
    }
}

fn to_metadata(map: &BTreeMap<String, String>) -> Metadata {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Server-side message stream of the test service.
pub struct TestServerStream {
    inner: Box<dyn ServerStream>,
}

impl TestServerStream {
    pub fn context(&self) -> &Context {
        self.inner.context()
    }

    pub fn set_header(&mut self, metadata: Metadata) -> Result<(), Status> {
        self.inner.set_header(metadata)
    }

    pub fn send_header(&mut self, metadata: Metadata) -> Result<(), Status> {
        self.inner.send_header(metadata)
    }

    pub fn set_trailer(&mut self, metadata: Metadata) {
        self.inner.set_trailer(metadata)
    }

    pub async fn send(&mut self, message: &TestMessage) -> Result<(), Status> {
        self.inner.send(message.encode()?).await
    }

    pub async fn recv(&mut self) -> Result<Option<TestMessage>, Status> {
        match self.inner.recv().await? {
            Some(data) => Ok(Some(TestMessage::decode(&data)?)),
            None => Ok(None),
        }
    }
}

/// The test service.
#[async_trait]
pub trait TestService: Send + Sync {
    async fn unary(&self, call: UnaryCall, request: TestMessage) -> Result<TestMessage, Status>;

    /// Consume the request stream and produce one response.
    async fn client_stream(&self, stream: &mut TestServerStream) -> Result<TestMessage, Status>;

    async fn server_stream(
        &self,
        request: TestMessage,
        stream: &mut TestServerStream,
    ) -> Result<(), Status>;

    async fn bidi_stream(&self, stream: &mut TestServerStream) -> Result<(), Status>;
}

type TestServiceImpl = Arc<dyn TestService>;

/// Register a [`TestService`] implementation.
pub fn register_test_service(registry: &mut dyn ServiceRegistry, service: Arc<dyn TestService>) {
    let desc = ServiceDesc::new(SERVICE_NAME)
        .method(MethodDesc::unary(
            "Unary",
            unary_handler(
                |svc: Arc<TestServiceImpl>, call: UnaryCall, request: Bytes| async move {
                    let request = TestMessage::decode(&request)?;
                    svc.unary(call, request).await?.encode()
                },
            ),
        ))
        .method(MethodDesc::streaming(
            "ClientStream",
            true,
            false,
            stream_handler(
                |svc: Arc<TestServiceImpl>, stream: Box<dyn ServerStream>| async move {
                    let mut stream = TestServerStream { inner: stream };
                    let response = svc.client_stream(&mut stream).await?;
                    stream.send(&response).await
                },
            ),
        ))
        .method(MethodDesc::streaming(
            "ServerStream",
            false,
            true,
            stream_handler(
                |svc: Arc<TestServiceImpl>, stream: Box<dyn ServerStream>| async move {
                    let mut stream = TestServerStream { inner: stream };
                    let request = stream
                        .recv()
                        .await?
                        .ok_or_else(|| Status::internal("missing request message"))?;
                    svc.server_stream(request, &mut stream).await
                },
            ),
        ))
        .method(MethodDesc::streaming(
            "BidiStream",
            true,
            true,
            stream_handler(
                |svc: Arc<TestServiceImpl>, stream: Box<dyn ServerStream>| async move {
                    let mut stream = TestServerStream { inner: stream };
                    svc.bidi_stream(&mut stream).await
                },
            ),
        ));

    registry.register_service(desc, Arc::new(service));
}

/// Client stub for the test service.
#[derive(Clone)]
pub struct TestServiceClient {
    channel: Arc<dyn Channel>,
}

impl TestServiceClient {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    pub async fn unary(
        &self,
        ctx: &Context,
        request: &TestMessage,
        options: &CallOptions,
    ) -> Result<TestMessage, Status> {
        let response = self
            .channel
            .invoke(ctx, UNARY_METHOD, request.encode()?, options)
            .await?;
        TestMessage::decode(&response)
    }

    pub async fn client_stream(
        &self,
        ctx: &Context,
        options: &CallOptions,
    ) -> Result<TestClientStream, Status> {
        let desc = StreamDesc::new("ClientStream", true, false);
        let inner = self
            .channel
            .new_stream(ctx, &desc, CLIENT_STREAM_METHOD, options)
            .await?;
        Ok(TestClientStream { inner })
    }

    /// Start a server stream. The request is sent and the request
    /// direction closed before returning.
    pub async fn server_stream(
        &self,
        ctx: &Context,
        request: &TestMessage,
        options: &CallOptions,
    ) -> Result<TestClientStream, Status> {
        let desc = StreamDesc::new("ServerStream", false, true);
        let inner = self
            .channel
            .new_stream(ctx, &desc, SERVER_STREAM_METHOD, options)
            .await?;
        let mut stream = TestClientStream { inner };
        stream.send(request).await?;
        stream.close_send().await?;
        Ok(stream)
    }

    pub async fn bidi_stream(
        &self,
        ctx: &Context,
        options: &CallOptions,
    ) -> Result<TestClientStream, Status> {
        let desc = StreamDesc::new("BidiStream", true, true);
        let inner = self
            .channel
            .new_stream(ctx, &desc, BIDI_STREAM_METHOD, options)
            .await?;
        Ok(TestClientStream { inner })
    }
}

/// Client-side message stream of the test service.
pub struct TestClientStream {
    inner: Box<dyn ClientStream>,
}

impl TestClientStream {
    pub async fn header(&mut self) -> Result<Metadata, Status> {
        self.inner.header().await
    }

    pub fn trailer(&self) -> Metadata {
        self.inner.trailer()
    }

    pub async fn send(&mut self, message: &TestMessage) -> Result<(), Status> {
        self.inner.send(message.encode()?).await
    }

    pub async fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send().await
    }

    pub async fn recv(&mut self) -> Result<Option<TestMessage>, Status> {
        match self.inner.recv().await? {
            Some(data) => Ok(Some(TestMessage::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Half-close and wait for the single response.
    pub async fn close_and_recv(&mut self) -> Result<TestMessage, Status> {
        self.close_send().await?;
        let response = self
            .recv()
            .await?
            .ok_or_else(|| Status::internal("stream completed without a response"))?;
        match self.recv().await? {
            None => Ok(response),
            Some(_) => Err(Status::internal("stream returned more than one response")),
        }
    }

    pub fn context(&self) -> &Context {
        self.inner.context()
    }
}

/// Reference [`TestService`] implementation.
///
/// Echoes payloads, sets the requested header and trailer metadata, and
/// finishes with the requested status. Request metadata is echoed back:
/// text values in the response `echo` field, binary values as response
/// header metadata.
#[derive(Debug, Default, Clone)]
pub struct TestServer {
    cancelled: Arc<AtomicUsize>,
}

impl TestServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streaming calls that stopped because the call was
    /// cancelled or its deadline passed.
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }

    async fn pause(&self, ctx: &Context, delay_ms: u64) -> Result<(), Status> {
        if let Some(status) = ctx.err() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
            return Err(status);
        }
        if delay_ms == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(()),
            status = ctx.done() => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(status)
            }
        }
    }

    fn note_send_failure(&self, ctx: &Context) {
        if ctx.is_cancelled() {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Request metadata, split into the echo map and binary header entries.
fn echo_metadata(incoming: &Metadata) -> (BTreeMap<String, String>, Metadata) {
    let mut echo = BTreeMap::new();
    let mut binary = Metadata::new();
    for (key, value) in incoming.iter() {
        match value {
            MetadataValue::Ascii(text) => {
                echo.entry(key.to_string()).or_insert_with(|| text.clone());
            }
            MetadataValue::Binary(_) => binary.insert_value(key, value.clone()),
        }
    }
    (echo, binary)
}

#[async_trait]
impl TestService for TestServer {
    async fn unary(&self, call: UnaryCall, request: TestMessage) -> Result<TestMessage, Status> {
        let (echo, mut headers) = echo_metadata(call.context().metadata());
        headers.extend(to_metadata(&request.headers));
        call.set_header(headers)?;
        call.set_trailer(to_metadata(&request.trailers));

        if request.delay_ms > 0 {
            let ctx = call.context();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(request.delay_ms)) => {}
                status = ctx.done() => return Err(status),
            }
        }

        request.requested_status()?;
        Ok(TestMessage {
            payload: request.payload,
            echo,
            ..Default::default()
        })
    }

    async fn client_stream(&self, stream: &mut TestServerStream) -> Result<TestMessage, Status> {
        let mut first: Option<TestMessage> = None;
        let mut payload = String::new();
        let mut count = 0;

        while let Some(message) = stream.recv().await? {
            if first.is_none() {
                let (_, mut headers) = echo_metadata(stream.context().metadata());
                headers.extend(to_metadata(&message.headers));
                stream.set_header(headers)?;
                stream.set_trailer(to_metadata(&message.trailers));
            }
            payload.push_str(&message.payload);
            count += 1;
            first.get_or_insert(message);
        }

        if let Some(first) = &first {
            first.requested_status()?;
        }
        Ok(TestMessage {
            payload,
            count,
            ..Default::default()
        })
    }

    async fn server_stream(
        &self,
        request: TestMessage,
        stream: &mut TestServerStream,
    ) -> Result<(), Status> {
        let ctx = stream.context().clone();
        let (_, mut headers) = echo_metadata(ctx.metadata());
        headers.extend(to_metadata(&request.headers));
        stream.set_header(headers)?;
        stream.set_trailer(to_metadata(&request.trailers));

        for i in 0..request.count {
            self.pause(&ctx, request.delay_ms).await?;
            let message = TestMessage {
                payload: request.payload.clone(),
                count: i,
                ..Default::default()
            };
            if let Err(status) = stream.send(&message).await {
                self.note_send_failure(&ctx);
                return Err(status);
            }
        }

        request.requested_status()
    }

    async fn bidi_stream(&self, stream: &mut TestServerStream) -> Result<(), Status> {
        let ctx = stream.context().clone();
        let mut first: Option<TestMessage> = None;
        let mut seq = 0;

        while let Some(message) = stream.recv().await? {
            if first.is_none() {
                let (_, mut headers) = echo_metadata(ctx.metadata());
                headers.extend(to_metadata(&message.headers));
                stream.send_header(headers)?;
                stream.set_trailer(to_metadata(&message.trailers));
            }

            self.pause(&ctx, message.delay_ms).await?;
            let reply = TestMessage {
                payload: message.payload.clone(),
                count: seq,
                ..Default::default()
            };
            if let Err(status) = stream.send(&reply).await {
                self.note_send_failure(&ctx);
                return Err(status);
            }
            seq += 1;
            first.get_or_insert(message);
        }

        match first {
            Some(first) => first.requested_status(),
            None => Ok(()),
        }
    }
}

fn metadata_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Run the conformance test cases against `channel`.
///
/// The channel must reach a server hosting [`TestServer`]. Transports that
/// cannot interleave request and response bodies pass `full_duplex =
/// false`; bidirectional cases then send every request before reading.
///
/// Panics on the first failed expectation.
pub async fn run_channel_test_cases(channel: Arc<dyn Channel>, full_duplex: bool) {
    let client = TestServiceClient::new(channel);

    info!("channel test case: unary success");
    unary_success(&client).await;
    info!("channel test case: unary failure");
    unary_failure(&client).await;
    info!("channel test case: unary metadata");
    unary_metadata(&client).await;
    info!("channel test case: unary deadline");
    unary_deadline(&client).await;
    info!("channel test case: client stream success");
    client_stream_success(&client).await;
    info!("channel test case: client stream failure");
    client_stream_failure(&client).await;
    info!("channel test case: server stream success");
    server_stream_success(&client).await;
    info!("channel test case: server stream empty");
    server_stream_empty(&client).await;
    info!("channel test case: server stream failure");
    server_stream_failure(&client).await;
    info!("channel test case: server stream cancel");
    server_stream_cancel(&client).await;
    info!("channel test case: bidi stream success");
    bidi_stream_success(&client, full_duplex).await;
    info!("channel test case: bidi stream failure");
    bidi_stream_failure(&client).await;
}

async fn unary_success(client: &TestServiceClient) {
    let header = Capture::new();
    let trailer = Capture::new();
    let options = CallOptions::new()
        .with(CallOption::Header(header.clone()))
        .with(CallOption::Trailer(trailer.clone()));

    let request = TestMessage {
        payload: "hello".to_string(),
        headers: metadata_of(&[("x-reply-header", "h")]),
        trailers: metadata_of(&[("x-reply-trailer", "t")]),
        ..Default::default()
    };

    let response = client
        .unary(&Context::background(), &request, &options)
        .await
        .expect("unary call failed");
    assert_eq!(response.payload, "hello");

    let header = header.get().expect("header metadata was not captured");
    assert_eq!(header.get("x-reply-header"), Some("h"));
    let trailer = trailer.get().expect("trailer metadata was not captured");
    assert_eq!(trailer.get("x-reply-trailer"), Some("t"));
}

async fn unary_failure(client: &TestServiceClient) {
    let trailer = Capture::new();
    let options = CallOptions::new().with(CallOption::Trailer(trailer.clone()));

    let request = TestMessage {
        code: Code::NotFound.as_u32(),
        message: "no such thing".to_string(),
        details: Some("detail blob".to_string()),
        trailers: metadata_of(&[("x-reply-trailer", "t")]),
        ..Default::default()
    };

    let err = client
        .unary(&Context::background(), &request, &options)
        .await
        .expect_err("unary call should fail");
    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), "no such thing");
    assert_eq!(err.details().map(|d| &d[..]), Some(&b"detail blob"[..]));
    assert_eq!(err.metadata().get("x-reply-trailer"), Some("t"));

    let trailer = trailer.get().expect("trailer metadata was not captured");
    assert_eq!(trailer.get("x-reply-trailer"), Some("t"));
}

async fn unary_metadata(client: &TestServiceClient) {
    let mut md = Metadata::new();
    md.insert("x-custom", "value");
    md.insert_bin("x-trace", vec![0u8, 1, 2, 255]);
    let ctx = Context::background().with_metadata(md);

    let header = Capture::new();
    let options = CallOptions::new()
        .with(CallOption::Header(header.clone()))
        .with(CallOption::Compressor("unsupported".to_string()));

    let response = client
        .unary(&ctx, &TestMessage::with_payload("md"), &options)
        .await
        .expect("unary call failed");
    assert_eq!(response.echo.get("x-custom").map(String::as_str), Some("value"));

    let header = header.get().expect("header metadata was not captured");
    assert_eq!(header.get_bin("x-trace-bin"), Some(&[0u8, 1, 2, 255][..]));
}

async fn unary_deadline(client: &TestServiceClient) {
    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let request = TestMessage {
        delay_ms: 2_000,
        ..Default::default()
    };

    let err = client
        .unary(&ctx, &request, &CallOptions::new())
        .await
        .expect_err("call should exceed its deadline");
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

async fn client_stream_success(client: &TestServiceClient) {
    let mut stream = client
        .client_stream(&Context::background(), &CallOptions::new())
        .await
        .expect("failed to start client stream");

    let first = TestMessage {
        payload: "a".to_string(),
        headers: metadata_of(&[("x-reply-header", "h")]),
        trailers: metadata_of(&[("x-reply-trailer", "t")]),
        ..Default::default()
    };
    stream.send(&first).await.expect("send failed");
    stream.send(&TestMessage::with_payload("b")).await.expect("send failed");
    stream.send(&TestMessage::with_payload("c")).await.expect("send failed");

    let response = stream.close_and_recv().await.expect("client stream failed");
    assert_eq!(response.payload, "abc");
    assert_eq!(response.count, 3);

    let header = stream.header().await.expect("header failed");
    assert_eq!(header.get("x-reply-header"), Some("h"));
    assert_eq!(stream.trailer().get("x-reply-trailer"), Some("t"));
}

async fn client_stream_failure(client: &TestServiceClient) {
    let mut stream = client
        .client_stream(&Context::background(), &CallOptions::new())
        .await
        .expect("failed to start client stream");

    let request = TestMessage {
        code: Code::ResourceExhausted.as_u32(),
        message: "too many".to_string(),
        ..Default::default()
    };
    stream.send(&request).await.expect("send failed");

    let err = stream
        .close_and_recv()
        .await
        .expect_err("client stream should fail");
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(err.message(), "too many");
}

async fn server_stream_success(client: &TestServiceClient) {
    let request = TestMessage {
        payload: "item".to_string(),
        count: 5,
        headers: metadata_of(&[("x-reply-header", "h")]),
        trailers: metadata_of(&[("x-reply-trailer", "t")]),
        ..Default::default()
    };
    let mut stream = client
        .server_stream(&Context::background(), &request, &CallOptions::new())
        .await
        .expect("failed to start server stream");

    let header = stream.header().await.expect("header failed");
    assert_eq!(header.get("x-reply-header"), Some("h"));

    for i in 0..5 {
        let message = stream
            .recv()
            .await
            .expect("recv failed")
            .expect("stream ended early");
        assert_eq!(message.payload, "item");
        assert_eq!(message.count, i);
    }
    assert_eq!(stream.recv().await.expect("recv failed"), None);
    assert_eq!(stream.trailer().get("x-reply-trailer"), Some("t"));
    // Completion is sticky.
    assert_eq!(stream.recv().await.expect("recv failed"), None);
}

async fn server_stream_empty(client: &TestServiceClient) {
    let mut stream = client
        .server_stream(
            &Context::background(),
            &TestMessage::default(),
            &CallOptions::new(),
        )
        .await
        .expect("failed to start server stream");

    assert_eq!(stream.recv().await.expect("recv failed"), None);
    assert!(stream.trailer().is_empty());
}

async fn server_stream_failure(client: &TestServiceClient) {
    let request = TestMessage {
        payload: "x".to_string(),
        count: 2,
        code: Code::Aborted.as_u32(),
        message: "halfway".to_string(),
        trailers: metadata_of(&[("x-reply-trailer", "t")]),
        ..Default::default()
    };
    let mut stream = client
        .server_stream(&Context::background(), &request, &CallOptions::new())
        .await
        .expect("failed to start server stream");

    for _ in 0..2 {
        assert!(stream.recv().await.expect("recv failed").is_some());
    }
    let err = stream.recv().await.expect_err("stream should fail");
    assert_eq!(err.code(), Code::Aborted);
    assert_eq!(err.message(), "halfway");
    assert_eq!(stream.trailer().get("x-reply-trailer"), Some("t"));

    let again = stream.recv().await.expect_err("failure is sticky");
    assert_eq!(again.code(), Code::Aborted);
}

async fn server_stream_cancel(client: &TestServiceClient) {
    let ctx = Context::background().child();
    let request = TestMessage {
        payload: "tick".to_string(),
        count: 1_000,
        delay_ms: 10,
        ..Default::default()
    };
    let mut stream = client
        .server_stream(&ctx, &request, &CallOptions::new())
        .await
        .expect("failed to start server stream");

    assert!(stream.recv().await.expect("recv failed").is_some());
    ctx.cancel();

    let err = stream.recv().await.expect_err("cancelled stream should fail");
    assert_eq!(err.code(), Code::Cancelled);
    let err = stream
        .send(&TestMessage::default())
        .await
        .expect_err("send after completion should fail");
    assert_eq!(err.code(), Code::FailedPrecondition);
}

async fn bidi_stream_success(client: &TestServiceClient, full_duplex: bool) {
    let mut stream = client
        .bidi_stream(&Context::background(), &CallOptions::new())
        .await
        .expect("failed to start bidi stream");

    let first = TestMessage {
        payload: "0".to_string(),
        headers: metadata_of(&[("x-reply-header", "h")]),
        trailers: metadata_of(&[("x-reply-trailer", "t")]),
        ..Default::default()
    };
    let requests = vec![
        first,
        TestMessage::with_payload("1"),
        TestMessage::with_payload("2"),
    ];

    if full_duplex {
        for (i, request) in requests.iter().enumerate() {
            stream.send(request).await.expect("send failed");
            let reply = stream
                .recv()
                .await
                .expect("recv failed")
                .expect("stream ended early");
            assert_eq!(reply.payload, request.payload);
            assert_eq!(reply.count as usize, i);
        }
        stream.close_send().await.expect("close_send failed");
    } else {
        for request in &requests {
            stream.send(request).await.expect("send failed");
        }
        stream.close_send().await.expect("close_send failed");
        for (i, request) in requests.iter().enumerate() {
            let reply = stream
                .recv()
                .await
                .expect("recv failed")
                .expect("stream ended early");
            assert_eq!(reply.payload, request.payload);
            assert_eq!(reply.count as usize, i);
        }
    }

    assert_eq!(stream.recv().await.expect("recv failed"), None);
    let header = stream.header().await.expect("header failed");
    assert_eq!(header.get("x-reply-header"), Some("h"));
    assert_eq!(stream.trailer().get("x-reply-trailer"), Some("t"));

    // close_send is idempotent, send after it is not allowed.
    stream.close_send().await.expect("second close_send failed");
    let err = stream
        .send(&TestMessage::default())
        .await
        .expect_err("send after close_send should fail");
    assert_eq!(err.code(), Code::FailedPrecondition);
}

async fn bidi_stream_failure(client: &TestServiceClient) {
    let mut stream = client
        .bidi_stream(&Context::background(), &CallOptions::new())
        .await
        .expect("failed to start bidi stream");

    let request = TestMessage {
        payload: "only".to_string(),
        code: Code::PermissionDenied.as_u32(),
        message: "nope".to_string(),
        ..Default::default()
    };
    stream.send(&request).await.expect("send failed");
    stream.close_send().await.expect("close_send failed");

    let reply = stream
        .recv()
        .await
        .expect("recv failed")
        .expect("stream ended early");
    assert_eq!(reply.payload, "only");
    let err = stream.recv().await.expect_err("stream should fail");
    assert_eq!(err.code(), Code::PermissionDenied);
}
