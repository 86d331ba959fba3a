//! End-to-end tests: `HttpChannel` against `Server` over real TCP.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rpcchan::testing::{
    TestMessage, TestServer, TestServiceClient, UNARY_METHOD, register_test_service,
    run_channel_test_cases,
};
use rpcchan::{
    BearerToken, CallOption, CallOptions, Capture, Channel, Code, Context, MethodDesc,
    ServerStream, ServiceDesc, ServiceRegistry, Status, StreamDesc, UnaryCall, async_trait,
    encode_trailer, stream_handler, unary_handler,
};
use rpcchan_http::{Authenticator, BoxBody, CONTENT_TYPE, HttpChannel, Server};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

static TRACING: OnceLock<()> = OnceLock::new();

fn init_tracing() {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .init();
    });
}

/// A running server, shut down on drop.
struct TestHarness {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestHarness {
    async fn start(server: Server) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::new(server).serve(listener, shutdown.clone()));
        Self { addr, shutdown }
    }

    async fn with_test_service(base_path: &str) -> (Self, TestServer) {
        let test_server = TestServer::new();
        let mut server = Server::new().with_base_path(base_path);
        register_test_service(&mut server, Arc::new(test_server.clone()));
        (Self::start(server).await, test_server)
    }

    fn channel(&self, base_path: &str) -> Arc<dyn Channel> {
        Arc::new(HttpChannel::new(format!("http://{}{}", self.addr, base_path)).unwrap())
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve every request with a canned response.
async fn fixed_response_server(
    respond: fn() -> Response<BoxBody>,
) -> (SocketAddr, CancellationToken) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted.unwrap(),
            };
            tokio::spawn(async move {
                let service = service_fn(move |request: Request<Incoming>| async move {
                    // Drain the request before answering.
                    let _ = request.into_body().collect().await;
                    Ok::<_, Infallible>(respond())
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, shutdown)
}

fn invoke_raw(
    channel: &Arc<dyn Channel>,
    method: &str,
    request: Bytes,
) -> impl Future<Output = Result<Bytes, Status>> {
    let channel = channel.clone();
    let method = method.to_string();
    async move {
        channel
            .invoke(&Context::background(), &method, request, &CallOptions::new())
            .await
    }
}

#[tokio::test]
async fn test_conformance_at_root() {
    let (harness, _) = TestHarness::with_test_service("/").await;
    run_channel_test_cases(harness.channel("/"), false).await;
}

#[tokio::test]
async fn test_conformance_under_base_path() {
    let (harness, _) = TestHarness::with_test_service("/foo/").await;
    run_channel_test_cases(harness.channel("/foo/"), false).await;
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let (harness, _) = TestHarness::with_test_service("/").await;
    let channel = harness.channel("/");

    let err = invoke_raw(&channel, "/rpcchan.testing.TestService/Missing", Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);

    let err = invoke_raw(&channel, "/no.Such/Service", Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}

#[tokio::test]
async fn test_wrong_base_path_is_unimplemented() {
    let (harness, _) = TestHarness::with_test_service("/foo/").await;
    let client = TestServiceClient::new(harness.channel("/bar/"));

    let err = client
        .unary(
            &Context::background(),
            &TestMessage::with_payload("x"),
            &CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
    assert!(err.message().contains("404"), "{}", err);
}

struct Counter {
    calls: AtomicUsize,
}

fn counter_service() -> ServiceDesc {
    ServiceDesc::new("test.Counter").method(MethodDesc::unary(
        "Count",
        unary_handler(|svc: Arc<Counter>, _call: UnaryCall, request: Bytes| async move {
            svc.calls.fetch_add(1, Ordering::SeqCst);
            Ok(request)
        }),
    ))
}

#[tokio::test]
async fn test_request_size_boundary() {
    let counter = Arc::new(Counter {
        calls: AtomicUsize::new(0),
    });
    let mut server = Server::new().with_max_recv_message_size(1024);
    server.register_service(counter_service(), counter.clone());
    let harness = TestHarness::start(server).await;
    let channel = harness.channel("/");

    let response = invoke_raw(&channel, "/test.Counter/Count", Bytes::from(vec![7u8; 1024]))
        .await
        .unwrap();
    assert_eq!(response.len(), 1024);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

    let err = invoke_raw(&channel, "/test.Counter/Count", Bytes::from(vec![7u8; 1025]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_client_size_limits() {
    let mut server = Server::new();
    server.register_service(
        counter_service(),
        Arc::new(Counter {
            calls: AtomicUsize::new(0),
        }),
    );
    let harness = TestHarness::start(server).await;
    let channel = harness.channel("/");

    let options = CallOptions::new().with(CallOption::MaxSendMessageSize(8));
    let err = channel
        .invoke(
            &Context::background(),
            "/test.Counter/Count",
            Bytes::from_static(b"123456789"),
            &options,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);

    let options = CallOptions::new().with(CallOption::MaxRecvMessageSize(4));
    let err = channel
        .invoke(
            &Context::background(),
            "/test.Counter/Count",
            Bytes::from_static(b"12345"),
            &options,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
}

/// Client-streaming methods that answer without reading the request.
struct Gate;

fn gate_service() -> ServiceDesc {
    ServiceDesc::new("test.Gate")
        .method(MethodDesc::streaming(
            "Reject",
            true,
            false,
            stream_handler(|_svc: Arc<Gate>, _stream: Box<dyn ServerStream>| async move {
                Err(Status::invalid_argument("rejected early"))
            }),
        ))
        .method(MethodDesc::streaming(
            "Accept",
            true,
            false,
            stream_handler(|_svc: Arc<Gate>, mut stream: Box<dyn ServerStream>| async move {
                stream.send(Bytes::from_static(b"done")).await
            }),
        ))
}

/// Send 64 KiB messages until one fails or `count` went through.
async fn upload(stream: &mut dyn rpcchan::ClientStream, count: usize) -> Option<Status> {
    let chunk = Bytes::from(vec![0u8; 64 * 1024]);
    for _ in 0..count {
        if let Err(status) = stream.send(chunk.clone()).await {
            return Some(status);
        }
    }
    None
}

async fn gate_stream(channel: &Arc<dyn Channel>, method: &str) -> Box<dyn rpcchan::ClientStream> {
    let name = method.rsplit('/').next().unwrap();
    channel
        .new_stream(
            &Context::background(),
            &StreamDesc::new(name, true, false),
            method,
            &CallOptions::new(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_early_rejection_surfaces_on_send() {
    let mut server = Server::new();
    server.register_service(gate_service(), Arc::new(Gate));
    let harness = TestHarness::start(server).await;
    let channel = harness.channel("/");

    let mut stream = gate_stream(&channel, "/test.Gate/Reject").await;
    if let Some(err) = upload(&mut *stream, 200).await {
        assert_eq!(err.code(), Code::InvalidArgument, "{}", err);
        assert_eq!(err.message(), "rejected early");
    }
    stream.close_send().await.unwrap();

    let err = stream.recv().await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "rejected early");
}

#[tokio::test]
async fn test_early_success_points_to_recv() {
    let mut server = Server::new();
    server.register_service(gate_service(), Arc::new(Gate));
    let harness = TestHarness::start(server).await;
    let channel = harness.channel("/");

    let mut stream = gate_stream(&channel, "/test.Gate/Accept").await;
    if let Some(err) = upload(&mut *stream, 200).await {
        assert_eq!(err.code(), Code::FailedPrecondition, "{}", err);
    }
    stream.close_send().await.unwrap();

    assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"done")));
    assert_eq!(stream.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_cancellation_reaches_handler() {
    let (harness, test_server) = TestHarness::with_test_service("/").await;
    let client = TestServiceClient::new(harness.channel("/"));

    let ctx = Context::background().child();
    let request = TestMessage {
        payload: "tick".to_string(),
        count: 10_000,
        delay_ms: 20,
        ..Default::default()
    };
    let mut stream = client
        .server_stream(&ctx, &request, &CallOptions::new())
        .await
        .unwrap();
    assert!(stream.recv().await.unwrap().is_some());

    ctx.cancel();
    assert_eq!(stream.recv().await.unwrap_err().code(), Code::Cancelled);
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while test_server.cancelled_count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never observed the cancellation"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_custom_error_renderer() {
    let server = Server::new()
        .with_base_path("/rpc/")
        .with_error_renderer(|_, status| {
            let mut response =
                Response::new(Full::new(Bytes::from(status.message().to_string())).boxed());
            *response.status_mut() = StatusCode::FORBIDDEN;
            response
        });
    let harness = TestHarness::start(server).await;

    let err = invoke_raw(&harness.channel("/elsewhere/"), "/a.B/C", Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);
}

#[tokio::test]
async fn test_non_200_status_mapping() {
    let (addr, shutdown) = fixed_response_server(|| {
        let mut response = Response::new(Full::new(Bytes::from_static(b"busy")).boxed());
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response
    })
    .await;

    let channel: Arc<dyn Channel> = Arc::new(HttpChannel::new(format!("http://{}", addr)).unwrap());
    let err = invoke_raw(&channel, UNARY_METHOD, Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    shutdown.cancel();
}

#[tokio::test]
async fn test_wrong_response_content_type() {
    let (addr, shutdown) = fixed_response_server(|| {
        let mut response = Response::new(Full::new(Bytes::from_static(b"{}")).boxed());
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        response
    })
    .await;

    let channel: Arc<dyn Channel> = Arc::new(HttpChannel::new(format!("http://{}", addr)).unwrap());
    let err = invoke_raw(&channel, UNARY_METHOD, Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    shutdown.cancel();
}

#[tokio::test]
async fn test_response_without_trailer() {
    let (addr, shutdown) = fixed_response_server(|| {
        let mut response = Response::new(Full::new(Bytes::new()).boxed());
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(CONTENT_TYPE),
        );
        response
    })
    .await;

    let channel: Arc<dyn Channel> = Arc::new(HttpChannel::new(format!("http://{}", addr)).unwrap());
    let err = invoke_raw(&channel, UNARY_METHOD, Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unknown);
    shutdown.cancel();
}

#[tokio::test]
async fn test_ok_trailer_without_message() {
    let (addr, shutdown) = fixed_response_server(|| {
        let trailer = encode_trailer(&Status::ok()).unwrap();
        let mut response = Response::new(Full::new(trailer).boxed());
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(CONTENT_TYPE),
        );
        response
    })
    .await;

    let channel: Arc<dyn Channel> = Arc::new(HttpChannel::new(format!("http://{}", addr)).unwrap());
    let err = invoke_raw(&channel, UNARY_METHOD, Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    shutdown.cancel();
}

#[tokio::test]
async fn test_pre_dispatch_http_statuses() {
    let (harness, _) = TestHarness::with_test_service("/").await;
    let client = hyper_util::client::legacy::Client::builder(
        hyper_util::rt::TokioExecutor::new(),
    )
    .build_http::<Full<Bytes>>();
    let url = format!("http://{}{}", harness.addr, UNARY_METHOD);

    let get = Request::get(&url).body(Full::new(Bytes::new())).unwrap();
    assert_eq!(
        client.request(get).await.unwrap().status(),
        StatusCode::METHOD_NOT_ALLOWED
    );

    let json = Request::post(&url)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();
    assert_eq!(
        client.request(json).await.unwrap().status(),
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    );
}

struct RequireToken(&'static str);

#[async_trait]
impl Authenticator for RequireToken {
    async fn authenticate(&self, ctx: &Context, _method: &str) -> Result<(), Status> {
        let expected = format!("Bearer {}", self.0);
        match ctx.metadata().get("authorization") {
            Some(value) if value == expected => Ok(()),
            Some(_) => Err(Status::permission_denied("wrong token")),
            None => Err(Status::unauthenticated("missing token")),
        }
    }
}

async fn authenticated_harness() -> TestHarness {
    let mut server = Server::new().with_authenticator(Arc::new(RequireToken("secret")));
    register_test_service(&mut server, Arc::new(TestServer::new()));
    TestHarness::start(server).await
}

#[tokio::test]
async fn test_authenticator_rejects() {
    let harness = authenticated_harness().await;
    let client = TestServiceClient::new(harness.channel("/"));

    let err = client
        .unary(
            &Context::background(),
            &TestMessage::with_payload("x"),
            &CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
    assert_eq!(err.message(), "missing token");
}

#[tokio::test]
async fn test_bearer_credentials() {
    let harness = authenticated_harness().await;
    let client = TestServiceClient::new(harness.channel("/"));

    let options = CallOptions::new().with(CallOption::PerRpcCredentials(Arc::new(
        BearerToken::new("secret").allow_insecure(),
    )));
    let response = client
        .unary(&Context::background(), &TestMessage::with_payload("x"), &options)
        .await
        .unwrap();
    assert_eq!(response.payload, "x");

    let options = CallOptions::new().with(CallOption::PerRpcCredentials(Arc::new(
        BearerToken::new("guess").allow_insecure(),
    )));
    let err = client
        .unary(&Context::background(), &TestMessage::with_payload("x"), &options)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    // Credentials that need transport security are never sent over http.
    let options = CallOptions::new().with(CallOption::PerRpcCredentials(Arc::new(
        BearerToken::new("secret"),
    )));
    let err = client
        .unary(&Context::background(), &TestMessage::with_payload("x"), &options)
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn test_peer_capture() {
    let (harness, _) = TestHarness::with_test_service("/").await;
    let client = TestServiceClient::new(harness.channel("/"));

    let peer = Capture::new();
    let options = CallOptions::new().with(CallOption::Peer(peer.clone()));
    client
        .unary(&Context::background(), &TestMessage::with_payload("x"), &options)
        .await
        .unwrap();
    assert_eq!(peer.get(), Some(harness.addr));
}

#[tokio::test]
async fn test_request_metadata_reaches_server() {
    let (harness, _) = TestHarness::with_test_service("/").await;
    let client = TestServiceClient::new(harness.channel("/"));

    let mut md = rpcchan::Metadata::new();
    md.insert("x-request-id", "abc123");
    let ctx = Context::background().with_metadata(md);
    let response = client
        .unary(&ctx, &TestMessage::with_payload("x"), &CallOptions::new())
        .await
        .unwrap();
    assert_eq!(
        response.echo.get("x-request-id").map(String::as_str),
        Some("abc123")
    );
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let (harness, _) = TestHarness::with_test_service("/").await;
    let addr = harness.addr;
    drop(harness);

    // Give the accept loop a moment to observe the shutdown.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fresh: Arc<dyn Channel> = Arc::new(HttpChannel::new(format!("http://{}", addr)).unwrap());
    let err = invoke_raw(&fresh, UNARY_METHOD, Bytes::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}
