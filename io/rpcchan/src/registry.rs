//! Server-side service registry abstraction.
//!
//! Generated registrar code describes a service with a [`ServiceDesc`] and
//! hands it, together with the application's implementation, to any
//! [`ServiceRegistry`]. Transports look up the method and call its
//! handler with a transport-specific call object.

use crate::context::Context;
use crate::metadata::Metadata;
use crate::status::Status;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Type-erased service implementation. Handlers downcast it back.
pub type Implementation = Arc<dyn Any + Send + Sync>;

/// Handler for a unary method: request message in, response message out.
pub type UnaryHandler = Arc<
    dyn Fn(Implementation, UnaryCall, Bytes) -> BoxFuture<'static, Result<Bytes, Status>>
        + Send
        + Sync,
>;

/// Handler for a streaming method.
pub type StreamHandler = Arc<
    dyn Fn(Implementation, Box<dyn ServerStream>) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// How a method is invoked.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(UnaryHandler),
    Streaming {
        client_streaming: bool,
        server_streaming: bool,
        handler: StreamHandler,
    },
}

/// Description of a single method.
#[derive(Clone)]
pub struct MethodDesc {
    pub name: String,
    pub handler: MethodHandler,
}

impl MethodDesc {
    pub fn unary(name: impl Into<String>, handler: UnaryHandler) -> Self {
        Self {
            name: name.into(),
            handler: MethodHandler::Unary(handler),
        }
    }

    pub fn streaming(
        name: impl Into<String>,
        client_streaming: bool,
        server_streaming: bool,
        handler: StreamHandler,
    ) -> Self {
        Self {
            name: name.into(),
            handler: MethodHandler::Streaming {
                client_streaming,
                server_streaming,
                handler,
            },
        }
    }

    pub fn client_streaming(&self) -> bool {
        matches!(
            self.handler,
            MethodHandler::Streaming {
                client_streaming: true,
                ..
            }
        )
    }

    pub fn server_streaming(&self) -> bool {
        matches!(
            self.handler,
            MethodHandler::Streaming {
                server_streaming: true,
                ..
            }
        )
    }

    pub fn is_unary(&self) -> bool {
        matches!(self.handler, MethodHandler::Unary(_))
    }
}

impl fmt::Debug for MethodDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDesc")
            .field("name", &self.name)
            .field("client_streaming", &self.client_streaming())
            .field("server_streaming", &self.server_streaming())
            .finish()
    }
}

/// Description of a service: its fully qualified name and methods.
#[derive(Debug, Clone)]
pub struct ServiceDesc {
    pub name: String,
    pub methods: Vec<MethodDesc>,
}

impl ServiceDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method.
    pub fn method(mut self, method: MethodDesc) -> Self {
        self.methods.push(method);
        self
    }

    /// Find a method by name.
    pub fn find_method(&self, name: &str) -> Option<&MethodDesc> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Something services can be registered with.
pub trait ServiceRegistry {
    /// Register a service implementation.
    ///
    /// Called at startup, before any dispatch.
    fn register_service(&mut self, desc: ServiceDesc, implementation: Implementation);
}

/// Server half of a streaming call.
#[async_trait]
pub trait ServerStream: Send {
    /// The call context: incoming metadata, deadline, peer.
    fn context(&self) -> &Context;

    /// Add header metadata to be sent with the response headers.
    ///
    /// Fails once the headers were sent.
    fn set_header(&mut self, metadata: Metadata) -> Result<(), Status>;

    /// Send the response headers now, including `metadata`.
    ///
    /// Fails if the headers were already sent.
    fn send_header(&mut self, metadata: Metadata) -> Result<(), Status>;

    /// Add trailer metadata. Accumulates across calls.
    fn set_trailer(&mut self, metadata: Metadata);

    /// Send one response message. Headers are sent first if needed.
    async fn send(&mut self, message: Bytes) -> Result<(), Status>;

    /// Receive the next request message. `Ok(None)` once the client
    /// half-closed.
    async fn recv(&mut self) -> Result<Option<Bytes>, Status>;
}

/// Response header and trailer metadata of one server call.
///
/// Headers are delivered once, through the receiver returned by
/// [`ResponseMetadata::new`], either explicitly or implicitly via
/// [`ResponseMetadata::flush_header`].
#[derive(Clone)]
pub struct ResponseMetadata {
    state: Arc<Mutex<ResponseState>>,
}

struct ResponseState {
    header: Metadata,
    sender: Option<oneshot::Sender<Metadata>>,
    trailer: Metadata,
}

impl ResponseMetadata {
    pub fn new() -> (Self, oneshot::Receiver<Metadata>) {
        let (tx, rx) = oneshot::channel();
        let state = ResponseState {
            header: Metadata::new(),
            sender: Some(tx),
            trailer: Metadata::new(),
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            rx,
        )
    }

    pub fn set_header(&self, metadata: Metadata) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.sender.is_none() {
            return Err(Status::failed_precondition("headers already sent"));
        }
        state.header.extend(metadata);
        Ok(())
    }

    pub fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        let mut state = self.state.lock();
        let Some(sender) = state.sender.take() else {
            return Err(Status::failed_precondition("headers already sent"));
        };
        state.header.extend(metadata);
        // The receiver is gone only when the call itself is gone.
        let _ = sender.send(state.header.clone());
        Ok(())
    }

    /// Send the headers unless that already happened.
    pub fn flush_header(&self) {
        let mut state = self.state.lock();
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(state.header.clone());
        }
    }

    pub fn header_sent(&self) -> bool {
        self.state.lock().sender.is_none()
    }

    pub fn set_trailer(&self, metadata: Metadata) {
        self.state.lock().trailer.extend(metadata);
    }

    /// Take the accumulated trailer metadata.
    pub fn take_trailer(&self) -> Metadata {
        std::mem::take(&mut self.state.lock().trailer)
    }
}

/// Server-side handle of a unary call.
///
/// Cloning shares the underlying response metadata.
#[derive(Clone)]
pub struct UnaryCall {
    ctx: Context,
    response: ResponseMetadata,
}

impl UnaryCall {
    pub fn new(ctx: Context, response: ResponseMetadata) -> Self {
        Self { ctx, response }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Add header metadata. Fails once the headers were sent.
    pub fn set_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.response.set_header(metadata)
    }

    /// Send the headers now, ahead of the response message.
    pub fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.response.send_header(metadata)
    }

    /// Add trailer metadata.
    pub fn set_trailer(&self, metadata: Metadata) {
        self.response.set_trailer(metadata)
    }
}

/// Build a unary handler for an implementation of type `T`.
///
/// The handler fails with INTERNAL if the registered implementation is not
/// a `T`.
pub fn unary_handler<T, F, Fut>(f: F) -> UnaryHandler
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, UnaryCall, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    Arc::new(
        move |implementation: Implementation, call: UnaryCall, request: Bytes| {
            match implementation.downcast::<T>() {
                Ok(service) => f(service, call, request).boxed(),
                Err(_) => wrong_type().boxed(),
            }
        },
    )
}

/// Build a streaming handler for an implementation of type `T`.
pub fn stream_handler<T, F, Fut>(f: F) -> StreamHandler
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>, Box<dyn ServerStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(
        move |implementation: Implementation, stream: Box<dyn ServerStream>| {
            match implementation.downcast::<T>() {
                Ok(service) => f(service, stream).boxed(),
                Err(_) => wrong_type().boxed(),
            }
        },
    )
}

async fn wrong_type<R>() -> Result<R, Status> {
    Err(Status::internal("service implementation has wrong type"))
}

/// A registered service.
#[derive(Clone)]
pub struct RegisteredService {
    pub desc: ServiceDesc,
    pub implementation: Implementation,
}

/// In-memory registry of services, usable by any server transport.
#[derive(Clone, Default)]
pub struct HandlerMap {
    services: BTreeMap<String, RegisteredService>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a method by service and method name.
    pub fn lookup(&self, service: &str, method: &str) -> Option<(&MethodDesc, &Implementation)> {
        let registered = self.services.get(service)?;
        let method = registered.desc.find_method(method)?;
        Some((method, &registered.implementation))
    }

    /// Find a service by its fully qualified name.
    pub fn query_service(&self, name: &str) -> Option<&RegisteredService> {
        self.services.get(name)
    }

    /// Names of all registered services, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    /// Visit every registered service.
    ///
    /// Used to copy registrations into another registry.
    pub fn for_each_service(&self, mut f: impl FnMut(&ServiceDesc, &Implementation)) {
        for registered in self.services.values() {
            f(&registered.desc, &registered.implementation);
        }
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl ServiceRegistry for HandlerMap {
    fn register_service(&mut self, desc: ServiceDesc, implementation: Implementation) {
        if self.services.contains_key(&desc.name) {
            warn!(service = %desc.name, "service already registered, ignoring");
            return;
        }

        debug!(service = %desc.name, methods = desc.methods.len(), "registered service");
        self.services.insert(
            desc.name.clone(),
            RegisteredService {
                desc,
                implementation,
            },
        );
    }
}
