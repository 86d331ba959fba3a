//! Client-side channel abstraction.
//!
//! Generated client stubs call through [`Channel`] only, so the same stub
//! works over any transport that implements it.

use crate::context::Context;
use crate::metadata::Metadata;
use crate::options::CallOptions;
use crate::status::Status;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Shape of a streaming method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDesc {
    /// Method name without the service prefix.
    pub name: String,
    /// The client sends a stream of messages.
    pub client_streams: bool,
    /// The server sends a stream of messages.
    pub server_streams: bool,
}

impl StreamDesc {
    pub fn new(name: impl Into<String>, client_streams: bool, server_streams: bool) -> Self {
        Self {
            name: name.into(),
            client_streams,
            server_streams,
        }
    }
}

/// A transport that can carry RPCs.
///
/// `method` is the fully qualified method name, `/service/method`.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Perform a unary call.
    ///
    /// Returns the single response message, or the terminal status when it
    /// is not OK.
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> Result<Bytes, Status>;

    /// Start a streaming call.
    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
    ) -> Result<Box<dyn ClientStream>, Status>;
}

/// Client half of a streaming call.
#[async_trait]
pub trait ClientStream: Send {
    /// Wait for the response header metadata.
    async fn header(&mut self) -> Result<Metadata, Status>;

    /// Trailer metadata. Empty until the call completed.
    fn trailer(&self) -> Metadata;

    /// Send one request message.
    async fn send(&mut self, message: Bytes) -> Result<(), Status>;

    /// Half-close the request direction. Idempotent.
    async fn close_send(&mut self) -> Result<(), Status>;

    /// Receive the next response message.
    ///
    /// Returns `Ok(None)` on clean completion and `Err` with the terminal
    /// status otherwise. Once the call completed every further call
    /// returns the same outcome.
    async fn recv(&mut self) -> Result<Option<Bytes>, Status>;

    /// The context of this call.
    fn context(&self) -> &Context;
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Arc<C> {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> Result<Bytes, Status> {
        (**self).invoke(ctx, method, request, options).await
    }

    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
    ) -> Result<Box<dyn ClientStream>, Status> {
        (**self).new_stream(ctx, desc, method, options).await
    }
}

/// Split `/service/method` (leading slash optional) into its parts.
pub fn split_method_name(method: &str) -> Option<(&str, &str)> {
    let trimmed = method.strip_prefix('/').unwrap_or(method);
    let (service, name) = trimmed.split_once('/')?;
    if service.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    Some((service, name))
}

/// Intercepts calls made through an [`InterceptedChannel`].
///
/// `next` is the rest of the chain; an interceptor that does not call it
/// short-circuits the call. Both methods pass straight through by default.
#[async_trait]
pub trait ClientInterceptor: Send + Sync {
    async fn intercept_unary(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
        next: &dyn Channel,
    ) -> Result<Bytes, Status> {
        next.invoke(ctx, method, request, options).await
    }

    async fn intercept_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
        next: &dyn Channel,
    ) -> Result<Box<dyn ClientStream>, Status> {
        next.new_stream(ctx, desc, method, options).await
    }
}

/// A channel wrapped in an ordered list of interceptors.
///
/// The first interceptor is the outermost: it sees the call first and the
/// result last.
#[derive(Clone)]
pub struct InterceptedChannel {
    channel: Arc<dyn Channel>,
    interceptors: Arc<[Arc<dyn ClientInterceptor>]>,
}

impl InterceptedChannel {
    pub fn new(channel: Arc<dyn Channel>, interceptors: Vec<Arc<dyn ClientInterceptor>>) -> Self {
        Self {
            channel,
            interceptors: interceptors.into(),
        }
    }

    fn chain(&self) -> Chain<'_> {
        Chain {
            interceptors: &self.interceptors,
            channel: self.channel.as_ref(),
        }
    }
}

#[async_trait]
impl Channel for InterceptedChannel {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> Result<Bytes, Status> {
        self.chain().invoke(ctx, method, request, options).await
    }

    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
    ) -> Result<Box<dyn ClientStream>, Status> {
        self.chain().new_stream(ctx, desc, method, options).await
    }
}

/// The remaining interceptors in front of the wrapped channel.
struct Chain<'a> {
    interceptors: &'a [Arc<dyn ClientInterceptor>],
    channel: &'a dyn Channel,
}

#[async_trait]
impl<'a> Channel for Chain<'a> {
    async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> Result<Bytes, Status> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = Chain {
                    interceptors: rest,
                    channel: self.channel,
                };
                first.intercept_unary(ctx, method, request, options, &next).await
            }
            None => self.channel.invoke(ctx, method, request, options).await,
        }
    }

    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
    ) -> Result<Box<dyn ClientStream>, Status> {
        match self.interceptors.split_first() {
            Some((first, rest)) => {
                let next = Chain {
                    interceptors: rest,
                    channel: self.channel,
                };
                first.intercept_stream(ctx, desc, method, options, &next).await
            }
            None => self.channel.new_stream(ctx, desc, method, options).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::CallOption;
    use parking_lot::Mutex;

    /// Echoes the request and records the metadata it saw.
    struct EchoChannel {
        seen: Mutex<Vec<Metadata>>,
    }

    #[async_trait]
    impl Channel for EchoChannel {
        async fn invoke(
            &self,
            ctx: &Context,
            _method: &str,
            request: Bytes,
            _options: &CallOptions,
        ) -> Result<Bytes, Status> {
            self.seen.lock().push(ctx.metadata().clone());
            Ok(request)
        }

        async fn new_stream(
            &self,
            _ctx: &Context,
            _desc: &StreamDesc,
            method: &str,
            _options: &CallOptions,
        ) -> Result<Box<dyn ClientStream>, Status> {
            Err(Status::unimplemented(method.to_string()))
        }
    }

    /// Appends its tag to the `trace` metadata and the request payload.
    struct Tagger(&'static str);

    #[async_trait]
    impl ClientInterceptor for Tagger {
        async fn intercept_unary(
            &self,
            ctx: &Context,
            method: &str,
            request: Bytes,
            options: &CallOptions,
            next: &dyn Channel,
        ) -> Result<Bytes, Status> {
            let mut md = Metadata::new();
            md.insert("trace", self.0);
            let ctx = ctx.append_metadata(md);
            let response = next.invoke(&ctx, method, request, options).await?;

            let mut tagged = response.to_vec();
            tagged.extend_from_slice(self.0.as_bytes());
            Ok(Bytes::from(tagged))
        }
    }

    struct Deny;

    #[async_trait]
    impl ClientInterceptor for Deny {
        async fn intercept_unary(
            &self,
            _ctx: &Context,
            _method: &str,
            _request: Bytes,
            _options: &CallOptions,
            _next: &dyn Channel,
        ) -> Result<Bytes, Status> {
            Err(Status::permission_denied("denied"))
        }
    }

    #[test]
    fn test_split_method_name() {
        assert_eq!(split_method_name("/svc.Test/Unary"), Some(("svc.Test", "Unary")));
        assert_eq!(split_method_name("svc.Test/Unary"), Some(("svc.Test", "Unary")));
        assert_eq!(split_method_name("/svc.Test"), None);
        assert_eq!(split_method_name("//Unary"), None);
        assert_eq!(split_method_name("/a/b/c"), None);
        assert_eq!(split_method_name("/svc/"), None);
    }

    #[test]
    fn test_stream_desc() {
        let desc = StreamDesc::new("Bidi", true, true);
        assert_eq!(desc.name, "Bidi");
        assert!(desc.client_streams && desc.server_streams);
    }

    #[tokio::test]
    async fn test_interceptor_order() {
        let echo = Arc::new(EchoChannel {
            seen: Mutex::new(Vec::new()),
        });
        let channel = InterceptedChannel::new(
            echo.clone(),
            vec![Arc::new(Tagger("a")), Arc::new(Tagger("b"))],
        );

        let response = channel
            .invoke(
                &Context::background(),
                "/svc/M",
                Bytes::from_static(b">"),
                &CallOptions::new(),
            )
            .await
            .unwrap();

        // The outermost interceptor sees the response last.
        assert_eq!(&response[..], b">ba");
        // And it adds its metadata first.
        let seen = echo.seen.lock();
        assert_eq!(seen[0].get_all("trace"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_interceptor_short_circuit() {
        let echo = Arc::new(EchoChannel {
            seen: Mutex::new(Vec::new()),
        });
        let channel = InterceptedChannel::new(echo.clone(), vec![Arc::new(Deny)]);

        let err = channel
            .invoke(
                &Context::background(),
                "/svc/M",
                Bytes::new(),
                &CallOptions::new().with(CallOption::WaitForReady(true)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), crate::status::Code::PermissionDenied);
        assert!(echo.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_default_stream_interception_passes_through() {
        let echo = Arc::new(EchoChannel {
            seen: Mutex::new(Vec::new()),
        });
        let channel = InterceptedChannel::new(echo, vec![Arc::new(Tagger("a"))]);

        let result = channel
            .new_stream(
                &Context::background(),
                &StreamDesc::new("S", false, true),
                "/svc/S",
                &CallOptions::new(),
            )
            .await;

        match result {
            Err(status) => assert_eq!(status.message(), "/svc/S"),
            Ok(_) => panic!("expected the wrapped channel's error"),
        }
    }
}
