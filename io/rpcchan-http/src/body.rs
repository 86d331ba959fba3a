//! Streaming frame body.

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

/// Body type of every response produced by the server handler.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

/// Sending half of a [`FrameBody`].
pub type FrameSender = mpsc::Sender<Bytes>;

/// An HTTP body fed with encoded frames from a channel.
///
/// The channel holds a single frame, so a writer waits until the HTTP
/// layer took the previous one. The body ends once every sender is gone.
#[derive(Debug)]
pub struct FrameBody {
    rx: mpsc::Receiver<Bytes>,
    // Cancels the call when the HTTP layer drops the body.
    _guard: Option<DropGuard>,
}

/// Create a frame body and its sender.
///
/// If `guard` is given it is dropped together with the body.
pub fn channel(guard: Option<DropGuard>) -> (FrameSender, FrameBody) {
    let (tx, rx) = mpsc::channel(1);
    (tx, FrameBody { rx, _guard: guard })
}

impl Body for FrameBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => Poll::Ready(Some(Ok(Frame::data(data)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}
