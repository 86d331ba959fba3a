//! Per-call context: cancellation, deadline, metadata and peer.

use crate::metadata::Metadata;
use crate::status::Status;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Call-scoped context.
///
/// Cloning is cheap and clones share the same cancellation token. On the
/// client the metadata is the outgoing request metadata; on the server it
/// is the incoming request metadata and `peer` is the remote address.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    metadata: Arc<Metadata>,
    peer: Option<SocketAddr>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A root context with no deadline and no metadata.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            metadata: Arc::new(Metadata::new()),
            peer: None,
        }
    }

    /// Derive a child context.
    ///
    /// The child is cancelled when this context is cancelled, but
    /// cancelling the child does not affect the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
            peer: self.peer,
        }
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`.
    ///
    /// A deadline can only be shortened; a later deadline than the current
    /// one is ignored.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        ctx
    }

    /// Derive a child context carrying `metadata`.
    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        let mut ctx = self.child();
        ctx.metadata = Arc::new(metadata);
        ctx
    }

    /// Derive a child context with metadata merged on top of the current.
    pub fn append_metadata(&self, metadata: Metadata) -> Self {
        let mut merged = (*self.metadata).clone();
        merged.extend(metadata);
        self.with_metadata(merged)
    }

    /// Derive a child context recording the remote peer.
    pub fn with_peer(&self, peer: SocketAddr) -> Self {
        let mut ctx = self.child();
        ctx.peer = Some(peer);
        ctx
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if this context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if any. Zero once it passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Get the metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Get the remote peer (server side).
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Check whether the context is done, without waiting.
    pub fn err(&self) -> Option<Status> {
        if self.token.is_cancelled() {
            return Some(Status::cancelled("context cancelled"));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Status::deadline_exceeded("context deadline exceeded"))
            }
            _ => None,
        }
    }

    /// Wait until the context is cancelled or its deadline passes.
    ///
    /// Resolves with CANCELLED or DEADLINE_EXCEEDED respectively.
    pub async fn done(&self) -> Status {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => Status::cancelled("context cancelled"),
                    _ = tokio::time::sleep_until(deadline) => {
                        Status::deadline_exceeded("context deadline exceeded")
                    }
                }
            }
            None => {
                self.token.cancelled().await;
                Status::cancelled("context cancelled")
            }
        }
    }
}
