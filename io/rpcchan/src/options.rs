//! Call options.
//!
//! Options are typed directives attached to a single call. A transport
//! applies them through [`CallOptionVisitor`], handling the directives it
//! understands; everything else reaches [`CallOptionVisitor::unrecognized`]
//! and is ignored by default.

use crate::credentials::PerRpcCredentials;
use crate::metadata::Metadata;

use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A slot that a transport fills in during a call.
///
/// Clones share the slot, so the caller keeps one clone and hands the
/// other to the call.
#[derive(Debug)]
pub struct Capture<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Capture<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for Capture<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone> Capture<T> {
    /// Create an empty capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous one.
    pub fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    /// Get a copy of the captured value.
    pub fn get(&self) -> Option<T> {
        self.slot.lock().clone()
    }

    /// Check if a value was captured.
    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// A single call directive.
#[derive(Clone)]
pub enum CallOption {
    /// Capture the response header metadata.
    Header(Capture<Metadata>),
    /// Capture the response trailer metadata.
    Trailer(Capture<Metadata>),
    /// Capture the address of the server.
    Peer(Capture<SocketAddr>),
    /// Attach credentials to the call.
    PerRpcCredentials(Arc<dyn PerRpcCredentials>),
    /// Largest message the client accepts, in bytes.
    MaxRecvMessageSize(usize),
    /// Largest message the client sends, in bytes.
    MaxSendMessageSize(usize),
    /// Compressor name. Meaningful only to other transports.
    Compressor(String),
    /// Wait-for-ready behavior. Meaningful only to other transports.
    WaitForReady(bool),
    /// Content subtype. Meaningful only to other transports.
    ContentSubtype(String),
}

impl CallOption {
    /// Dispatch this option to the matching visitor method.
    pub fn accept(&self, visitor: &mut dyn CallOptionVisitor) {
        match self {
            CallOption::Header(capture) => visitor.header(capture),
            CallOption::Trailer(capture) => visitor.trailer(capture),
            CallOption::Peer(capture) => visitor.peer(capture),
            CallOption::PerRpcCredentials(creds) => visitor.per_rpc_credentials(creds),
            CallOption::MaxRecvMessageSize(size) => visitor.max_recv_message_size(*size),
            CallOption::MaxSendMessageSize(size) => visitor.max_send_message_size(*size),
            other => visitor.unrecognized(other),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CallOption::Header(_) => "Header",
            CallOption::Trailer(_) => "Trailer",
            CallOption::Peer(_) => "Peer",
            CallOption::PerRpcCredentials(_) => "PerRpcCredentials",
            CallOption::MaxRecvMessageSize(_) => "MaxRecvMessageSize",
            CallOption::MaxSendMessageSize(_) => "MaxSendMessageSize",
            CallOption::Compressor(_) => "Compressor",
            CallOption::WaitForReady(_) => "WaitForReady",
            CallOption::ContentSubtype(_) => "ContentSubtype",
        }
    }
}

impl fmt::Debug for CallOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallOption::MaxRecvMessageSize(size) | CallOption::MaxSendMessageSize(size) => {
                write!(f, "{}({})", self.name(), size)
            }
            CallOption::Compressor(name) | CallOption::ContentSubtype(name) => {
                write!(f, "{}({:?})", self.name(), name)
            }
            CallOption::WaitForReady(wait) => write!(f, "WaitForReady({})", wait),
            _ => f.write_str(self.name()),
        }
    }
}

/// Receives call options by kind. Every method defaults to a no-op.
pub trait CallOptionVisitor {
    fn header(&mut self, _capture: &Capture<Metadata>) {}

    fn trailer(&mut self, _capture: &Capture<Metadata>) {}

    fn peer(&mut self, _capture: &Capture<SocketAddr>) {}

    fn per_rpc_credentials(&mut self, _creds: &Arc<dyn PerRpcCredentials>) {}

    fn max_recv_message_size(&mut self, _size: usize) {}

    fn max_send_message_size(&mut self, _size: usize) {}

    /// Called for directives the transport does not handle.
    fn unrecognized(&mut self, _option: &CallOption) {}
}

/// Ordered, immutable set of call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    options: Arc<[CallOption]>,
}

impl CallOptions {
    /// No options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new set with `option` appended.
    pub fn with(&self, option: CallOption) -> Self {
        let mut options = self.options.to_vec();
        options.push(option);
        Self {
            options: options.into(),
        }
    }

    /// Return a new set with all of `other` appended.
    pub fn merge(&self, other: &CallOptions) -> Self {
        let mut options = self.options.to_vec();
        options.extend(other.options.iter().cloned());
        Self {
            options: options.into(),
        }
    }

    /// Apply every option, in order, to `visitor`.
    pub fn visit(&self, visitor: &mut dyn CallOptionVisitor) {
        for option in self.options.iter() {
            option.accept(visitor);
        }
    }

    /// Iterate over the options.
    pub fn iter(&self) -> impl Iterator<Item = &CallOption> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl FromIterator<CallOption> for CallOptions {
    fn from_iter<T: IntoIterator<Item = CallOption>>(iter: T) -> Self {
        Self {
            options: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<CallOption>> for CallOptions {
    fn from(options: Vec<CallOption>) -> Self {
        Self {
            options: options.into(),
        }
    }
}
