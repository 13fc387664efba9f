//! Error types for the socket and event-pool layer
//!
//! Every failing syscall is reported as [`SocketError::Syscall`] carrying the
//! original errno (as a [`std::io::Error`]) together with a static string
//! naming the operation that failed. `EAGAIN` and `EINTR` never surface here:
//! the async socket layer retries them transparently.

use std::io;
use thiserror::Error;

/// Errors produced by sockets and the event pool.
#[derive(Error, Debug)]
pub enum SocketError {
    /// A syscall failed; carries the errno and the operation name.
    #[error("{ctx}: {source}")]
    Syscall {
        ctx: &'static str,
        #[source]
        source: io::Error,
    },

    /// The peer (or the fd itself) went away while an operation was pending.
    #[error("socket disconnected")]
    Disconnected,

    /// The given address cannot be represented on this platform.
    #[error("unsupported socket address: {reason}")]
    UnsupportedAddress { reason: String },

    /// The event pool was dropped while a suspension was outstanding.
    #[error("event pool closed")]
    PoolClosed,
}

impl SocketError {
    /// Captures `errno` for a failed syscall named by `ctx`.
    pub fn make_failed(ctx: &'static str) -> Self {
        Self::Syscall { ctx, source: io::Error::last_os_error() }
    }

    pub fn syscall(ctx: &'static str, source: io::Error) -> Self {
        Self::Syscall { ctx, source }
    }

    pub fn unsupported_address<S: ToString>(reason: S) -> Self {
        Self::UnsupportedAddress { reason: reason.to_string() }
    }

    /// The raw errno, when this error wraps a syscall failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Syscall { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<SocketError> for io::Error {
    fn from(e: SocketError) -> io::Error {
        match e {
            SocketError::Syscall { source, .. } => source,
            SocketError::Disconnected => io::Error::new(io::ErrorKind::NotConnected, SocketError::Disconnected),
            SocketError::UnsupportedAddress { reason } => io::Error::new(io::ErrorKind::InvalidInput, reason),
            SocketError::PoolClosed => io::Error::new(io::ErrorKind::Other, SocketError::PoolClosed),
        }
    }
}

/// Recovers a typed pool error that crossed the `io::Error` boundary;
/// anything else becomes a syscall failure named by `ctx`.
pub(crate) fn wrap_io(ctx: &'static str, e: io::Error) -> SocketError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<SocketError>()) {
        Some(SocketError::Disconnected) => SocketError::Disconnected,
        Some(SocketError::PoolClosed) => SocketError::PoolClosed,
        _ => SocketError::Syscall { ctx, source: e },
    }
}

pub(crate) fn is_would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn is_interrupted(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::Interrupted
}
