//! wharf-io: polling socket pool, async sockets and a cooperative executor.
//!
//! This crate is the I/O engine underneath `wharf-http`. It multiplexes
//! non-blocking sockets over kqueue/epoll/poll, suspends tasks until the
//! kernel reports readiness, and drives everything from a single-threaded
//! executor with a timer. Applications embed it by creating a
//! [`Runtime`], building sockets against [`Runtime::pool`] and calling
//! [`Runtime::block_on`].

pub mod addr;
mod error;
pub mod executor;
pub mod net;
pub mod poll;
pub mod socket;
mod sys;
pub mod time;

pub use addr::SocketAddr;
pub use error::SocketError;
pub use executor::{spawn, JoinHandle, Runtime};
pub use poll::{Event, Interest, Pool, PoolHandle, Readiness};
pub use sys::PacketInfo;
pub use time::{sleep, timeout, TimeoutError};
