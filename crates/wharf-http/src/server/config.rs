//! Server configuration.

use std::time::Duration;

use wharf_io::SocketAddr;

use crate::connection::DriverOptions;

/// Everything the server needs besides the pool and the routes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where to bind; port 0 picks an ephemeral port, resolved after bind.
    pub address: SocketAddr,
    /// Per-request handler deadline. Default 15 s.
    pub timeout: Duration,
    /// Optional deadline for reading a request head; off by default.
    pub read_timeout: Option<Duration>,
    /// Per-connection parser buffer ceiling. Default 4096.
    pub shared_request_buffer_size: usize,
    /// Replay-buffer ceiling per request body. Default 1 MiB.
    pub shared_request_replay_size: usize,
    /// Match literal path segments case-insensitively. Default off.
    pub case_insensitive_routes: bool,
}

impl ServerConfig {
    pub fn new(address: impl Into<SocketAddr>) -> ServerConfig {
        ServerConfig {
            address: address.into(),
            timeout: Duration::from_secs(15),
            read_timeout: None,
            shared_request_buffer_size: 4096,
            shared_request_replay_size: 1024 * 1024,
            case_insensitive_routes: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> ServerConfig {
        self.timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> ServerConfig {
        self.read_timeout = Some(read_timeout);
        self
    }

    pub fn shared_request_buffer_size(mut self, bytes: usize) -> ServerConfig {
        self.shared_request_buffer_size = bytes;
        self
    }

    pub fn shared_request_replay_size(mut self, bytes: usize) -> ServerConfig {
        self.shared_request_replay_size = bytes;
        self
    }

    pub fn case_insensitive_routes(mut self) -> ServerConfig {
        self.case_insensitive_routes = true;
        self
    }

    pub(crate) fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            handler_timeout: self.timeout,
            read_timeout: self.read_timeout,
            buffer_size: self.shared_request_buffer_size,
            max_head_bytes: crate::codec::DEFAULT_MAX_HEAD_BYTES,
            replay_limit: self.shared_request_replay_size,
        }
    }
}
