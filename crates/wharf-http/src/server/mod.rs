//! The server: configuration, accept loop, supervision and shutdown.

mod config;
#[allow(clippy::module_inception)]
mod server;
pub mod shutdown;

pub use config::ServerConfig;
pub use server::{Server, ServerError};
pub use shutdown::Shutdown;
