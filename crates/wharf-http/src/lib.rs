//! wharf-http: an embeddable HTTP/1.1 server engine.
//!
//! The crate layers four pieces on top of the `wharf-io` runtime:
//! an incremental request/response codec ([`codec`]), the protocol types
//! and streaming bodies ([`protocol`]), an ordered first-match router
//! ([`router`]), and the per-connection driver plus accept loop
//! ([`connection`], [`server`]).
//!
//! ```no_run
//! use wharf_http::router::Route;
//! use wharf_http::handler::route_fn;
//! use wharf_http::protocol::ResponseBody;
//! use wharf_http::server::{Server, ServerConfig};
//! use wharf_io::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! let config = ServerConfig::new(std::net::SocketAddr::from(([127, 0, 0, 1], 8080)));
//! let server = Server::new(config, rt.pool());
//! server.route(
//!     Route::get("/hello/{name}").unwrap(),
//!     route_fn(|_req| async { Ok(http::Response::builder().body(ResponseBody::from("hi")).unwrap()) }),
//! );
//! rt.block_on(server.run()).unwrap();
//! ```

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod router;
pub mod server;

pub(crate) use help::ensure;

mod help {

    macro_rules! ensure {
        ($predicate:expr, $error:expr) => {
            if !$predicate {
                return Err($error);
            }
        };
    }
    pub(crate) use ensure;
}
