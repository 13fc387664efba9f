//! Connection driving: the keep-alive request/response loop and protocol
//! upgrades.

mod http_connection;
mod upgrade;

pub use http_connection::{DriverOptions, HttpConnection};
pub use upgrade::{OnUpgrade, Upgraded};
