//! Incremental HTTP/1.1 codec.
//!
//! Both directions run as tokio-util codecs over the connection's shared
//! buffer: [`RequestDecoder`] parses request line, header block and body
//! framing out of a streaming byte source, and [`ResponseEncoder`] emits a
//! response head followed by identity- or chunked-framed payload items.
//! [`multipart`] adds an incremental part splitter for `multipart/*`
//! bodies.

mod body;
mod header;
pub mod multipart;
mod request_decoder;
mod response_encoder;

pub use body::{PayloadDecoder, PayloadEncoder};
pub use header::{HeaderDecoder, HeaderEncoder, DEFAULT_MAX_HEAD_BYTES};
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;
