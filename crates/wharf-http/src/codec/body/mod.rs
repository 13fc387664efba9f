//! Body framing codecs: identity (`Content-Length`) and chunked transfer
//! encoding, in both directions, behind a unified payload codec selected by
//! [`crate::protocol::PayloadSize`].

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
