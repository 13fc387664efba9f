mod header_decoder;
mod header_encoder;

pub use header_decoder::{HeaderDecoder, DEFAULT_MAX_HEAD_BYTES};
pub use header_encoder::HeaderEncoder;
