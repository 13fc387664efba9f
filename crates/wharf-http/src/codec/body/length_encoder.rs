use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

use crate::protocol::{PayloadItem, SendError};

/// Emits identity-framed payload bytes, at most the declared length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
    saw_eof: bool,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length, saw_eof: false }
    }

    pub fn is_finished(&self) -> bool {
        self.remaining == 0 && self.saw_eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                if !bytes.has_remaining() {
                    return Ok(());
                }
                let len = bytes.remaining() as u64;
                if len > self.remaining {
                    warn!(extra = len - self.remaining, "body produced more bytes than its declared length");
                    return Err(SendError::invalid_body("body exceeds declared content-length"));
                }
                dst.extend_from_slice(bytes.chunk());
                self.remaining -= len;
                Ok(())
            }
            PayloadItem::Eof => {
                self.saw_eof = true;
                Ok(())
            }
        }
    }
}
