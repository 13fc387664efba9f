//! Streaming request decoder.
//!
//! Two-phase state machine over the shared connection buffer: the head is
//! parsed by [`HeaderDecoder`], which also decides the body framing; the
//! body then streams out of the matching [`PayloadDecoder`] until its EOF
//! marker, at which point the decoder is ready for the next request on the
//! same connection.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::{HeaderDecoder, DEFAULT_MAX_HEAD_BYTES};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead};

pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Caps the request head at `max_head_bytes` instead of the default.
    pub fn with_max_head_bytes(max_head_bytes: usize) -> Self {
        Self { header_decoder: HeaderDecoder::new(max_head_bytes), payload_decoder: None }
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::with_max_head_bytes(DEFAULT_MAX_HEAD_BYTES)
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    // body finished; back to expecting a head
                    self.payload_decoder.take();
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((head, payload_size)) => {
                // a bodiless request goes straight back to expecting a head
                self.payload_decoder = match payload_size {
                    PayloadSize::Empty => None,
                    sized => Some(sized.into()),
                };
                Some(Message::Head((head, payload_size)))
            }
            None => None,
        };
        Ok(message)
    }
}
