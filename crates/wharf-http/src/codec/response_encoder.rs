//! Streaming response encoder, symmetric to the request decoder: a head
//! first, then payload items through the framing chosen by the head.

use bytes::{Bytes, BytesMut};
use std::io;
use std::io::ErrorKind;
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::PayloadEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self { header_encoder: HeaderEncoder, payload_encoder: None }
    }
}

impl Encoder<Message<(ResponseHead, PayloadSize), Bytes>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Head((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("response head while the previous body is unfinished");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                }
                let informational = head.status().is_informational();
                self.header_encoder.encode((head, payload_size), dst)?;
                if !informational {
                    self.payload_encoder = Some(payload_size.into());
                }
                Ok(())
            }

            Message::Payload(item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("payload item before a response head");
                    return Err(io::Error::from(ErrorKind::InvalidInput).into());
                };

                let result = payload_encoder.encode(item, dst);
                if payload_encoder.is_finished() {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadItem;
    use bytes::Bytes;
    use http::Response;

    fn head(status: u16) -> ResponseHead {
        Response::builder().status(status).body(()).unwrap()
    }

    #[test]
    fn fixed_length_round() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Message::Head((head(200), PayloadSize::Length(5))), &mut dst).unwrap();
        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"hello"))), &mut dst).unwrap();
        encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut dst).unwrap();

        let wire = String::from_utf8(dst.to_vec()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("content-length: 5\r\n"));
        assert!(wire.ends_with("\r\n\r\nhello"));

        // the encoder is reusable for the next response on the connection
        let mut next = BytesMut::new();
        encoder.encode(Message::<_, Bytes>::Head((head(204), PayloadSize::Empty)), &mut next).unwrap();
        assert!(String::from_utf8(next.to_vec()).unwrap().starts_with("HTTP/1.1 204"));
    }

    #[test]
    fn chunked_round() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(Message::Head((head(200), PayloadSize::Chunked)), &mut dst).unwrap();
        encoder.encode(Message::Payload(PayloadItem::Chunk(Bytes::from_static(b"ab"))), &mut dst).unwrap();
        encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), &mut dst).unwrap();

        let wire = String::from_utf8(dst.to_vec()).unwrap();
        assert!(wire.contains("transfer-encoding: chunked\r\n"));
        assert!(wire.ends_with("2\r\nab\r\n0\r\n\r\n"));
    }

    #[test]
    fn payload_before_head_is_refused() {
        let mut encoder = ResponseEncoder::new();
        let mut dst = BytesMut::new();
        let result =
            encoder.encode(Message::<(ResponseHead, PayloadSize), Bytes>::Payload(PayloadItem::Eof), &mut dst);
        assert!(result.is_err());
    }
}
