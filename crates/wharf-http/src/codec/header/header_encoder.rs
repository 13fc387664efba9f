use bytes::{BufMut, BytesMut};
use http::{header, StatusCode, Version};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::{PayloadSize, ResponseHead, SendError};

const INIT_HEAD_SIZE: usize = 4 * 1024;

/// Serializes a response head: status line, headers in insertion order,
/// blank line. The framing header (`Content-Length` or
/// `Transfer-Encoding: chunked`) is derived from the payload size; an
/// explicit `Content-Length` that disagrees with the body is rejected
/// before anything is written.
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;

        check_declared_length(&head, payload_size)?;

        dst.reserve(INIT_HEAD_SIZE);
        match head.version() {
            Version::HTTP_11 | Version::HTTP_10 => {
                dst.put_slice(b"HTTP/1.1 ");
                dst.put_slice(head.status().as_str().as_bytes());
                dst.put_slice(b" ");
                dst.put_slice(head.status().canonical_reason().unwrap_or("Unknown").as_bytes());
                dst.put_slice(b"\r\n");
            }
            v => {
                error!(version = ?v, "refusing to serialize non-http/1.x response");
                return Err(SendError::invalid_body(format!("unsupported version {v:?}")));
            }
        }

        // 1xx heads (100 Continue, 101 upgrade) carry no framing headers
        if !head.status().is_informational() {
            match payload_size {
                PayloadSize::Length(n) => {
                    head.headers_mut().insert(header::CONTENT_LENGTH, n.into());
                }
                PayloadSize::Chunked => {
                    head.headers_mut().insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
                }
                PayloadSize::Empty => {
                    if !skip_empty_length(head.status()) {
                        head.headers_mut().insert(header::CONTENT_LENGTH, 0.into());
                    }
                }
            }
        }

        for (name, value) in head.headers().iter() {
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn skip_empty_length(status: StatusCode) -> bool {
    status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

fn check_declared_length(head: &ResponseHead, payload_size: PayloadSize) -> Result<(), SendError> {
    let Some(declared) = head.headers().get(header::CONTENT_LENGTH) else {
        return Ok(());
    };
    let declared: u64 = declared
        .to_str()
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| SendError::invalid_body("unparseable content-length header"))?;
    match payload_size {
        PayloadSize::Length(actual) if actual != declared => {
            Err(SendError::ContentLengthMismatch { declared, actual })
        }
        PayloadSize::Empty if declared != 0 => Err(SendError::ContentLengthMismatch { declared, actual: 0 }),
        PayloadSize::Chunked => {
            Err(SendError::invalid_body("explicit content-length on a body of unknown length"))
        }
        _ => Ok(()),
    }
}
