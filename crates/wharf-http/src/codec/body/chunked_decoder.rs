//! Chunked transfer decoding (RFC 7230 §4.1).
//!
//! Chunks are yielded as they arrive; a chunk split across reads produces
//! several `PayloadItem::Chunk`s. Extensions are skipped, trailers are read
//! and discarded, and a chunk-size overflow is a parse error.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Hex digits of the chunk size.
    Size,
    /// Whitespace between size and extension/CR.
    SizeWs,
    /// Chunk extension, ignored up to CR.
    Extension,
    /// LF closing the size line.
    SizeLf,
    /// Chunk payload bytes.
    Data,
    /// CR after the payload.
    DataCr,
    /// LF after the payload.
    DataLf,
    /// Trailer field, discarded up to CR.
    Trailer,
    /// LF closing a trailer line.
    TrailerLf,
    /// CR of the final empty line.
    EndCr,
    /// LF of the final empty line.
    EndLf,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, remaining: 0 }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == State::Done {
                trace!("chunked body complete");
                return Ok(Some(PayloadItem::Eof));
            }

            if self.state == State::Data {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(src.len());
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.state = State::DataCr;
                }
                let bytes = src.split_to(take).freeze();
                trace!(len = bytes.len(), "decoded chunk bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }

            if src.is_empty() {
                return Ok(None);
            }
            let byte = src.get_u8();

            self.state = match (self.state, byte) {
                (State::Size, b'0'..=b'9') => self.push_digit(byte - b'0')?,
                (State::Size, b'a'..=b'f') => self.push_digit(byte - b'a' + 10)?,
                (State::Size, b'A'..=b'F') => self.push_digit(byte - b'A' + 10)?,
                (State::Size, b'\t' | b' ') => State::SizeWs,
                (State::Size, b';') => State::Extension,
                (State::Size, b'\r') => State::SizeLf,
                (State::Size, _) => return Err(ParseError::invalid_chunk("non-hex byte in chunk size")),

                (State::SizeWs, b'\t' | b' ') => State::SizeWs,
                (State::SizeWs, b';') => State::Extension,
                (State::SizeWs, b'\r') => State::SizeLf,
                (State::SizeWs, _) => return Err(ParseError::invalid_chunk("garbage after chunk size")),

                // extensions end at CRLF; a bare LF inside one is malformed
                (State::Extension, b'\r') => State::SizeLf,
                (State::Extension, b'\n') => {
                    return Err(ParseError::invalid_chunk("newline inside chunk extension"))
                }
                (State::Extension, _) => State::Extension,

                (State::SizeLf, b'\n') => {
                    if self.remaining == 0 {
                        State::EndCr
                    } else {
                        State::Data
                    }
                }
                (State::SizeLf, _) => return Err(ParseError::invalid_chunk("chunk size line not ended by LF")),

                (State::DataCr, b'\r') => State::DataLf,
                (State::DataCr, _) => return Err(ParseError::invalid_chunk("chunk data not followed by CR")),
                (State::DataLf, b'\n') => State::Size,
                (State::DataLf, _) => return Err(ParseError::invalid_chunk("chunk data not followed by LF")),

                (State::Trailer, b'\r') => State::TrailerLf,
                (State::Trailer, _) => State::Trailer,
                (State::TrailerLf, b'\n') => State::EndCr,
                (State::TrailerLf, _) => return Err(ParseError::invalid_chunk("trailer line not ended by LF")),

                (State::EndCr, b'\r') => State::EndLf,
                // anything else after the last chunk is a trailer field
                (State::EndCr, _) => State::Trailer,
                (State::EndLf, b'\n') => State::Done,
                (State::EndLf, _) => return Err(ParseError::invalid_chunk("final CRLF missing")),

                (State::Data | State::Done, _) => unreachable!("handled above"),
            };
        }
    }
}

impl ChunkedDecoder {
    fn push_digit(&mut self, digit: u8) -> Result<State, ParseError> {
        self.remaining = self
            .remaining
            .checked_mul(16)
            .and_then(|v| v.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_chunk("chunk size overflows u64"))?;
        Ok(State::Size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk(decoder: &mut ChunkedDecoder, buf: &mut BytesMut) -> Bytes {
        decoder.decode(buf).unwrap().unwrap().into_bytes().unwrap()
    }

    #[test]
    fn single_chunk_then_eof() {
        let mut buf = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"1234567890abcdef"));
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_eof());
    }

    #[test]
    fn multiple_chunks() {
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();

        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"hello"));
        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b" world"));
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_eof());
    }

    #[test]
    fn extensions_are_skipped() {
        let mut buf = BytesMut::from(&b"5;name=value\r\nhello\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"hello"));
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_eof());
    }

    #[test]
    fn trailers_are_discarded() {
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n0\r\nExpires: never\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"hello"));
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_eof());
    }

    #[test]
    fn partial_chunk_is_yielded_incrementally() {
        let mut buf = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"hel"));
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"lo\r\n0\r\n\r\n");
        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"lo"));
        assert!(decoder.decode(&mut buf).unwrap().unwrap().is_eof());
    }

    #[test]
    fn concatenated_chunk_sizes_add_up() {
        let mut buf = BytesMut::from(&b"3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n"[..]);
        let mut decoder = ChunkedDecoder::new();
        let mut total = 0;
        loop {
            match decoder.decode(&mut buf).unwrap().unwrap() {
                PayloadItem::Chunk(bytes) => total += bytes.len(),
                PayloadItem::Eof => break,
            }
        }
        assert_eq!(total, 7);
    }

    #[test]
    fn bad_hex_is_an_error() {
        let mut buf = BytesMut::from(&b"xyz\r\n"[..]);
        assert!(ChunkedDecoder::new().decode(&mut buf).is_err());
    }

    #[test]
    fn size_overflow_is_an_error() {
        let mut buf = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        assert!(matches!(
            ChunkedDecoder::new().decode(&mut buf),
            Err(ParseError::InvalidChunk { .. })
        ));
    }

    #[test]
    fn missing_crlf_after_data_is_an_error() {
        let mut buf = BytesMut::from(&b"5\r\nhelloXX"[..]);
        let mut decoder = ChunkedDecoder::new();
        assert_eq!(chunk(&mut decoder, &mut buf), Bytes::from_static(b"hello"));
        assert!(decoder.decode(&mut buf).is_err());
    }
}
