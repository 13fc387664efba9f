use std::mem::MaybeUninit;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue, Request};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHead};

pub(crate) const MAX_HEADER_NUM: usize = 64;

/// Default cap on the total size of a request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;

/// Decodes a request head (request line + header block) out of the shared
/// buffer and derives the body framing from it.
///
/// CRLF line endings are canonical; bare LF is tolerated on input. Obsolete
/// line folding is rejected. The whole head is capped at `max_head_bytes`,
/// answered upstream with 413 when exceeded.
pub struct HeaderDecoder {
    max_head_bytes: usize,
}

impl HeaderDecoder {
    pub fn new(max_head_bytes: usize) -> Self {
        Self { max_head_bytes }
    }
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAD_BYTES)
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHead, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut req = httparse::Request::new(&mut []);
        let mut headers: [MaybeUninit<httparse::Header>; MAX_HEADER_NUM] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let parsed = req.parse_with_uninit_headers(src, &mut headers).map_err(|e| match e {
            httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            httparse::Error::Token | httparse::Error::Version => {
                ParseError::invalid_request_line(e.to_string())
            }
            e => ParseError::invalid_header(e.to_string()),
        })?;

        match parsed {
            Status::Complete(head_len) => {
                trace!(head_len, "parsed request head");
                ensure!(head_len <= self.max_head_bytes, ParseError::too_large_header(head_len, self.max_head_bytes));

                let mut index: [HeaderIndex; MAX_HEADER_NUM] = [HeaderIndex::EMPTY; MAX_HEADER_NUM];
                HeaderIndex::record(src, req.headers, &mut index);

                let version = match req.version {
                    Some(0) => http::Version::HTTP_10,
                    Some(1) => http::Version::HTTP_11,
                    other => return Err(ParseError::InvalidVersion(other)),
                };

                let mut builder = Request::builder()
                    .method(req.method.ok_or(ParseError::InvalidMethod)?)
                    .uri(req.path.ok_or(ParseError::InvalidUri)?)
                    .version(version);

                let header_count = req.headers.len();
                let headers = builder.headers_mut().unwrap();
                headers.reserve(header_count);

                let head_bytes = src.split_to(head_len).freeze();
                for entry in &index[..header_count] {
                    // httparse validated the name as a token
                    let name = HeaderName::from_bytes(&head_bytes[entry.name.0..entry.name.1]).unwrap();
                    // SAFETY: httparse only accepts visible ASCII plus
                    // horizontal whitespace in header values
                    let value = unsafe {
                        HeaderValue::from_maybe_shared_unchecked(head_bytes.slice(entry.value.0..entry.value.1))
                    };
                    headers.append(name, value);
                }

                let head = RequestHead::from(
                    builder.body(()).map_err(|e| ParseError::invalid_request_line(e.to_string()))?.into_parts().0,
                );
                let payload_size = body_framing(&head)?;

                Ok(Some((head, payload_size)))
            }
            Status::Partial => {
                ensure!(
                    src.len() <= self.max_head_bytes,
                    ParseError::too_large_header(src.len(), self.max_head_bytes)
                );
                Ok(None)
            }
        }
    }
}

#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderIndex {
    const EMPTY: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let base = bytes.as_ptr() as usize;
        for (header, index) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - base;
            index.name = (name_start, name_start + header.name.len());
            let value_start = header.value.as_ptr() as usize - base;
            index.value = (value_start, value_start + header.value.len());
        }
    }
}

/// Body framing per RFC 7230 §3.3, decided strictly in this order:
/// `Transfer-Encoding` ending in `chunked`, else `Content-Length`, else no
/// body. Conflicting or repeated-with-different-value headers are errors.
fn body_framing(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    let te = head.headers().get(http::header::TRANSFER_ENCODING);
    let cl_values: Vec<&HeaderValue> = head.headers().get_all(http::header::CONTENT_LENGTH).iter().collect();

    match (te, cl_values.is_empty()) {
        (Some(_), false) => {
            Err(ParseError::framing_conflict("both transfer-encoding and content-length present"))
        }
        (Some(te_value), true) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::Chunked)
            } else {
                Ok(PayloadSize::Empty)
            }
        }
        (None, false) => {
            let first = content_length_value(cl_values[0])?;
            for value in &cl_values[1..] {
                if content_length_value(value)? != first {
                    return Err(ParseError::framing_conflict("multiple differing content-length values"));
                }
            }
            // a zero length is the same wire shape as no body at all
            if first == 0 {
                Ok(PayloadSize::Empty)
            } else {
                Ok(PayloadSize::Length(first))
            }
        }
        (None, true) => Ok(PayloadSize::Empty),
    }
}

fn content_length_value(value: &HeaderValue) -> Result<u64, ParseError> {
    let text = value
        .to_str()
        .map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| ParseError::invalid_content_length(format!("value {text:?} is not a u64")))
}

fn is_chunked(value: &HeaderValue) -> bool {
    value
        .to_str()
        .ok()
        .and_then(|encodings| encodings.rsplit(',').next())
        .map(|last| last.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Version};
    use indoc::indoc;

    fn decode(input: &str) -> Result<Option<(RequestHead, PayloadSize)>, ParseError> {
        let mut buf = BytesMut::from(input);
        HeaderDecoder::default().decode(&mut buf)
    }

    #[test]
    fn plain_get() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let (head, payload_size) = decode(str).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Empty);
        assert_eq!(head.method(), &Method::GET);
        assert_eq!(head.version(), Version::HTTP_11);
        assert_eq!(head.uri().path(), "/index.html");
        assert_eq!(head.uri().query(), None);
        assert_eq!(head.headers().len(), 3);
        assert_eq!(head.headers().get(http::header::HOST).unwrap(), "127.0.0.1:8080");
    }

    #[test]
    fn query_split_from_path() {
        let str = indoc! {r##"
        GET /index/?a=1&b=2&a=3 HTTP/1.1
        Host: h

        "##};

        let (head, _) = decode(str).unwrap().unwrap();
        assert_eq!(head.uri().path(), "/index/");
        assert_eq!(head.uri().query(), Some("a=1&b=2&a=3"));
    }

    #[test]
    fn leftover_bytes_stay_in_buffer() {
        let str = indoc! {r##"
        GET / HTTP/1.1
        Host: h

        123"##};

        let mut buf = BytesMut::from(str);
        let result = HeaderDecoder::default().decode(&mut buf).unwrap();
        assert!(result.is_some());
        assert_eq!(&buf[..], b"123");
    }

    #[test]
    fn content_length_framing() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: h
        Content-Length: 11

        "##};

        let (_, payload_size) = decode(str).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Length(11));
    }

    #[test]
    fn chunked_framing_wins_when_last_encoding() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: h
        Transfer-Encoding: gzip, chunked

        "##};

        let (_, payload_size) = decode(str).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Chunked);
    }

    #[test]
    fn chunked_not_last_means_no_body() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: h
        Transfer-Encoding: chunked, gzip

        "##};

        let (_, payload_size) = decode(str).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Empty);
    }

    #[test]
    fn te_and_cl_conflict() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: h
        Transfer-Encoding: chunked
        Content-Length: 5

        "##};

        assert!(matches!(decode(str), Err(ParseError::FramingConflict { .. })));
    }

    #[test]
    fn differing_content_lengths_conflict() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: h
        Content-Length: 5
        Content-Length: 6

        "##};

        assert!(matches!(decode(str), Err(ParseError::FramingConflict { .. })));
    }

    #[test]
    fn repeated_equal_content_lengths_are_accepted() {
        let str = indoc! {r##"
        POST /upload HTTP/1.1
        Host: h
        Content-Length: 5
        Content-Length: 5

        "##};

        let (_, payload_size) = decode(str).unwrap().unwrap();
        assert_eq!(payload_size, PayloadSize::Length(5));
    }

    #[test]
    fn partial_head_needs_more_data() {
        let mut buf = BytesMut::from("GET / HTTP/1.1\r\nHost: h\r\n");
        let result = HeaderDecoder::default().decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn oversized_head_is_rejected_while_partial() {
        let mut decoder = HeaderDecoder::new(64);
        let mut buf = BytesMut::from(format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n", "y".repeat(128)).as_str());
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ParseError::TooLargeHeader { .. }));
        assert_eq!(err.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn obsolete_line_folding_is_rejected() {
        let str = "GET / HTTP/1.1\r\nX-Folded: a\r\n b\r\nHost: h\r\n\r\n";
        assert!(decode(str).is_err());
    }

    #[test]
    fn garbage_request_line_is_rejected() {
        assert!(decode("NOT AN HTTP REQUEST\r\n\r\n").is_err());
    }
}
