//! Incremental `multipart/*` body decoder.
//!
//! Splits a body stream on the boundary declared in `Content-Type`,
//! yielding each part's headers followed by its data in arriving-size
//! chunks. Used together with the request body's replay window so a router
//! can peek at the first boundary without stealing it from the handler.

use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio_util::codec::Decoder;

use crate::protocol::ParseError;

const MAX_PART_HEADERS: usize = 16;
const MAX_PART_HEAD_BYTES: usize = 8 * 1024;

/// Extracts the boundary parameter out of a `Content-Type` value like
/// `multipart/form-data; boundary=----abc123`.
pub fn boundary(content_type: &str) -> Option<String> {
    let (kind, params) = content_type.split_once(';')?;
    if !kind.trim().starts_with("multipart/") {
        return None;
    }
    for param in params.split(';') {
        let Some((name, value)) = param.split_once('=') else { continue };
        if name.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            if value.is_empty() {
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}

/// One decoded multipart item.
#[derive(Debug)]
pub enum MultipartItem {
    /// Headers of the next part.
    PartHead(HeaderMap),
    /// A slice of the current part's data.
    Data(Bytes),
    /// The current part is complete.
    PartEnd,
    /// The closing boundary was seen; no more parts follow.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before the first boundary; everything up to it is discarded.
    Preamble,
    /// Between a boundary line and the part's blank line.
    Head,
    /// Streaming part data, watching for `\r\n--boundary`.
    Data,
    /// A full delimiter was consumed; decide part-end vs body-end.
    Delimiter,
    Done,
}

pub struct MultipartDecoder {
    /// `--` + boundary.
    delimiter: Vec<u8>,
    state: State,
}

impl MultipartDecoder {
    pub fn new(boundary: &str) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(boundary.as_bytes());
        Self { delimiter, state: State::Preamble }
    }
}

impl Decoder for MultipartDecoder {
    type Item = MultipartItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Preamble => {
                    let Some(at) = find(src, &self.delimiter) else {
                        // keep a tail in case the delimiter straddles reads
                        let keep = self.delimiter.len().saturating_sub(1);
                        if src.len() > keep {
                            src.advance(src.len() - keep);
                        }
                        return Ok(None);
                    };
                    src.advance(at + self.delimiter.len());
                    self.state = State::Delimiter;
                }

                State::Delimiter => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] == b"--" {
                        src.advance(2);
                        self.state = State::Done;
                        return Ok(Some(MultipartItem::End));
                    }
                    if &src[..2] == b"\r\n" {
                        src.advance(2);
                        self.state = State::Head;
                        continue;
                    }
                    return Err(ParseError::invalid_body("garbage after multipart boundary"));
                }

                State::Head => {
                    // an immediate blank line means a header-less part
                    if src.len() >= 2 && &src[..2] == b"\r\n" {
                        src.advance(2);
                        self.state = State::Data;
                        return Ok(Some(MultipartItem::PartHead(HeaderMap::new())));
                    }
                    let Some(end) = find(src, b"\r\n\r\n") else {
                        if src.len() > MAX_PART_HEAD_BYTES {
                            return Err(ParseError::invalid_body("multipart part head too large"));
                        }
                        return Ok(None);
                    };
                    let head_bytes = src.split_to(end + 4);
                    let headers = parse_part_headers(&head_bytes)?;
                    self.state = State::Data;
                    return Ok(Some(MultipartItem::PartHead(headers)));
                }

                State::Data => {
                    // the delimiter inside data is always preceded by CRLF
                    let mut needle = Vec::with_capacity(self.delimiter.len() + 2);
                    needle.extend_from_slice(b"\r\n");
                    needle.extend_from_slice(&self.delimiter);

                    match find(src, &needle) {
                        Some(0) => {
                            src.advance(needle.len());
                            self.state = State::Delimiter;
                            return Ok(Some(MultipartItem::PartEnd));
                        }
                        Some(at) => {
                            let data = src.split_to(at).freeze();
                            return Ok(Some(MultipartItem::Data(data)));
                        }
                        None => {
                            // yield what cannot be part of a straddling needle
                            let keep = needle.len().saturating_sub(1);
                            if src.len() <= keep {
                                return Ok(None);
                            }
                            let data = src.split_to(src.len() - keep).freeze();
                            return Ok(Some(MultipartItem::Data(data)));
                        }
                    }
                }

                State::Done => return Ok(None),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn parse_part_headers(bytes: &[u8]) -> Result<HeaderMap, ParseError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    match httparse::parse_headers(bytes, &mut storage) {
        Ok(httparse::Status::Complete((_, parsed))) => {
            let mut headers = HeaderMap::with_capacity(parsed.len());
            for header in parsed {
                let name = HeaderName::from_bytes(header.name.as_bytes())
                    .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                let value = HeaderValue::from_bytes(header.value)
                    .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                headers.append(name, value);
            }
            Ok(headers)
        }
        Ok(httparse::Status::Partial) => Err(ParseError::invalid_body("truncated multipart part head")),
        Err(e) => Err(ParseError::invalid_header(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8], boundary: &str) -> Vec<MultipartItem> {
        let mut decoder = MultipartDecoder::new(boundary);
        let mut buf = BytesMut::from(input);
        let mut items = Vec::new();
        while let Some(item) = decoder.decode(&mut buf).unwrap() {
            items.push(item);
        }
        items
    }

    #[test]
    fn boundary_parameter_forms() {
        assert_eq!(boundary("multipart/form-data; boundary=xyz"), Some("xyz".into()));
        assert_eq!(boundary("multipart/mixed; boundary=\"quoted value\""), Some("quoted value".into()));
        assert_eq!(boundary("multipart/form-data;boundary=abc"), Some("abc".into()));
        assert_eq!(boundary("text/plain; boundary=xyz"), None);
        assert_eq!(boundary("multipart/form-data"), None);
    }

    #[test]
    fn two_parts() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"a\"\r\n\r\n\
            first\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"b\"\r\n\r\n\
            second value\r\n\
            --B--";
        let items = decode_all(body, "B");

        let mut texts = Vec::new();
        let mut current = Vec::new();
        let mut heads = 0;
        for item in items {
            match item {
                MultipartItem::PartHead(headers) => {
                    heads += 1;
                    assert!(headers.contains_key("content-disposition"));
                }
                MultipartItem::Data(bytes) => current.extend_from_slice(&bytes),
                MultipartItem::PartEnd => texts.push(std::mem::take(&mut current)),
                MultipartItem::End => {}
            }
        }
        assert_eq!(heads, 2);
        assert_eq!(texts, vec![b"first".to_vec(), b"second value".to_vec()]);
    }

    #[test]
    fn preamble_is_discarded() {
        let body = b"ignored preamble\r\n--B\r\nX-N: v\r\n\r\ndata\r\n--B--";
        let items = decode_all(body, "B");
        assert!(matches!(items[0], MultipartItem::PartHead(_)));
    }

    #[test]
    fn data_split_across_feeds() {
        let mut decoder = MultipartDecoder::new("B");
        let mut buf = BytesMut::from(&b"--B\r\n\r\nhello wo"[..]);

        let mut collected = Vec::new();
        while let Some(item) = decoder.decode(&mut buf).unwrap() {
            if let MultipartItem::Data(bytes) = item {
                collected.extend_from_slice(&bytes);
            }
        }
        buf.extend_from_slice(b"rld\r\n--B--");
        while let Some(item) = decoder.decode(&mut buf).unwrap() {
            if let MultipartItem::Data(bytes) = item {
                collected.extend_from_slice(&bytes);
            }
        }
        assert_eq!(collected, b"hello world");
    }

    #[test]
    fn closing_boundary_ends_the_stream() {
        let items = decode_all(b"--B\r\n\r\nx\r\n--B--", "B");
        assert!(matches!(items.last(), Some(MultipartItem::End)));
    }
}
