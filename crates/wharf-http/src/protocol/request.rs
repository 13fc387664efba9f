//! Request head plus the derived views the router and handlers need:
//! percent-decoded path segments, ordered query pairs, byte-range
//! extraction and the keep-alive decision.

use http::header::{CONNECTION, EXPECT, RANGE};
use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

use crate::protocol::ParseError;

/// The parsed head of an HTTP request, without its body.
#[derive(Debug)]
pub struct RequestHead {
    inner: Request<()>,
}

impl RequestHead {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body, producing a full `http::Request`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the method may carry a body at all. GET, HEAD, DELETE,
    /// OPTIONS, CONNECT and TRACE requests are treated as bodiless.
    pub fn allows_body(&self) -> bool {
        !matches!(
            self.method(),
            &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT | &Method::TRACE
        )
    }

    /// Path split on `/` and percent-decoded per RFC 3986, byte-wise.
    /// `/a%2Fb/c` decodes to the two segments `a/b` and `c`.
    pub fn path_segments(&self) -> Result<Vec<String>, ParseError> {
        path_segments(self.uri().path())
    }

    /// Query parameters in wire order; duplicate names are preserved.
    pub fn query_pairs(&self) -> Result<Vec<(String, String)>, ParseError> {
        match self.uri().query() {
            None => Ok(Vec::new()),
            Some(query) => query_pairs(query),
        }
    }

    /// Extracts a single `Range: bytes=<start>-<end>` header with
    /// `start <= end`. Any other range shape is ignored so the handler
    /// falls back to a full 200 response.
    pub fn byte_range(&self) -> Option<(u64, u64)> {
        parse_byte_range(self.headers())
    }

    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get(EXPECT)
            .map(|value| value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-"))
            .unwrap_or(false)
    }

    /// The keep-alive negotiation of spec'd HTTP/1.x semantics:
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .headers()
            .get(CONNECTION)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        let mentions = |token: &str| connection.split(',').any(|part| part.trim().eq_ignore_ascii_case(token));
        match self.version() {
            Version::HTTP_11 => !mentions("close"),
            Version::HTTP_10 => mentions("keep-alive"),
            _ => false,
        }
    }
}

impl From<Parts> for RequestHead {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHead {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Splits a request path into percent-decoded segments.
pub fn path_segments(path: &str) -> Result<Vec<String>, ParseError> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let bytes = percent_decode(segment.as_bytes())?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        })
        .collect()
}

fn query_pairs(query: &str) -> Result<Vec<(String, String)>, ParseError> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = percent_decode(name.as_bytes())?;
            let value = percent_decode(value.as_bytes())?;
            Ok((
                String::from_utf8_lossy(&name).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ))
        })
        .collect()
}

/// RFC 3986 percent-decoding over raw bytes.
pub(crate) fn percent_decode(input: &[u8]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        let hi = bytes.next().and_then(hex_value);
        let lo = bytes.next().and_then(hex_value);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
            _ => {
                return Err(ParseError::invalid_encoding(format!(
                    "truncated escape in {:?}",
                    String::from_utf8_lossy(input)
                )))
            }
        }
    }
    Ok(out)
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// See [`RequestHead::byte_range`].
pub fn parse_byte_range(headers: &HeaderMap) -> Option<(u64, u64)> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    // a single fully bounded range only; lists, suffixes and open ends
    // are served as a plain 200 by the caller
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if start <= end {
        Some((start, end))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn head(builder: http::request::Builder) -> RequestHead {
        builder.body(()).unwrap().into_parts().0.into()
    }

    #[test]
    fn segments_decode_percent_escapes() {
        let segments = path_segments("/files/a%20b/c%2Fd").unwrap();
        assert_eq!(segments, vec!["files", "a b", "c/d"]);
    }

    #[test]
    fn truncated_escape_is_rejected() {
        assert!(path_segments("/a%2").is_err());
        assert!(path_segments("/a%zz").is_err());
    }

    #[test]
    fn query_pairs_keep_order_and_duplicates() {
        let head = head(Request::builder().uri("/index?a=1&b=2&a=3&flag"));
        let pairs = head.query_pairs().unwrap();
        assert_eq!(
            pairs,
            vec![
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
                ("a".into(), "3".into()),
                ("flag".into(), "".into()),
            ]
        );
    }

    #[test]
    fn byte_range_accepts_single_bounded_range() {
        let head = head(Request::builder().uri("/f").header(RANGE, "bytes=10-19"));
        assert_eq!(head.byte_range(), Some((10, 19)));
    }

    #[test]
    fn byte_range_ignores_other_forms() {
        for value in ["bytes=10-", "bytes=-500", "bytes=0-1,5-9", "items=1-2", "bytes=9-1"] {
            let head = head(Request::builder().uri("/f").header(RANGE, value));
            assert_eq!(head.byte_range(), None, "{value} should be ignored");
        }
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        let http11 = head(Request::builder().uri("/"));
        assert!(http11.keep_alive());

        let closed = head(Request::builder().uri("/").header(CONNECTION, "close"));
        assert!(!closed.keep_alive());

        let mut parts = Request::builder().uri("/").body(()).unwrap().into_parts().0;
        parts.version = Version::HTTP_10;
        let http10: RequestHead = parts.into();
        assert!(!http10.keep_alive());

        let mut parts = Request::builder()
            .uri("/")
            .header(CONNECTION, HeaderValue::from_static("Keep-Alive"))
            .body(())
            .unwrap()
            .into_parts()
            .0;
        parts.version = Version::HTTP_10;
        let http10_ka: RequestHead = parts.into();
        assert!(http10_ka.keep_alive());
    }

    #[test]
    fn trace_never_carries_a_body() {
        let head = head(Request::builder().method(Method::TRACE).uri("/"));
        assert!(!head.allows_body());
        let head = head2(Method::POST);
        assert!(head.allows_body());
    }

    fn head2(method: Method) -> RequestHead {
        Request::builder().method(method).uri("/").body(()).unwrap().into_parts().0.into()
    }
}
