//! Response head and body types.
//!
//! A response body is one of: empty, a single buffer, a stream with a
//! declared length (serialized with `Content-Length`), or a stream of
//! unknown length (serialized with `Transfer-Encoding: chunked`). The
//! driver derives the wire framing from [`http_body::Body::size_hint`].

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::Response;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;

use crate::protocol::HttpError;

/// The header portion of a response; the body is attached separately.
pub type ResponseHead = Response<()>;

/// Body attached to responses produced by handlers.
pub struct ResponseBody {
    inner: Kind,
}

enum Kind {
    Once(Option<Bytes>),
    Stream(UnsyncBoxBody<Bytes, HttpError>),
    Sized(SizedStream),
}

struct SizedStream {
    inner: UnsyncBoxBody<Bytes, HttpError>,
    declared: u64,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self { inner: Kind::Once(None) }
    }

    pub fn once(bytes: Bytes) -> Self {
        Self { inner: Kind::Once(Some(bytes)) }
    }

    /// A stream of unknown length; emitted with chunked framing.
    pub fn stream<B>(body: B) -> Self
    where
        B: HttpBody<Data = Bytes, Error = HttpError> + Send + 'static,
    {
        Self { inner: Kind::Stream(UnsyncBoxBody::new(body)) }
    }

    /// A stream whose total length is known up front; emitted with
    /// `Content-Length: length` and no chunked framing.
    pub fn sized<B>(body: B, length: u64) -> Self
    where
        B: HttpBody<Data = Bytes, Error = HttpError> + Send + 'static,
    {
        Self { inner: Kind::Sized(SizedStream { inner: UnsyncBoxBody::new(body), declared: length }) }
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        if value.is_empty() {
            Self::empty()
        } else {
            Self::once(Bytes::from(value))
        }
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        if value.is_empty() {
            Self::empty()
        } else {
            Self::once(Bytes::from_static(value.as_bytes()))
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        if value.is_empty() {
            Self::empty()
        } else {
            Self::once(value)
        }
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(value: Vec<u8>) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<()> for ResponseBody {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().inner {
            Kind::Once(option) => Poll::Ready(option.take().map(|bytes| Ok(Frame::data(bytes)))),
            Kind::Stream(body) => Pin::new(body).poll_frame(cx),
            Kind::Sized(stream) => Pin::new(&mut stream.inner).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            Kind::Once(option) => option.is_none(),
            Kind::Stream(body) => body.is_end_stream(),
            Kind::Sized(stream) => stream.inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            Kind::Once(None) => SizeHint::with_exact(0),
            Kind::Once(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            Kind::Stream(body) => body.size_hint(),
            Kind::Sized(stream) => SizeHint::with_exact(stream.declared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ParseError;
    use futures::executor::block_on;
    use futures::TryStreamExt;
    use http_body_util::{BodyExt, StreamBody};

    #[test]
    fn once_body_yields_single_frame() {
        block_on(async {
            let mut body = ResponseBody::from("hello world".to_string());
            assert_eq!(body.size_hint().exact(), Some(11));
            let frame = body.frame().await.unwrap().unwrap();
            assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"hello world"));
            assert!(body.frame().await.is_none());
            assert!(body.is_end_stream());
        });
    }

    #[test]
    fn empty_body_is_exact_zero() {
        let body = ResponseBody::empty();
        assert_eq!(body.size_hint().exact(), Some(0));
        assert!(body.is_end_stream());
    }

    #[test]
    fn stream_body_has_no_exact_size() {
        let chunks: Vec<Result<_, std::io::Error>> =
            vec![Ok(Frame::data(Bytes::from_static(b"a"))), Ok(Frame::data(Bytes::from_static(b"b")))];
        let stream = futures::stream::iter(chunks).map_err(|e| HttpError::from(ParseError::io(e)));
        let body = ResponseBody::stream(StreamBody::new(stream));
        assert!(body.size_hint().exact().is_none());
    }

    #[test]
    fn sized_stream_reports_declared_length() {
        let chunks: Vec<Result<_, std::io::Error>> = vec![Ok(Frame::data(Bytes::from_static(b"0123456789")))];
        let stream = futures::stream::iter(chunks).map_err(|e| HttpError::from(ParseError::io(e)));
        let body = ResponseBody::sized(StreamBody::new(stream), 10);
        assert_eq!(body.size_hint().exact(), Some(10));
    }
}
