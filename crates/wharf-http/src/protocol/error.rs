//! Protocol error taxonomy.
//!
//! [`HttpError`] is the connection-level error: either the request could not
//! be parsed ([`ParseError`]) or the response could not be produced
//! ([`SendError`]). The connection driver maps parse failures to 400 (413
//! for the size caps), handler timeouts and failures to 500, and an
//! unrouted request to 404.

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Connection-level error wrapping both directions.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    Request {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    Response {
        #[from]
        source: SendError,
    },
}

/// Failures while parsing an incoming request.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The head grew past the configured cap; answered with 413.
    #[error("request head of {current_size} bytes exceeds the {max_size} byte limit")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} headers in request head")]
    TooManyHeaders { max_num: usize },

    #[error("malformed request line: {reason}")]
    InvalidRequestLine { reason: String },

    #[error("malformed header: {reason}")]
    InvalidHeader { reason: String },

    #[error("unsupported http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid request target")]
    InvalidUri,

    /// `Transfer-Encoding` and `Content-Length` disagree about framing.
    #[error("conflicting body framing: {reason}")]
    FramingConflict { reason: String },

    #[error("invalid content-length: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunked encoding: {reason}")]
    InvalidChunk { reason: String },

    #[error("invalid percent-encoding: {reason}")]
    InvalidEncoding { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// The replay window was exhausted or rewound twice.
    #[error("body replay unavailable: {reason}")]
    ReplayUnavailable { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_request_line<S: ToString>(reason: S) -> Self {
        Self::InvalidRequestLine { reason: reason.to_string() }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn framing_conflict<S: ToString>(reason: S) -> Self {
        Self::FramingConflict { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn invalid_chunk<S: ToString>(reason: S) -> Self {
        Self::InvalidChunk { reason: reason.to_string() }
    }

    pub fn invalid_encoding<S: ToString>(reason: S) -> Self {
        Self::InvalidEncoding { reason: reason.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn replay_unavailable<S: ToString>(reason: S) -> Self {
        Self::ReplayUnavailable { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status the driver answers with before closing the connection.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } | Self::TooManyHeaders { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failures while serializing or writing a response.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// A handler-set `Content-Length` disagrees with the body's exact size;
    /// such responses are rejected before any bytes reach the wire.
    #[error("content-length {declared} disagrees with body length {actual}")]
    ContentLengthMismatch { declared: u64, actual: u64 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
