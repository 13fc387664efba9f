//! Streaming request bodies.
//!
//! The connection driver keeps ownership of the decoded message stream; the
//! handler receives a [`ReqBody`] that pulls chunks through a small channel
//! pair. Driving both sides concurrently (the driver's `select!` loop) gives
//! backpressure and lets the driver drain whatever the handler left unread
//! before the response goes out.
//!
//! Every chunk handed to the handler is also recorded in a bounded replay
//! window so one [`ReqBody::rewind`] per request can re-yield already-seen
//! bytes, e.g. after peeking for a multipart boundary.

mod body_channel;
mod req_body;

pub(crate) use body_channel::BodySender;
pub use req_body::ReqBody;
