use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use http_body::{Body, Frame, SizeHint};

use crate::protocol::body::body_channel::{self, BodySender};
use crate::protocol::{Message, ParseError, PayloadSize, RequestHead};

/// Request body handed to handlers.
///
/// Chunks come off the connection in wire order. Up to the configured
/// replay window of already-yielded bytes is kept so the consumer may call
/// [`ReqBody::rewind`] once and read them again ahead of the live stream.
pub struct ReqBody {
    repr: Repr,
    replay: Replay,
}

enum Repr {
    Receiver(body_channel::BodyReceiver),
    NoBody,
}

struct Replay {
    limit: usize,
    recorded: VecDeque<Bytes>,
    recorded_len: usize,
    overflowed: bool,
    rewound: bool,
    pending: VecDeque<Bytes>,
}

impl Replay {
    fn new(limit: usize) -> Replay {
        Replay {
            limit,
            recorded: VecDeque::new(),
            recorded_len: 0,
            overflowed: false,
            rewound: false,
            pending: VecDeque::new(),
        }
    }

    fn record(&mut self, bytes: &Bytes) {
        if self.rewound || self.overflowed {
            return;
        }
        if self.recorded_len + bytes.len() > self.limit {
            self.overflowed = true;
            self.recorded.clear();
            self.recorded_len = 0;
            return;
        }
        self.recorded_len += bytes.len();
        self.recorded.push_back(bytes.clone());
    }
}

impl ReqBody {
    /// Builds the handler body plus, when there is anything to stream, the
    /// connection-side sender that feeds it.
    pub(crate) fn create<S>(
        payload_stream: &mut S,
        payload_size: PayloadSize,
        replay_limit: usize,
    ) -> (ReqBody, Option<BodySender<'_, S>>)
    where
        S: Stream<Item = Result<Message<(RequestHead, PayloadSize)>, ParseError>> + Unpin,
    {
        match payload_size {
            PayloadSize::Empty | PayloadSize::Length(0) => (ReqBody::no_body(replay_limit), None),
            _ => {
                let (sender, receiver) = body_channel::channel(payload_stream, payload_size);
                (ReqBody { repr: Repr::Receiver(receiver), replay: Replay::new(replay_limit) }, Some(sender))
            }
        }
    }

    pub(crate) fn no_body(replay_limit: usize) -> ReqBody {
        ReqBody { repr: Repr::NoBody, replay: Replay::new(replay_limit) }
    }

    /// Re-yields every chunk seen so far, ahead of the live stream.
    ///
    /// Allowed once per request, and only while the replay window has not
    /// overflowed.
    pub fn rewind(&mut self) -> Result<(), ParseError> {
        if self.replay.rewound {
            return Err(ParseError::replay_unavailable("body already replayed once"));
        }
        if self.replay.overflowed {
            return Err(ParseError::replay_unavailable("replay window exceeded"));
        }
        self.replay.rewound = true;
        self.replay.pending = std::mem::take(&mut self.replay.recorded);
        self.replay.recorded_len = 0;
        Ok(())
    }
}

impl Body for ReqBody {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(bytes) = this.replay.pending.pop_front() {
            return Poll::Ready(Some(Ok(Frame::data(bytes))));
        }

        match &mut this.repr {
            Repr::NoBody => Poll::Ready(None),
            Repr::Receiver(receiver) => match Pin::new(receiver).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Some(bytes) = frame.data_ref() {
                        this.replay.record(bytes);
                    }
                    Poll::Ready(Some(Ok(frame)))
                }
                other => other,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        if !self.replay.pending.is_empty() {
            return false;
        }
        match &self.repr {
            Repr::NoBody => true,
            Repr::Receiver(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.repr {
            Repr::NoBody => SizeHint::with_exact(0),
            Repr::Receiver(receiver) => receiver.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;

    fn poll_data(body: &mut ReqBody, cx: &mut Context<'_>) -> Option<Bytes> {
        match Pin::new(body).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => frame.into_data().ok(),
            _ => None,
        }
    }

    #[test]
    fn no_body_ends_immediately() {
        let mut body = ReqBody::no_body(1024);
        let mut cx = Context::from_waker(noop_waker_ref());
        assert!(matches!(Pin::new(&mut body).poll_frame(&mut cx), Poll::Ready(None)));
        assert!(body.is_end_stream());
    }

    #[test]
    fn rewind_replays_recorded_chunks() {
        let mut body = ReqBody::no_body(1024);
        body.replay.record(&Bytes::from_static(b"hello "));
        body.replay.record(&Bytes::from_static(b"world"));

        body.rewind().unwrap();
        let mut cx = Context::from_waker(noop_waker_ref());
        assert_eq!(poll_data(&mut body, &mut cx).unwrap(), Bytes::from_static(b"hello "));
        assert_eq!(poll_data(&mut body, &mut cx).unwrap(), Bytes::from_static(b"world"));
        assert!(matches!(Pin::new(&mut body).poll_frame(&mut cx), Poll::Ready(None)));
    }

    #[test]
    fn second_rewind_is_refused() {
        let mut body = ReqBody::no_body(1024);
        body.replay.record(&Bytes::from_static(b"x"));
        body.rewind().unwrap();
        let err = body.rewind().unwrap_err();
        assert!(matches!(err, ParseError::ReplayUnavailable { .. }));
    }

    #[test]
    fn overflowing_the_window_disables_replay() {
        let mut body = ReqBody::no_body(8);
        body.replay.record(&Bytes::from_static(b"0123"));
        body.replay.record(&Bytes::from_static(b"456789ab"));
        let err = body.rewind().unwrap_err();
        assert!(matches!(err, ParseError::ReplayUnavailable { .. }));
    }
}
