use bytes::Bytes;
use futures::{channel::mpsc, Sink, SinkExt, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::error;

use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead};

pub(crate) fn channel<S>(payload_stream: &mut S, payload_size: PayloadSize) -> (BodySender<'_, S>, BodyReceiver)
where
    S: Stream<Item = Result<Message<(RequestHead, PayloadSize)>, ParseError>> + Unpin,
{
    let (signal_sender, signal_receiver) = mpsc::channel(8);
    let (data_sender, data_receiver) = mpsc::channel(8);
    (
        BodySender { payload_stream, signal_receiver, data_sender, eof: false },
        BodyReceiver { signal_sender, data_receiver, payload_size, in_flight: false },
    )
}

pub(crate) enum BodySignal {
    RequestData,
    #[allow(dead_code)]
    Enough,
}

/// Connection-side end: pulls payload items off the decoded stream on
/// demand and pushes them to the handler's [`BodyReceiver`].
pub(crate) struct BodySender<'conn, S> {
    payload_stream: &'conn mut S,
    signal_receiver: mpsc::Receiver<BodySignal>,
    data_sender: mpsc::Sender<Result<PayloadItem, ParseError>>,
    eof: bool,
}

impl<'conn, S> BodySender<'conn, S>
where
    S: Stream<Item = Result<Message<(RequestHead, PayloadSize)>, ParseError>> + Unpin,
{
    /// Serves data requests until the body ends or the receiver goes away,
    /// then drains whatever is still on the wire.
    pub(crate) async fn relay(&mut self) -> Result<(), ParseError> {
        if self.eof {
            return Ok(());
        }

        while let Some(signal) = self.signal_receiver.next().await {
            match signal {
                BodySignal::RequestData => {
                    let item = match self.read_item().await {
                        Ok(item) => item,
                        Err(e) => {
                            error!("failed reading request body: {e}");
                            let reason = e.to_string();
                            if self.data_sender.send(Err(e)).await.is_err() {
                                error!("body receiver dropped while delivering error");
                            }
                            return Err(ParseError::invalid_body(reason));
                        }
                    };
                    self.eof = item.is_eof();
                    if self.data_sender.send(Ok(item)).await.is_err() {
                        // the handler dropped its body; finish by draining
                        break;
                    }
                    if self.eof {
                        return Ok(());
                    }
                }
                BodySignal::Enough => break,
            }
        }

        self.drain().await
    }

    async fn read_item(&mut self) -> Result<PayloadItem, ParseError> {
        match self.payload_stream.next().await {
            Some(Ok(Message::Payload(item))) => Ok(item),
            Some(Ok(Message::Head(_))) => {
                Err(ParseError::invalid_body("request head arrived inside a body"))
            }
            Some(Err(e)) => Err(e),
            None => Err(ParseError::invalid_body("connection closed inside a body")),
        }
    }

    /// Discards unread body bytes so the connection can be reused.
    pub(crate) async fn drain(&mut self) -> Result<(), ParseError> {
        while !self.eof {
            let item = self.read_item().await?;
            self.eof = item.is_eof();
        }
        Ok(())
    }
}

/// Handler-side end; implements `http_body::Body`.
#[derive(Debug)]
pub(crate) struct BodyReceiver {
    signal_sender: mpsc::Sender<BodySignal>,
    data_receiver: mpsc::Receiver<Result<PayloadItem, ParseError>>,
    payload_size: PayloadSize,
    in_flight: bool,
}

impl Body for BodyReceiver {
    type Data = Bytes;
    type Error = ParseError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if !this.in_flight {
            match Pin::new(&mut this.signal_sender).poll_ready(cx) {
                Poll::Ready(Ok(())) => {
                    if Pin::new(&mut this.signal_sender).start_send(BodySignal::RequestData).is_err() {
                        return Poll::Ready(Some(Err(ParseError::invalid_body("body channel closed"))));
                    }
                    this.in_flight = true;
                }
                Poll::Ready(Err(_)) => {
                    return Poll::Ready(Some(Err(ParseError::invalid_body("body channel closed"))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }

        match this.data_receiver.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(PayloadItem::Chunk(bytes)))) => {
                this.in_flight = false;
                Poll::Ready(Some(Ok(Frame::data(bytes))))
            }
            Poll::Ready(Some(Ok(PayloadItem::Eof))) => {
                this.in_flight = false;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                this.in_flight = false;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.in_flight = false;
                Poll::Ready(Some(Err(ParseError::invalid_body("body channel closed mid-stream"))))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.payload_size {
            PayloadSize::Length(length) => SizeHint::with_exact(length),
            PayloadSize::Chunked => SizeHint::new(),
            PayloadSize::Empty => SizeHint::with_exact(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use futures::FutureExt;

    #[test]
    fn receiver_requests_once_until_data_arrives() {
        let (signal_sender, mut signal_receiver) = mpsc::channel(8);
        let (mut data_sender, data_receiver) = mpsc::channel(8);
        let mut receiver =
            BodyReceiver { signal_sender, data_receiver, payload_size: PayloadSize::Chunked, in_flight: false };

        let mut cx = Context::from_waker(noop_waker_ref());

        assert!(Pin::new(&mut receiver).poll_frame(&mut cx).is_pending());
        assert!(matches!(signal_receiver.next().now_or_never(), Some(Some(BodySignal::RequestData))));

        // no second signal while the first is outstanding
        assert!(Pin::new(&mut receiver).poll_frame(&mut cx).is_pending());
        assert!(signal_receiver.next().now_or_never().is_none());

        data_sender.try_send(Ok(PayloadItem::Chunk(Bytes::from_static(b"hi")))).unwrap();
        match Pin::new(&mut receiver).poll_frame(&mut cx) {
            Poll::Ready(Some(Ok(frame))) => {
                assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"hi"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(Pin::new(&mut receiver).poll_frame(&mut cx).is_pending());
        data_sender.try_send(Ok(PayloadItem::Eof)).unwrap();
        assert!(matches!(Pin::new(&mut receiver).poll_frame(&mut cx), Poll::Ready(None)));
    }
}
