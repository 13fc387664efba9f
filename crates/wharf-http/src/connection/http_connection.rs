use std::fmt::Display;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONNECTION;
use http::{Response, StatusCode, Version};
use http_body::Body;
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use wharf_io::time::timeout;

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::handler::Handler;
use crate::protocol::body::ReqBody;
use crate::protocol::{
    HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHead, ResponseHead, SendError,
};
use crate::router::Unhandled;
use crate::server::shutdown::Shutdown;

use super::upgrade::{OnUpgrade, Upgraded};

/// Per-connection driver knobs, filled in from the server configuration.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Handler deadline per request; 500 and close when exceeded.
    pub handler_timeout: Duration,
    /// Optional deadline for reading a request head once bytes arrived;
    /// 408 and close when exceeded.
    pub read_timeout: Option<Duration>,
    /// Parser buffer ceiling per connection.
    pub buffer_size: usize,
    /// Request head cap; 413 beyond it.
    pub max_head_bytes: usize,
    /// Replay window for request bodies.
    pub replay_limit: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(15),
            read_timeout: None,
            buffer_size: 4096,
            max_head_bytes: crate::codec::DEFAULT_MAX_HEAD_BYTES,
            replay_limit: 1024 * 1024,
        }
    }
}

enum Served {
    KeepAlive,
    Close,
    Upgrade(OnUpgrade),
}

enum HeadEvent<T> {
    Message(T),
    Shutdown,
    TimedOut,
}

/// The per-connection request/response loop.
///
/// Reads one request at a time through the incremental decoder, dispatches
/// it, streams the response back, and iterates while keep-alive holds.
/// Failure policy: parse error → 400 (413 for the size caps) and close;
/// handler timeout or error → 500 and close; no route → 404; a 101
/// response with an [`OnUpgrade`] extension hands the socket over instead
/// of closing it.
pub struct HttpConnection<R, W> {
    framed_read: FramedRead<R, RequestDecoder>,
    framed_write: FramedWrite<W, ResponseEncoder>,
}

impl<R, W> HttpConnection<R, W>
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self::with_options(reader, writer, &DriverOptions::default())
    }

    pub fn with_options(reader: R, writer: W, options: &DriverOptions) -> Self {
        Self {
            framed_read: FramedRead::with_capacity(
                reader,
                RequestDecoder::with_max_head_bytes(options.max_head_bytes),
                options.buffer_size,
            ),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
        }
    }

    /// Serves requests until the peer goes away, an error closes the
    /// connection, shutdown drains it, or a handler upgrades it.
    pub async fn process<H>(mut self, handler: Rc<H>, options: &DriverOptions, shutdown: &Shutdown) -> Result<(), HttpError>
    where
        H: Handler,
        H::RespBody: Body<Data = Bytes> + Unpin,
        <H::RespBody as Body>::Error: Display,
    {
        loop {
            let wait_head = async {
                tokio::select! {
                    biased;
                    message = self.framed_read.next() => HeadEvent::Message(message),
                    _ = shutdown.notified() => HeadEvent::Shutdown,
                }
            };
            let event = match options.read_timeout {
                Some(limit) => timeout(limit, wait_head).await.unwrap_or(HeadEvent::TimedOut),
                None => wait_head.await,
            };

            let message = match event {
                HeadEvent::Message(message) => message,
                HeadEvent::Shutdown => {
                    if self.framed_read.read_buffer().is_empty() {
                        debug!("closing idle connection on shutdown");
                        return Ok(());
                    }
                    // a request is already on the wire; finish it
                    self.framed_read.next().await
                }
                HeadEvent::TimedOut => {
                    if self.framed_read.read_buffer().is_empty() {
                        debug!("closing idle connection after read timeout");
                        return Ok(());
                    }
                    warn!("timed out reading a request head");
                    write_error(&mut self.framed_write, StatusCode::REQUEST_TIMEOUT).await?;
                    return Ok(());
                }
            };

            match message {
                Some(Ok(Message::Head((head, payload_size)))) => {
                    match self.serve_one(head, payload_size, &handler, options, shutdown.is_notified()).await? {
                        Served::KeepAlive => continue,
                        Served::Close => return Ok(()),
                        Served::Upgrade(on_upgrade) => {
                            self.hand_over(on_upgrade).await;
                            return Ok(());
                        }
                    }
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("payload item while expecting a request head");
                    write_error(&mut self.framed_write, StatusCode::BAD_REQUEST).await?;
                    return Err(ParseError::invalid_body("payload item while expecting a head").into());
                }

                Some(Err(e)) => {
                    warn!("failed to parse request: {e}");
                    write_error(&mut self.framed_write, e.status()).await?;
                    return Err(e.into());
                }

                None => {
                    info!("peer closed the connection");
                    return Ok(());
                }
            }
        }
    }

    async fn serve_one<H>(
        &mut self,
        head: RequestHead,
        payload_size: PayloadSize,
        handler: &Rc<H>,
        options: &DriverOptions,
        draining: bool,
    ) -> Result<Served, HttpError>
    where
        H: Handler,
        H::RespBody: Body<Data = Bytes> + Unpin,
        <H::RespBody as Body>::Error: Display,
    {
        let mut keep_alive = head.keep_alive() && !draining;
        let http10 = head.version() == Version::HTTP_10;

        if head.expects_continue() {
            let writer = self.framed_write.get_mut();
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
            writer.flush().await.map_err(SendError::io)?;
            debug!("sent 100 continue");
        }

        let (req_body, body_sender) = ReqBody::create(&mut self.framed_read, payload_size, options.replay_limit);
        let request = head.body(req_body);

        let handler = handler.clone();
        // the handler runs concurrently with body streaming: it may be
        // waiting for chunks only this loop can feed it, and the unread
        // remainder must be drained before the response goes out
        let work = async move {
            match body_sender {
                None => Ok(handler.call(request).await),
                Some(mut sender) => {
                    let mut relay_result = Ok(());
                    let response = {
                        tokio::pin! {
                            let handle_future = handler.call(request);
                            let relay_future = sender.relay();
                        }
                        let mut relay_done = false;
                        loop {
                            tokio::select! {
                                biased;
                                response = &mut handle_future => break response,
                                result = &mut relay_future, if !relay_done => {
                                    relay_done = true;
                                    relay_result = result;
                                }
                            }
                        }
                    };
                    relay_result?;
                    sender.drain().await?;
                    Ok::<_, ParseError>(response)
                }
            }
        };

        let response_result = match timeout(options.handler_timeout, work).await {
            Ok(Ok(response_result)) => response_result,
            Ok(Err(body_error)) => {
                warn!("request body failed: {body_error}");
                write_error(&mut self.framed_write, body_error.status()).await?;
                return Err(body_error.into());
            }
            Err(_elapsed) => {
                warn!(timeout = ?options.handler_timeout, "handler exceeded the request timeout");
                write_error(&mut self.framed_write, StatusCode::INTERNAL_SERVER_ERROR).await?;
                return Ok(Served::Close);
            }
        };

        let mut response = match response_result {
            Ok(response) => response,
            Err(e) => {
                let e: crate::handler::BoxError = e.into();
                if e.downcast_ref::<Unhandled>().is_some() {
                    debug!("no route matched; answering 404");
                    write_error_keeping(&mut self.framed_write, StatusCode::NOT_FOUND, keep_alive, http10).await?;
                    return Ok(if keep_alive { Served::KeepAlive } else { Served::Close });
                }
                error!("handler failed: {e}");
                write_error(&mut self.framed_write, StatusCode::INTERNAL_SERVER_ERROR).await?;
                return Ok(Served::Close);
            }
        };

        // protocol upgrade: write the 101 head and surrender the socket
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(on_upgrade) = response.extensions_mut().remove::<OnUpgrade>() {
                let (parts, _body) = response.into_parts();
                let head = ResponseHead::from_parts(parts, ());
                self.framed_write.send(Message::<_, Bytes>::Head((head, PayloadSize::Empty))).await?;
                info!("connection upgraded");
                return Ok(Served::Upgrade(on_upgrade));
            }
        }

        // a handler may force close; otherwise echo the negotiated mode
        if connection_says_close(&response) {
            keep_alive = false;
        }
        let connection_value = if !keep_alive {
            Some("close")
        } else if http10 {
            Some("keep-alive")
        } else {
            None
        };
        if let Some(value) = connection_value {
            response.headers_mut().insert(CONNECTION, value.parse().unwrap());
        }

        write_response(&mut self.framed_write, response).await?;

        Ok(if keep_alive { Served::KeepAlive } else { Served::Close })
    }

    async fn hand_over(self, on_upgrade: OnUpgrade) {
        let parts = self.framed_read.into_parts();
        let read_ahead = parts.read_buf.freeze();
        let reader = parts.io;
        let writer = self.framed_write.into_inner();
        let upgraded = Upgraded::new(Box::new(reader), Box::new(writer), read_ahead);
        if let Some(callback) = on_upgrade.handle(upgraded) {
            callback.await;
        }
    }
}

fn connection_says_close<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")))
        .unwrap_or(false)
}

/// Streams one response: head first, then each body frame as it is
/// produced, flushing per chunk so nothing buffers beyond a single frame.
async fn write_response<W, B>(
    framed_write: &mut FramedWrite<W, ResponseEncoder>,
    response: Response<B>,
) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
    B: Body<Data = Bytes> + Unpin,
    B::Error: Display,
{
    let (parts, mut body) = response.into_parts();

    let payload_size = match body.size_hint().exact() {
        Some(0) => PayloadSize::Empty,
        Some(length) => PayloadSize::Length(length),
        None => PayloadSize::Chunked,
    };

    let head = ResponseHead::from_parts(parts, ());
    framed_write.feed(Message::<_, Bytes>::Head((head, payload_size))).await?;

    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                let item = frame
                    .into_data()
                    .map(PayloadItem::Chunk)
                    .map_err(|_| SendError::invalid_body("non-data frame in response body"))?;
                framed_write.send(Message::Payload(item)).await?;
            }
            Some(Err(e)) => {
                return Err(SendError::invalid_body(format!("response body failed: {e}")).into());
            }
            None => {
                framed_write.feed(Message::<_, Bytes>::Payload(PayloadItem::Eof)).await?;
                framed_write.flush().await?;
                return Ok(());
            }
        }
    }
}

async fn write_error<W>(framed_write: &mut FramedWrite<W, ResponseEncoder>, status: StatusCode) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    write_error_keeping(framed_write, status, false, false).await
}

async fn write_error_keeping<W>(
    framed_write: &mut FramedWrite<W, ResponseEncoder>,
    status: StatusCode,
    keep_alive: bool,
    http10: bool,
) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    let mut builder = Response::builder().status(status);
    if !keep_alive {
        builder = builder.header(CONNECTION, "close");
    } else if http10 {
        builder = builder.header(CONNECTION, "keep-alive");
    }
    let head = builder.body(()).unwrap();
    framed_write.send(Message::<_, Bytes>::Head((head, PayloadSize::Empty))).await?;
    framed_write.send(Message::<_, Bytes>::Payload(PayloadItem::Eof)).await?;
    Ok(())
}
