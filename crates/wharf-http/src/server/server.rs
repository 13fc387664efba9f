use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use http::{Request, Response};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use wharf_io::net::{TcpListener, TcpStream};
use wharf_io::{JoinHandle, PoolHandle, SocketAddr, SocketError};

use crate::connection::HttpConnection;
use crate::handler::{BoxError, Handler, RequestHandler};
use crate::protocol::body::ReqBody;
use crate::protocol::{RequestHead, ResponseBody};
use crate::router::{Route, Router, Unhandled};
use crate::server::shutdown::Shutdown;
use crate::server::ServerConfig;

/// Errors surfaced by [`Server::run`] and [`Server::stop`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// The HTTP server: accept loop, route registration surface, connection
/// supervision and graceful shutdown.
///
/// Cloning is cheap; all clones share one server. Routes may be added
/// while the server runs and take effect for subsequent requests.
#[derive(Clone)]
pub struct Server {
    inner: Rc<Inner>,
}

struct Inner {
    config: ServerConfig,
    pool: PoolHandle,
    router: RefCell<Router>,
    running: Cell<bool>,
    listening: RefCell<Option<SocketAddr>>,
    /// Tells live connections to finish their in-flight request and exit.
    drain: Shutdown,
    /// Ends the accept loop.
    accept_shutdown: Shutdown,
    /// Notified once `run` has fully returned.
    stopped: Shutdown,
    conns: ConnSet,
}

impl Server {
    pub fn new(config: ServerConfig, pool: PoolHandle) -> Server {
        let router = if config.case_insensitive_routes { Router::new().case_insensitive() } else { Router::new() };
        Server {
            inner: Rc::new(Inner {
                config,
                pool,
                router: RefCell::new(router),
                running: Cell::new(false),
                listening: RefCell::new(None),
                drain: Shutdown::new(),
                accept_shutdown: Shutdown::new(),
                stopped: Shutdown::new(),
                conns: ConnSet::default(),
            }),
        }
    }

    /// Registers a route. Synchronized with the accept loop: requests
    /// already being served keep the table they matched against.
    pub fn route<H: RequestHandler + 'static>(&self, route: Route, handler: H) {
        self.inner.router.borrow_mut().add(route, handler);
    }

    /// The concrete bound address, available once `run` has bound.
    pub fn listening_address(&self) -> Option<SocketAddr> {
        self.inner.listening.borrow().clone()
    }

    /// Binds, listens and serves until [`Server::stop`] or a terminal
    /// listener error. Fails fast when called while already running.
    pub async fn run(&self) -> Result<(), ServerError> {
        if self.inner.running.replace(true) {
            return Err(ServerError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.inner.config.address, &self.inner.pool)?;
        let local = listener.local_addr()?;
        *self.inner.listening.borrow_mut() = Some(local.clone());
        info!(address = %local, "listening");

        let result = self.accept_loop(&listener).await;
        drop(listener);

        // let every connection drain before reporting the server stopped
        while !self.inner.conns.is_empty() {
            self.inner.conns.changed().await;
        }
        self.inner.stopped.notify();
        info!("server stopped");
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<(), ServerError> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.accept_shutdown.notified() => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "connection open");
                    self.spawn_connection(stream, peer);
                }
                Err(SocketError::Disconnected) | Err(SocketError::PoolClosed) => {
                    info!("listener closed; accept loop ends");
                    return Ok(());
                }
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("transient accept failure: {e}");
                    continue;
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = self.inner.conns.next_id();
        let server = self.clone();
        let handler = Rc::new(self.clone());
        let options = self.inner.config.driver_options();
        let drain = self.inner.drain.clone();

        let handle = wharf_io::spawn(async move {
            let (reader, writer) = stream.split();
            let connection = HttpConnection::with_options(reader, writer, &options);
            match connection.process(handler, &options, &drain).await {
                Ok(()) => debug!(peer = %peer, "connection closed"),
                Err(e) => warn!(peer = %peer, "connection error: {e}"),
            }
            server.inner.conns.remove(id);
        });
        self.inner.conns.insert(id, handle);
    }

    /// Stops accepting, signals every live connection to finish its
    /// in-flight request, waits up to `timeout`, then cancels stragglers.
    /// Returns once `run` has returned.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ServerError> {
        if !self.inner.running.get() {
            return Ok(());
        }
        info!(?timeout, "stopping server");
        self.inner.accept_shutdown.notify();
        self.inner.drain.notify();

        if wharf_io::timeout(timeout, self.inner.stopped.notified()).await.is_err() {
            warn!(remaining = self.inner.conns.len(), "drain deadline expired; cancelling connections");
            self.inner.conns.abort_all();
            self.inner.stopped.notified().await;
        }
        Ok(())
    }
}

/// Routing is the server's own request handler: first matching route wins,
/// no match surfaces [`Unhandled`] for the driver's 404.
impl Handler for Server {
    type RespBody = ResponseBody;
    type Error = BoxError;
    type Fut<'fut> = LocalBoxFuture<'fut, Result<Response<ResponseBody>, BoxError>>;

    fn call(&self, req: Request<ReqBody>) -> Self::Fut<'_> {
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let head = RequestHead::from(parts);
            info!(method = %head.method(), path = head.uri().path(), "request");

            let dispatched = {
                let router = self.inner.router.borrow();
                router.dispatch(&head)?
            };

            match dispatched {
                Some((item, params)) => {
                    let mut request = head.body(body);
                    request.extensions_mut().insert(params);
                    item.handler().invoke(request).await
                }
                None => Err(Unhandled.into()),
            }
        })
    }
}

fn is_transient_accept_error(e: &SocketError) -> bool {
    matches!(
        e.errno(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ECONNABORTED) | Some(libc::EAGAIN)
    )
}

/// Live connection set with a change signal for the drain wait.
#[derive(Default)]
struct ConnSet {
    map: RefCell<HashMap<u64, JoinHandle<()>>>,
    next: Cell<u64>,
    generation: Cell<u64>,
    wakers: RefCell<Vec<Waker>>,
}

impl ConnSet {
    fn next_id(&self) -> u64 {
        let id = self.next.get();
        self.next.set(id + 1);
        id
    }

    fn insert(&self, id: u64, handle: JoinHandle<()>) {
        self.map.borrow_mut().insert(id, handle);
    }

    fn remove(&self, id: u64) {
        if self.map.borrow_mut().remove(&id).is_some() {
            self.bump();
        }
    }

    fn abort_all(&self) {
        let mut map = self.map.borrow_mut();
        for (_, mut handle) in map.drain() {
            handle.abort();
        }
        drop(map);
        self.bump();
    }

    fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    fn len(&self) -> usize {
        self.map.borrow().len()
    }

    fn bump(&self) {
        self.generation.set(self.generation.get() + 1);
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    /// Resolves at the next membership change.
    fn changed(&self) -> Changed<'_> {
        Changed { set: self, seen: self.generation.get() }
    }
}

struct Changed<'a> {
    set: &'a ConnSet,
    seen: u64,
}

impl std::future::Future for Changed<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.set.generation.get() != self.seen {
            return Poll::Ready(());
        }
        let mut wakers = self.set.wakers.borrow_mut();
        if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
