//! Asynchronous sockets on top of the event pool.
//!
//! Every operation attempts its syscall once: `EINTR` retries immediately,
//! `EAGAIN`/`EWOULDBLOCK` suspends the task in the pool for the matching
//! direction and retries on wakeup, anything else surfaces as a typed
//! error. Streams implement `tokio::io::{AsyncRead, AsyncWrite}` so codec
//! framing can run directly on top of them.

use std::cell::RefCell;
use std::future::poll_fn;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::addr::SocketAddr;
use crate::error::{is_interrupted, is_would_block, wrap_io, SocketError};
use crate::poll::{Direction, Interest, PoolHandle, PoolInner, SlotRef};
use crate::socket::{Socket, Type};
use crate::sys::PacketInfo;

const DEFAULT_BACKLOG: i32 = 1024;

/// A non-blocking socket plus its pool registration slots. Shared between
/// the split halves of a stream; the fd is dropped (and the pool told) when
/// the last handle goes away.
struct IoSource {
    socket: Socket,
    pool: Rc<PoolInner>,
    read_slot: RefCell<Option<SlotRef>>,
    write_slot: RefCell<Option<SlotRef>>,
}

impl IoSource {
    fn new(socket: Socket, pool: &PoolHandle) -> Rc<IoSource> {
        Rc::new(IoSource {
            socket,
            pool: pool.inner.clone(),
            read_slot: RefCell::new(None),
            write_slot: RefCell::new(None),
        })
    }

    fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// One attempt-suspend-retry cycle around `op`.
    fn poll_io<T, F>(&self, dir: Direction, cx: &mut Context<'_>, mut op: F) -> Poll<io::Result<T>>
    where
        F: FnMut() -> io::Result<T>,
    {
        let mut slot = match dir {
            Direction::Read => self.read_slot.borrow_mut(),
            Direction::Write => self.write_slot.borrow_mut(),
        };
        loop {
            if slot.is_some() {
                match self.pool.poll_suspend(self.fd(), dir, &mut *slot, cx) {
                    Poll::Ready(Ok(_event)) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => return Poll::Pending,
                }
            }
            match op() {
                Err(e) if is_interrupted(&e) => continue,
                Err(e) if is_would_block(&e) => {
                    match self.pool.poll_suspend(self.fd(), dir, &mut *slot, cx) {
                        Poll::Ready(Ok(_event)) => continue,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                result => return Poll::Ready(result),
            }
        }
    }

    async fn ready_io<T, F>(&self, dir: Direction, ctx: &'static str, mut op: F) -> Result<T, SocketError>
    where
        F: FnMut() -> io::Result<T>,
    {
        poll_fn(|cx| self.poll_io(dir, cx, &mut op))
            .await
            .map_err(|e| wrap_io(ctx, e))
    }

    fn poll_read_buf(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        match self.poll_io(Direction::Read, cx, || self.socket.read(unfilled)) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_write_buf(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_io(Direction::Write, cx, || self.socket.write(buf))
    }
}

impl Drop for IoSource {
    fn drop(&mut self) {
        // wakes anything still parked on this fd with `Disconnected`
        self.pool.drop_fd(self.fd());
    }
}

/// Listening TCP socket.
pub struct TcpListener {
    io: Rc<IoSource>,
}

impl TcpListener {
    /// Binds with `SO_REUSEADDR` (and `SO_NOSIGPIPE` on Darwin) and starts
    /// listening. Port 0 is resolved; see [`TcpListener::local_addr`].
    pub fn bind(addr: &SocketAddr, pool: &PoolHandle) -> Result<TcpListener, SocketError> {
        let socket = Socket::for_addr(addr, Type::Stream)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(DEFAULT_BACKLOG)?;
        Ok(TcpListener { io: IoSource::new(socket, pool) })
    }

    /// The concrete address after bind.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.io.socket.local_addr()
    }

    pub fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Result<(TcpStream, SocketAddr), SocketError>> {
        match self.io.poll_io(Direction::Read, cx, || self.io.socket.accept()) {
            Poll::Ready(Ok((socket, addr))) => {
                trace!(fd = socket.fd(), peer = %addr, "accepted connection");
                let pool = PoolHandle { inner: self.io.pool.clone() };
                Poll::Ready(Ok((TcpStream { io: IoSource::new(socket, &pool) }, addr)))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(wrap_io("accept", e))),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Accepts one connection, suspending until a peer arrives.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), SocketError> {
        poll_fn(|cx| self.poll_accept(cx)).await
    }

    /// Stream of accepted connections; ends when the listener closes.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { listener: self }
    }
}

/// Stream returned by [`TcpListener::incoming`].
pub struct Incoming<'a> {
    listener: &'a TcpListener,
}

impl Stream for Incoming<'_> {
    type Item = Result<(TcpStream, SocketAddr), SocketError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.listener.poll_accept(cx) {
            Poll::Ready(Ok(pair)) => Poll::Ready(Some(Ok(pair))),
            Poll::Ready(Err(SocketError::Disconnected)) | Poll::Ready(Err(SocketError::PoolClosed)) => {
                Poll::Ready(None)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Connected TCP stream.
pub struct TcpStream {
    io: Rc<IoSource>,
}

impl TcpStream {
    /// Non-blocking connect: issues the syscall, suspends until writable,
    /// then checks `SO_ERROR`.
    pub async fn connect(addr: &SocketAddr, pool: &PoolHandle) -> Result<TcpStream, SocketError> {
        let socket = Socket::for_addr(addr, Type::Stream)?;
        match socket.connect(addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || is_would_block(&e) => {}
            Err(e) if is_interrupted(&e) => {}
            Err(e) => return Err(SocketError::syscall("connect", e)),
        }
        let io = IoSource::new(socket, pool);
        // connect completion is signalled by writability, then SO_ERROR
        pool.readiness(io.fd(), Interest::WRITABLE).await?;
        match io.socket.take_error()? {
            None => Ok(TcpStream { io }),
            Some(err) => Err(SocketError::syscall("connect", err)),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.io.socket.local_addr()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        self.io.socket.peer_addr()
    }

    pub fn set_nodelay(&self, on: bool) -> Result<(), SocketError> {
        self.io.socket.set_nodelay(on)
    }

    /// Reads once into `buf`, suspending until data (or EOF) arrives.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.io.ready_io(Direction::Read, "read", || self.io.socket.read(buf)).await
    }

    /// Single-byte read; `None` at EOF.
    pub async fn read_u8(&self) -> Result<Option<u8>, SocketError> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte).await? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Fills `buf` completely; EOF before that is `Disconnected`.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), SocketError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.io.ready_io(Direction::Read, "read", || self.io.socket.read(&mut buf[filled..])).await?;
            if n == 0 {
                return Err(SocketError::Disconnected);
            }
            filled += n;
        }
        Ok(())
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, SocketError> {
        self.io.ready_io(Direction::Write, "write", || self.io.socket.write(buf)).await
    }

    /// Writes the whole buffer, suspending whenever the kernel buffer fills.
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), SocketError> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.io.ready_io(Direction::Write, "write", || self.io.socket.write(&buf[written..])).await?;
            written += n;
        }
        Ok(())
    }

    /// Stream of buffers of at most `suggested` bytes, as they arrive.
    /// Ends at EOF.
    pub fn chunks(&self, suggested: usize) -> ByteChunks<'_> {
        ByteChunks { stream: self, suggested }
    }

    /// Splits into independently usable read and write halves.
    pub fn split(self) -> (ReadHalf, WriteHalf) {
        (ReadHalf { io: self.io.clone() }, WriteHalf { io: self.io })
    }
}

/// Stream of inbound buffers; see [`TcpStream::chunks`].
pub struct ByteChunks<'a> {
    stream: &'a TcpStream,
    suggested: usize,
}

impl Stream for ByteChunks<'_> {
    type Item = Result<Bytes, SocketError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut buf = BytesMut::zeroed(self.suggested);
        match self.stream.io.poll_io(Direction::Read, cx, || self.stream.io.socket.read(&mut buf)) {
            Poll::Ready(Ok(0)) => Poll::Ready(None),
            Poll::Ready(Ok(n)) => {
                buf.truncate(n);
                Poll::Ready(Some(Ok(buf.freeze())))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(wrap_io("read", e)))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Read half of a split [`TcpStream`].
pub struct ReadHalf {
    io: Rc<IoSource>,
}

/// Write half of a split [`TcpStream`].
pub struct WriteHalf {
    io: Rc<IoSource>,
}

impl ReadHalf {
    /// Reassembles the stream from its two halves.
    ///
    /// Panics when the halves come from different streams.
    pub fn reunite(self, write: WriteHalf) -> TcpStream {
        assert!(Rc::ptr_eq(&self.io, &write.io), "reunite called with halves of different streams");
        drop(write);
        TcpStream { io: self.io }
    }
}

macro_rules! impl_async_read {
    ($ty:ty) => {
        impl AsyncRead for $ty {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                self.io.poll_read_buf(cx, buf)
            }
        }
    };
}

macro_rules! impl_async_write {
    ($ty:ty) => {
        impl AsyncWrite for $ty {
            fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
                self.io.poll_write_buf(cx, buf)
            }

            fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                Poll::Ready(Ok(()))
            }

            fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
                let _ = self.io.socket.shutdown_write();
                Poll::Ready(Ok(()))
            }
        }
    };
}

impl_async_read!(TcpStream);
impl_async_write!(TcpStream);
impl_async_read!(ReadHalf);
impl_async_write!(WriteHalf);

impl std::os::fd::AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.io.fd()
    }
}

impl std::os::fd::AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.io.fd()
    }
}

/// Listening UNIX-domain socket. The socket file is unlinked on drop.
pub struct UnixListener {
    io: Rc<IoSource>,
    path: PathBuf,
}

impl UnixListener {
    pub fn bind<P: AsRef<Path>>(path: P, pool: &PoolHandle) -> Result<UnixListener, SocketError> {
        let addr = SocketAddr::unix(path.as_ref());
        let socket = Socket::for_addr(&addr, Type::Stream)?;
        socket.bind(&addr)?;
        socket.listen(DEFAULT_BACKLOG)?;
        Ok(UnixListener { io: IoSource::new(socket, pool), path: path.as_ref().to_path_buf() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.io.socket.local_addr()
    }

    pub async fn accept(&self) -> Result<(UnixStream, SocketAddr), SocketError> {
        let pool = PoolHandle { inner: self.io.pool.clone() };
        let (socket, addr) = self
            .io
            .ready_io(Direction::Read, "accept", || self.io.socket.accept())
            .await?;
        Ok((UnixStream { io: IoSource::new(socket, &pool) }, addr))
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        if let Ok(cpath) = std::ffi::CString::new(path_bytes(&self.path)) {
            let _ = crate::sys::unlink(&cpath);
        }
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

/// Connected UNIX-domain stream.
pub struct UnixStream {
    io: Rc<IoSource>,
}

impl UnixStream {
    pub async fn connect<P: AsRef<Path>>(path: P, pool: &PoolHandle) -> Result<UnixStream, SocketError> {
        let addr = SocketAddr::unix(path.as_ref());
        let socket = Socket::for_addr(&addr, Type::Stream)?;
        match socket.connect(&addr) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || is_would_block(&e) => {}
            Err(e) if is_interrupted(&e) => {}
            Err(e) => return Err(SocketError::syscall("connect", e)),
        }
        let io = IoSource::new(socket, pool);
        pool.readiness(io.fd(), Interest::WRITABLE).await?;
        match io.socket.take_error()? {
            None => Ok(UnixStream { io }),
            Some(err) => Err(SocketError::syscall("connect", err)),
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.io.ready_io(Direction::Read, "read", || self.io.socket.read(buf)).await
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<(), SocketError> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.io.ready_io(Direction::Write, "write", || self.io.socket.write(&buf[written..])).await?;
            written += n;
        }
        Ok(())
    }
}

impl_async_read!(UnixStream);
impl_async_write!(UnixStream);

/// Datagram socket with `recvmsg` support for packet-info control data.
pub struct UdpSocket {
    io: Rc<IoSource>,
}

/// One received datagram, with destination info when the socket opted in
/// via [`UdpSocket::set_recv_pktinfo`].
#[derive(Debug)]
pub struct Datagram {
    pub payload: Bytes,
    pub peer: SocketAddr,
    pub pktinfo: Option<PacketInfo>,
}

impl UdpSocket {
    pub fn bind(addr: &SocketAddr, pool: &PoolHandle) -> Result<UdpSocket, SocketError> {
        let socket = Socket::for_addr(addr, Type::Datagram)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(UdpSocket { io: IoSource::new(socket, pool) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.io.socket.local_addr()
    }

    pub fn set_recv_pktinfo(&self, ipv6: bool, on: bool) -> Result<(), SocketError> {
        self.io.socket.set_recv_pktinfo(ipv6, on)
    }

    pub async fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize, SocketError> {
        self.io.ready_io(Direction::Write, "sendto", || self.io.socket.send_to(buf, addr)).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        self.io.ready_io(Direction::Read, "recvfrom", || self.io.socket.recv_from(buf)).await
    }

    /// Receives one datagram together with its control-message payload.
    pub async fn recv_msg(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, Option<PacketInfo>), SocketError> {
        self.io.ready_io(Direction::Read, "recvmsg", || self.io.socket.recv_msg(buf)).await
    }

    pub async fn send_msg(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize, SocketError> {
        self.io.ready_io(Direction::Write, "sendmsg", || self.io.socket.send_msg(buf, addr)).await
    }

    /// Stream of received datagrams; `capacity` bounds each payload.
    pub fn datagrams(&self, capacity: usize) -> Datagrams<'_> {
        Datagrams { socket: self, capacity }
    }
}

/// Stream returned by [`UdpSocket::datagrams`].
pub struct Datagrams<'a> {
    socket: &'a UdpSocket,
    capacity: usize,
}

impl Stream for Datagrams<'_> {
    type Item = Result<Datagram, SocketError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut buf = BytesMut::zeroed(self.capacity);
        let io = &self.socket.io;
        match io.poll_io(Direction::Read, cx, || io.socket.recv_msg(&mut buf)) {
            Poll::Ready(Ok((n, peer, pktinfo))) => {
                buf.truncate(n);
                Poll::Ready(Some(Ok(Datagram { payload: buf.freeze(), peer, pktinfo })))
            }
            Poll::Ready(Err(e)) => match wrap_io("recvmsg", e) {
                SocketError::Disconnected | SocketError::PoolClosed => Poll::Ready(None),
                err => Poll::Ready(Some(Err(err))),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}
