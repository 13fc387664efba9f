//! Protocol upgrades (101 Switching Protocols).
//!
//! A handler opts in by returning a 101 response carrying an [`OnUpgrade`]
//! in its extensions. After the 101 head is written the driver stops
//! framing HTTP, hands the raw stream (plus any bytes it had already read
//! ahead) to the callback, and leaves the connection loop without closing.

use bytes::Bytes;
use futures::future::LocalBoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// The raw connection surrendered to an upgrade callback.
pub struct Upgraded {
    reader: Box<dyn AsyncRead + Unpin>,
    writer: Box<dyn AsyncWrite + Unpin>,
    /// Bytes the HTTP parser had read past the request; consume these
    /// before reading from the stream.
    read_ahead: Bytes,
}

impl Upgraded {
    pub(crate) fn new(
        reader: Box<dyn AsyncRead + Unpin>,
        writer: Box<dyn AsyncWrite + Unpin>,
        read_ahead: Bytes,
    ) -> Upgraded {
        Upgraded { reader, writer, read_ahead }
    }

    pub fn read_ahead(&self) -> &Bytes {
        &self.read_ahead
    }

    pub fn into_parts(self) -> (Box<dyn AsyncRead + Unpin>, Box<dyn AsyncWrite + Unpin>, Bytes) {
        (self.reader, self.writer, self.read_ahead)
    }
}

type UpgradeFn = Box<dyn FnOnce(Upgraded) -> LocalBoxFuture<'static, ()> + Send + Sync>;

/// Response extension carrying the upgrade callback.
///
/// Clonable because `http::Extensions` demands it; clones share one
/// callback and the first `handle` call takes it.
#[derive(Clone)]
pub struct OnUpgrade {
    callback: std::sync::Arc<std::sync::Mutex<Option<UpgradeFn>>>,
}

impl OnUpgrade {
    /// Wraps a callback that takes over the connection. The future it
    /// returns runs in place of the connection loop.
    pub fn new<F, Fut>(callback: F) -> OnUpgrade
    where
        F: FnOnce(Upgraded) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + 'static,
    {
        let callback: UpgradeFn = Box::new(move |upgraded| Box::pin(callback(upgraded)));
        OnUpgrade { callback: std::sync::Arc::new(std::sync::Mutex::new(Some(callback))) }
    }

    pub(crate) fn handle(self, upgraded: Upgraded) -> Option<LocalBoxFuture<'static, ()>> {
        self.callback.lock().unwrap().take().map(|callback| callback(upgraded))
    }
}

impl std::fmt::Debug for OnUpgrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnUpgrade").finish_non_exhaustive()
    }
}
