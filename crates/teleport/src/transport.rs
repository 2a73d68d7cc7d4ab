//! Byte transports: boxed duplex streams, dialing and listening.
//!
//! The engine runs over any reliable duplex byte stream. TCP is wired up
//! here; anything else (unix sockets, in-process pipes) plugs in through
//! the same [`Connection`] box, either via a custom [`DialFn`] on the
//! client or a [`Listener`] implementation on the server.
//!
//! [`InmemoryAddr`] provides an in-process transport over
//! [`tokio::io::duplex`] pipes, mainly for tests: servers bind to it,
//! clients dial it, and dropping the bound listener makes dials fail like
//! a dead host would.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A reliable duplex byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> Transport for T {}

/// A boxed duplex byte stream, as produced by dialing or accepting.
pub type Connection = Box<dyn Transport>;

/// A dial function: resolves an address to an established [`Connection`].
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, io::Result<Connection>> + Send + Sync>;

/// Wraps an async closure into a [`DialFn`].
pub fn dial_fn<F, Fut>(f: F) -> DialFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<Connection>> + Send + 'static,
{
    Arc::new(move |addr: String| -> BoxFuture<'static, io::Result<Connection>> {
        Box::pin(f(addr))
    })
}

/// The default dial: TCP with `TCP_NODELAY`.
///
/// Nagle stays off because the engine does its own batching; flushes are
/// supposed to hit the wire when the engine says so.
pub(crate) fn tcp_dial() -> DialFn {
    dial_fn(|addr| async move {
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream) as Connection)
    })
}

/// Something a [`Server`](crate::Server) can accept connections from.
pub trait Listener: Send {
    /// Accepts the next connection.
    ///
    /// `Ok(None)` means the listener was closed and serving should end
    /// normally. Errors are either transient (serving retries after a
    /// short sleep) or terminal, as judged by the server loop.
    fn accept(&mut self) -> impl Future<Output = io::Result<Option<Connection>>> + Send;
}

impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<Option<Connection>> {
        let (stream, _remote_addr) = TcpListener::accept(self).await?;
        stream.set_nodelay(true)?;
        Ok(Some(Box::new(stream)))
    }
}

const INMEMORY_PIPE_CAPACITY: usize = 64 * 1024;

type PipeSender = mpsc::UnboundedSender<DuplexStream>;

/// An in-process "address" connecting [`InmemoryListener`]s with dialers.
///
/// Binding replaces whatever listener was bound before, like rebinding a
/// port after a restart. Dials fail with `ConnectionRefused` while nothing
/// is bound or after the bound listener was dropped.
#[derive(Clone, Default)]
pub struct InmemoryAddr {
    slot: Arc<Mutex<Option<PipeSender>>>,
}

impl InmemoryAddr {
    /// Creates a fresh address with nothing bound to it.
    pub fn new() -> Self {
        Default::default()
    }

    /// Binds a new listener to this address.
    pub fn bind(&self) -> InmemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot.lock().expect("inmemory addr lock poisoned") = Some(tx);
        InmemoryListener { conns: rx }
    }

    /// Connects to whatever is currently bound.
    pub fn dial(&self) -> io::Result<Connection> {
        let (local, remote) = tokio::io::duplex(INMEMORY_PIPE_CAPACITY);
        let slot = self.slot.lock().expect("inmemory addr lock poisoned");
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, "nothing listening");
        let tx = slot.as_ref().ok_or_else(refused)?;
        tx.send(remote).map_err(|_| refused())?;
        Ok(Box::new(local))
    }

    /// A [`DialFn`] for plugging this address into a
    /// [`ClientConfig`](crate::ClientConfig).
    pub fn dial_fn(&self) -> DialFn {
        let addr = self.clone();
        dial_fn(move |_| {
            let addr = addr.clone();
            async move { addr.dial() }
        })
    }
}

/// The listening side of an [`InmemoryAddr`].
pub struct InmemoryListener {
    conns: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Listener for InmemoryListener {
    async fn accept(&mut self) -> io::Result<Option<Connection>> {
        match self.conns.recv().await {
            Some(stream) => Ok(Some(Box::new(stream))),
            // the address rebound to a newer listener; treat as closed
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn inmemory_dial_reaches_listener() {
        let addr = InmemoryAddr::new();
        let mut listener = addr.bind();

        let mut client_side = addr.dial().unwrap();
        let mut server_side = listener.accept().await.unwrap().unwrap();

        client_side.write_all(b"ping").await.unwrap();
        client_side.flush().await.unwrap();

        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn dial_without_listener_is_refused() {
        let addr = InmemoryAddr::new();
        let err = addr.dial().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn dial_after_listener_dropped_is_refused() {
        let addr = InmemoryAddr::new();
        let listener = addr.bind();
        drop(listener);
        let err = addr.dial().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn rebinding_replaces_the_listener() {
        let addr = InmemoryAddr::new();
        let _old = addr.bind();
        let mut new = addr.bind();

        addr.dial().unwrap();
        assert!(new.accept().await.unwrap().is_some());
    }
}
