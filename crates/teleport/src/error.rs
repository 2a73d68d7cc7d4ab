//! Error types for the engine.
//!
//! [`Error`] is what callers of [`Client`](crate::Client) observe. It is
//! cheap to clone because one connection failure may have to be fanned out
//! to every request that was riding on that connection, and because the
//! client caches the most recent dial/connection error to substitute as
//! context for otherwise-opaque failures.
//!
//! [`ConnError`] is the per-connection taxonomy shared by client and
//! server: everything in it is fatal to the connection it occurred on.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors returned to `Client` callers.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The deadline expired before a response was received.
    #[error("request timed out before the server responded")]
    Timeout,

    /// The pending-requests queue is full and displacing the oldest entry
    /// didn't make room. Increase `max_pending_requests`, reduce the
    /// request rate or speed up the server.
    #[error("pending requests overflow: too many requests are queued for sending")]
    PendingRequestsOverflow,

    /// Requests with body streams aren't supported.
    #[error("requests with body streams aren't supported")]
    NoBodyStream,

    /// Dialing the server failed.
    #[error("cannot connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// The connection failed after it was established.
    #[error("connection error: {0}")]
    Connection(#[source] Arc<ConnError>),
}

impl Error {
    pub(crate) fn dial(addr: &str, source: io::Error) -> Self {
        Error::Dial { addr: addr.to_string(), source: Arc::new(source) }
    }

    pub(crate) fn conn(err: ConnError) -> Self {
        Error::Connection(Arc::new(err))
    }
}

/// Errors that tear down a single connection.
#[derive(Error, Debug)]
pub enum ConnError {
    /// The handshake failed before any framing started.
    #[error("error in handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// Socket-level failure, including read/write timeouts.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The peer sent a message this side can't parse. Stream alignment is
    /// lost, so the connection can't continue.
    #[error("cannot parse message: {0}")]
    Parse(#[from] teleport_h1::ParseError),

    /// A message couldn't be serialized onto the wire.
    #[error("cannot send message: {0}")]
    Send(#[from] teleport_h1::SendError),

    /// A correlation id was reassigned while still awaiting its response.
    #[error("request id {0} reused while still awaiting a response")]
    RequestIdCollision(u32),

    /// A handler produced a response the engine refuses to ship.
    #[error("streamed response bodies aren't supported")]
    ResponseBodyStream,
}

impl ConnError {
    pub(crate) fn timed_out(what: &str) -> Self {
        ConnError::Io { source: io::Error::new(io::ErrorKind::TimedOut, what.to_string()) }
    }
}

/// Errors produced while negotiating a new connection.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The peer didn't open with the protocol sniff tag.
    #[error("invalid sniff header read: {got:?}")]
    BadSniff { got: [u8; crate::handshake::SNIFF_HEADER.len()] },

    /// The peer speaks an unknown protocol version.
    #[error("unknown protocol version: {0}")]
    BadVersion(u8),

    /// The peer announced an unknown compression code.
    #[error("unknown compression type: {0}")]
    BadCompression(u8),

    /// This side requires TLS but the peer doesn't offer it, or vice versa.
    #[error("{0}")]
    TlsUnsupported(&'static str),

    /// The TLS negotiation itself failed.
    #[error("error in TLS handshake: {source}")]
    Tls {
        #[source]
        source: io::Error,
    },

    /// Socket-level failure during the exchange.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// The whole exchange didn't finish within the handshake deadline.
    #[error("handshake timed out")]
    Timeout,
}
