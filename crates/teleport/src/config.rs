//! Client and server configuration.
//!
//! Every knob has a working default; constructing a config and overriding
//! a field or two is the expected usage.

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls;

use crate::compress::Compression;
use crate::transport::DialFn;

/// Default cap on pending (unacknowledged) requests per client.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 1000;

/// Default cap on concurrent handler invocations per server.
pub const DEFAULT_CONCURRENCY: usize = 10_000;

/// Default size for read buffers.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default size for write buffers.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// TLS settings for a client connection.
///
/// Setting this on [`ClientConfig`] makes the client demand an encrypted
/// connection; a server that can't provide one is a handshake failure,
/// not a silent downgrade.
#[derive(Clone)]
pub struct ClientTls {
    /// rustls client configuration (roots, etc.).
    pub config: Arc<rustls::ClientConfig>,
    /// Name presented for certificate verification.
    pub server_name: String,
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Clone)]
pub struct ClientConfig {
    /// Server address handed to the dial function.
    pub addr: String,

    /// Compression used for requests this client sends. The server picks
    /// its own compression for responses.
    pub compress: Compression,

    /// Custom dial function. TCP with `TCP_NODELAY` is used by default;
    /// tests and unix-socket setups inject their own.
    pub dial: Option<DialFn>,

    /// TLS settings. `None` means a plaintext connection.
    pub tls: Option<ClientTls>,

    /// Maximum number of pending requests this client may issue until the
    /// server responds to them.
    pub max_pending_requests: usize,

    /// Maximum duration pending requests are buffered before being
    /// flushed to the server. Zero flushes after every request.
    pub max_batch_delay: Duration,

    /// Maximum duration for reading a full response. Also limits idle
    /// connection lifetime. `None` means unlimited.
    pub read_timeout: Option<Duration>,

    /// Maximum duration for writing a full request. `None` means
    /// unlimited.
    pub write_timeout: Option<Duration>,

    /// Size of the read buffer.
    pub read_buffer_size: usize,

    /// Size of the write buffer.
    pub write_buffer_size: usize,
}

impl ClientConfig {
    /// Creates a config for the given server address with all defaults.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            compress: Compression::default(),
            dial: None,
            tls: None,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
            max_batch_delay: Duration::ZERO,
            read_timeout: None,
            write_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// Configuration for a [`Server`](crate::Server).
#[derive(Clone)]
pub struct ServerConfig {
    /// Compression used for responses this server sends.
    pub compress: Compression,

    /// Maximum number of concurrent handler invocations. Requests over
    /// the limit are answered with a 429-equivalent response instead of
    /// being queued.
    pub concurrency: usize,

    /// Maximum duration ready responses are buffered before being flushed
    /// to the client. Zero flushes after every response.
    pub max_batch_delay: Duration,

    /// Maximum duration for reading a full request. Also limits idle
    /// connection lifetime. `None` means unlimited.
    pub read_timeout: Option<Duration>,

    /// Maximum duration for writing a full response. `None` means
    /// unlimited.
    pub write_timeout: Option<Duration>,

    /// Size of the read buffer.
    pub read_buffer_size: usize,

    /// Size of the write buffer.
    pub write_buffer_size: usize,

    /// TLS settings. When set, clients demanding TLS get it; when unset,
    /// such clients are refused cleanly.
    pub tls: Option<Arc<rustls::ServerConfig>>,

    /// Process requests from a single connection serially, preserving
    /// response order. By default requests run concurrently.
    pub pipeline_requests: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            compress: Compression::default(),
            concurrency: DEFAULT_CONCURRENCY,
            max_batch_delay: Duration::ZERO,
            read_timeout: None,
            write_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            tls: None,
            pipeline_requests: false,
        }
    }
}
