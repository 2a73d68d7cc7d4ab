//! The server connection engine.
//!
//! Each accepted connection gets a reader task and a writer task sharing
//! a bounded queue of ready responses. The reader admits requests against
//! a server-wide concurrency cap and hands each admitted request to the
//! [`Handler`], either on its own task or inline when pipelining.
//! Overload is answered with a 429-equivalent response rather than
//! backpressured, so a client can route around a busy server. The
//! writer copies each request's correlation id onto its response and
//! batches writes exactly like the client's writer.

use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use http::StatusCode;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use teleport_h1::{Body, Request, Response};

use crate::compress::{CompressedReader, CompressedWriter};
use crate::config::{ServerConfig, DEFAULT_CONCURRENCY, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
use crate::error::ConnError;
use crate::frame::{next_frame, write_op};
use crate::frame::{MessageCodec, RequestFrameDecoder, ResponseFrameEncoder, H1};
use crate::handshake;
use crate::transport::{Connection, Listener};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Processes one teleported request.
///
/// Handlers may block or await freely; a slow handler doesn't hold up
/// other requests on the same connection unless the server pipelines.
/// A handler error becomes an empty 500 response. Streamed response
/// bodies are refused: producing one closes the connection.
pub trait Handler: Send + Sync + 'static {
    type Error: Into<Box<dyn StdError + Send + Sync>>;
    type Fut<'fut>: Future<Output = Result<Response, Self::Error>> + Send
    where
        Self: 'fut;

    fn call(&self, request: Request) -> Self::Fut<'_>;
}

/// A [`Handler`] built from a closure, see [`make_handler`].
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<Err, F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Err: Into<Box<dyn StdError + Send + Sync>> + 'static,
    Fut: Future<Output = Result<Response, Err>> + Send + 'static,
{
    type Error = Err;
    type Fut<'fut>
        = Fut
    where
        Self: 'fut;

    fn call(&self, request: Request) -> Self::Fut<'_> {
        (self.f)(request)
    }
}

/// Wraps a closure into a [`Handler`].
pub fn make_handler<F, Err, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Err: Into<Box<dyn StdError + Send + Sync>> + 'static,
    Fut: Future<Output = Result<Response, Err>> + Send + 'static,
{
    HandlerFn { f }
}

/// Accepts connections from teleport clients and feeds their requests to
/// a [`Handler`].
pub struct Server<H, C: MessageCodec = H1> {
    shared: Arc<Shared<H>>,
    _codec: PhantomData<fn() -> C>,
}

struct Shared<H> {
    config: ServerConfig,
    handler: H,
    /// In-flight handler invocations, across every connection.
    in_flight: AtomicUsize,
}

impl<H: Handler> Server<H, H1> {
    /// Creates a server with the default HTTP/1.1 codec.
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self::with_codec(config, handler)
    }
}

impl<H: Handler, C: MessageCodec> Server<H, C> {
    /// Creates a server with a custom message codec.
    pub fn with_codec(mut config: ServerConfig, handler: H) -> Self {
        if config.concurrency == 0 {
            config.concurrency = DEFAULT_CONCURRENCY;
        }
        if config.read_buffer_size == 0 {
            config.read_buffer_size = DEFAULT_READ_BUFFER_SIZE;
        }
        if config.write_buffer_size == 0 {
            config.write_buffer_size = DEFAULT_WRITE_BUFFER_SIZE;
        }
        let shared = Arc::new(Shared { config, handler, in_flight: AtomicUsize::new(0) });
        Server { shared, _codec: PhantomData }
    }

    /// Serves requests accepted from the given TCP address.
    pub async fn listen_and_serve(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves requests accepted from the given listener.
    ///
    /// Returns `Ok(())` when the listener closes. Connections belong to
    /// this future: dropping it (or aborting its task) tears them down.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> io::Result<()> {
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(Some(conn)) => {
                        let shared = self.shared.clone();
                        conns.spawn(serve_conn::<H, C>(shared, conn));
                    }
                    Ok(None) => {
                        info!("listener closed, stopping the server");
                        return Ok(());
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(cause = %e, "failed to accept");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                    Err(e) => {
                        error!(cause = %e, "terminal accept error");
                        return Err(e);
                    }
                },
                Some(_finished) = conns.join_next(), if !conns.is_empty() => {}
            }
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// The 429-equivalent answer for a request refused at admission.
fn concurrency_limit_response(limit: usize) -> Response {
    let body = format!(
        "concurrency limit exceeded: {limit}. Increase the server concurrency limit or decrease load on the server"
    );
    http::Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .body(Body::from(body))
        .expect("static response parts are valid")
}

/// Runs the handler, turning its error into an empty 500.
async fn invoke<H: Handler>(handler: &H, request: Request) -> Response {
    match handler.call(request).await {
        Ok(response) => response,
        Err(e) => {
            error!("handler error, cause: {}", e.into());
            http::Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .expect("static response parts are valid")
        }
    }
}

async fn serve_conn<H: Handler, C: MessageCodec>(shared: Arc<Shared<H>>, conn: Connection) {
    let (read_compress, conn) =
        match handshake::server(conn, shared.config.compress, shared.config.tls.as_ref()).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                debug!(cause = %e, "handshake failed, dropping connection");
                return;
            }
        };

    let (read_half, write_half) = tokio::io::split(conn);
    let framed_read = FramedRead::with_capacity(
        CompressedReader::new(read_half, read_compress),
        RequestFrameDecoder::<C>::new(),
        shared.config.read_buffer_size,
    );
    let mut framed_write = FramedWrite::new(
        CompressedWriter::new(write_half, shared.config.compress),
        ResponseFrameEncoder::<C>::new(),
    );
    framed_write.set_backpressure_boundary(shared.config.write_buffer_size);

    let (ready_tx, ready_rx) = mpsc::channel(shared.config.concurrency.max(1));
    let cancel = CancellationToken::new();
    // if this future is dropped (server stopping), the tasks still unwind
    let _teardown = cancel.clone().drop_guard();
    let mut reader =
        tokio::spawn(conn_reader(shared.clone(), framed_read, ready_tx, cancel.clone()));
    let mut writer = tokio::spawn(conn_writer(shared.clone(), framed_write, ready_rx, cancel.clone()));

    let result = tokio::select! {
        read_result = &mut reader => {
            cancel.cancel();
            let _ = (&mut writer).await;
            read_result
        }
        write_result = &mut writer => {
            cancel.cancel();
            let _ = (&mut reader).await;
            write_result
        }
    };

    match result {
        Ok(Ok(())) => debug!("connection closed"),
        Ok(Err(e)) => debug!(cause = %e, "connection failed"),
        Err(join_err) => error!(cause = %join_err, "connection task failed"),
    }
}

type ServerFramedRead<C> = FramedRead<CompressedReader<ReadHalf<Connection>>, RequestFrameDecoder<C>>;
type ServerFramedWrite<C> =
    FramedWrite<CompressedWriter<WriteHalf<Connection>>, ResponseFrameEncoder<C>>;

async fn conn_reader<H: Handler, C: MessageCodec>(
    shared: Arc<Shared<H>>,
    mut framed: ServerFramedRead<C>,
    ready_tx: mpsc::Sender<(u32, Response)>,
    cancel: CancellationToken,
) -> Result<(), ConnError> {
    let read_timeout = shared.config.read_timeout;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = next_frame(read_timeout, &mut framed) => frame?,
        };
        let (id, request) = match frame {
            Some(frame) => frame,
            // end of stream on an id boundary: a clean close
            None => return Ok(()),
        };

        // admission: increment, check, roll back on overflow
        let n = shared.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if n > shared.config.concurrency {
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            let response = concurrency_limit_response(shared.config.concurrency);
            if ready_tx.send((id, response)).await.is_err() {
                return Ok(());
            }
            continue;
        }

        if shared.config.pipeline_requests {
            let response = invoke(&shared.handler, request).await;
            let refused = response.body().is_stream();
            if refused {
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                error!("handler produced a streamed response body, closing connection");
                return Err(ConnError::ResponseBodyStream);
            }
            let sent = ready_tx.send((id, response)).await;
            shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            if sent.is_err() {
                return Ok(());
            }
        } else {
            let shared = shared.clone();
            let ready_tx = ready_tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let response = invoke(&shared.handler, request).await;
                if response.body().is_stream() {
                    error!("handler produced a streamed response body, closing connection");
                    cancel.cancel();
                } else {
                    // blocks cooperatively when the ready queue is full;
                    // a dead writer just drops the response
                    let _ = ready_tx.send((id, response)).await;
                }
                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            });
        }
    }
}

async fn conn_writer<H, C: MessageCodec>(
    shared: Arc<Shared<H>>,
    mut framed: ServerFramedWrite<C>,
    mut ready: mpsc::Receiver<(u32, Response)>,
    cancel: CancellationToken,
) -> Result<(), ConnError> {
    let max_batch_delay = shared.config.max_batch_delay;
    let write_timeout = shared.config.write_timeout;
    let mut flush_at: Option<Instant> = None;

    loop {
        let (id, response) = match ready.try_recv() {
            Ok(item) => item,
            Err(TryRecvError::Empty) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    received = ready.recv() => match received {
                        Some(item) => item,
                        None => {
                            write_op(write_timeout, framed.flush()).await?;
                            return Ok(());
                        }
                    },
                    _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)),
                            if flush_at.is_some() => {
                        write_op(write_timeout, framed.flush()).await?;
                        flush_at = None;
                        continue;
                    }
                }
            }
            Err(TryRecvError::Disconnected) => {
                write_op(write_timeout, framed.flush()).await?;
                return Ok(());
            }
        };

        write_op(write_timeout, framed.feed((id, response))).await?;

        if ready.is_empty() {
            if max_batch_delay.is_zero() {
                write_op(write_timeout, framed.flush()).await?;
                flush_at = None;
            } else {
                // re-armed after every write that empties the queue
                flush_at = Some(Instant::now() + max_batch_delay);
            }
        }
    }
}
