//! The client connection engine.
//!
//! A [`Client`] multiplexes every call onto one persistent connection.
//! Callers enqueue request units; a writer task drains the queue, stamps
//! each request with a correlation id and batches the writes; a reader
//! task matches incoming responses back to their units through the
//! correlation table; a sweeper task fails whatever the deadline caught
//! first. The completion channel of every unit is signaled exactly once,
//! before its deadline, so callers never need their own timer.
//!
//! The connection worker dials lazily (on the first queued request),
//! reconnects with a fixed one-second backoff after failures, and caches
//! the most recent dial/connection error so callers see *why* their
//! request failed instead of a bare timeout.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use teleport_h1::{Request, Response};

use crate::compress::{CompressedReader, CompressedWriter};
use crate::config::{ClientConfig, DEFAULT_MAX_PENDING_REQUESTS, DEFAULT_READ_BUFFER_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
use crate::error::{ConnError, Error};
use crate::frame::{next_frame, write_op};
use crate::frame::{MessageCodec, RequestFrameEncoder, ResponseFrameDecoder, H1};
use crate::handshake;
use crate::transport::{tcp_dial, Connection, DialFn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Teleports HTTP requests to a server over a single connection.
///
/// Use multiple clients to spread load over multiple connections when one
/// connection saturates a core on either end.
///
/// Dropping the client aborts its background tasks; requests still in
/// flight complete with an error.
pub struct Client<C: MessageCodec = H1> {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    _codec: PhantomData<fn() -> C>,
}

impl Client<H1> {
    /// Creates a client with the default HTTP/1.1 codec and starts its
    /// background tasks. Must be called within a tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_codec(config)
    }
}

impl<C: MessageCodec> Client<C> {
    /// Creates a client with a custom message codec.
    pub fn with_codec(mut config: ClientConfig) -> Self {
        if config.max_pending_requests == 0 {
            config.max_pending_requests = DEFAULT_MAX_PENDING_REQUESTS;
        }
        if config.read_buffer_size == 0 {
            config.read_buffer_size = DEFAULT_READ_BUFFER_SIZE;
        }
        if config.write_buffer_size == 0 {
            config.write_buffer_size = DEFAULT_WRITE_BUFFER_SIZE;
        }

        let dial = config.dial.clone().unwrap_or_else(tcp_dial);
        let shared = Arc::new(Shared {
            queue: PendingQueue::new(config.max_pending_requests),
            pending_responses: Mutex::new(HashMap::new()),
            pending_count: AtomicUsize::new(0),
            next_request_id: AtomicU32::new(0),
            last_error: Mutex::new(None),
            dial,
            config,
        });

        let worker = tokio::spawn(worker::<C>(shared.clone()));
        let sweeper = tokio::spawn(sweeper(shared.clone()));
        Client { shared, worker, sweeper, _codec: PhantomData }
    }

    /// Teleports `request`, failing with [`Error::Timeout`] if no response
    /// arrived within `timeout`.
    pub async fn do_timeout(&self, request: Request, timeout: Duration) -> Result<Response, Error> {
        self.do_deadline(request, Instant::now() + timeout).await
    }

    /// Teleports `request`, failing with [`Error::Timeout`] if no response
    /// arrived by `deadline`.
    ///
    /// Returns exactly once, with the server's response or a typed error.
    /// A request carrying a streaming body fails with
    /// [`Error::NoBodyStream`] before anything touches the wire.
    pub async fn do_deadline(&self, request: Request, deadline: Instant) -> Result<Response, Error> {
        if request.body().is_stream() {
            return Err(Error::NoBodyStream);
        }

        let shared = &self.shared;
        let n = shared.pending_count.fetch_add(1, Ordering::AcqRel) + 1;
        let _guard = PendingCountGuard(&shared.pending_count);

        if n >= shared.config.max_pending_requests {
            return Err(shared.client_error(Error::PendingRequestsOverflow));
        }

        let (done, completion) = oneshot::channel();
        let item = WorkItem { request, deadline, done };
        match shared.queue.enqueue(item) {
            Ok(displaced) => {
                if let Some(old) = displaced {
                    old.complete(Err(shared.client_error(Error::PendingRequestsOverflow)));
                }
            }
            Err(_rejected) => {
                return Err(shared.client_error(Error::PendingRequestsOverflow));
            }
        }

        match completion.await {
            Ok(result) => result,
            // the engine dropped the unit without signaling (client torn
            // down mid-flight); surface whatever context we have
            Err(_closed) => Err(shared.client_error(Error::Timeout)),
        }
    }

    /// The number of requests currently pending, for informational or
    /// load-balancing purposes.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending_count.load(Ordering::Acquire)
    }
}

impl<C: MessageCodec> Drop for Client<C> {
    fn drop(&mut self) {
        self.worker.abort();
        self.sweeper.abort();
    }
}

/// Decrements the pending counter when the caller leaves `do_deadline`,
/// whichever way it leaves.
struct PendingCountGuard<'a>(&'a AtomicUsize);

impl Drop for PendingCountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One queued call: the request, its deadline and its completion channel.
struct WorkItem {
    request: Request,
    deadline: Instant,
    done: oneshot::Sender<Result<Response, Error>>,
}

impl WorkItem {
    fn complete(self, result: Result<Response, Error>) {
        // the caller may already have given up and dropped its receiver
        let _ = self.done.send(result);
    }
}

/// A correlation-table entry: a request that is on the wire (or queued
/// behind the writer's buffer) awaiting its response.
struct PendingResponse {
    deadline: Instant,
    done: oneshot::Sender<Result<Response, Error>>,
}

impl PendingResponse {
    fn complete(self, result: Result<Response, Error>) {
        let _ = self.done.send(result);
    }
}

struct Shared {
    config: ClientConfig,
    dial: DialFn,
    queue: PendingQueue,
    /// The correlation table: id → waiter.
    pending_responses: Mutex<HashMap<u32, PendingResponse>>,
    pending_count: AtomicUsize,
    /// Correlation ids, monotone per client. Entries in the table can
    /// outlive the connection that wrote them (the sweeper times them
    /// out), so the counter must not restart per connection.
    next_request_id: AtomicU32,
    last_error: Mutex<Option<Error>>,
}

impl Shared {
    /// Substitutes the cached dial/connection error for `err` when one is
    /// known; a failed request then explains *why* the connection is bad.
    fn client_error(&self, err: Error) -> Error {
        let last = self.last_error.lock().expect("last error lock poisoned");
        match &*last {
            Some(last_err) => last_err.clone(),
            None => err,
        }
    }

    fn set_last_error(&self, err: Option<Error>) {
        *self.last_error.lock().expect("last error lock poisoned") = err;
    }

    fn remove_pending(&self, id: u32) -> Option<PendingResponse> {
        self.pending_responses.lock().expect("correlation table lock poisoned").remove(&id)
    }

    /// Fails expired queued requests. Returns whether any were found.
    fn sweep_pending_requests(&self) -> bool {
        let now = Instant::now();
        let expired = self.queue.take_expired(now);
        let found = !expired.is_empty();
        for item in expired {
            item.complete(Err(self.client_error(Error::Timeout)));
        }
        found
    }

    /// Fails expired correlation-table entries. Returns whether any were
    /// found. An evicted entry leaves a ghost id on the wire; the reader
    /// skips the eventual response.
    fn sweep_pending_responses(&self) -> bool {
        let now = Instant::now();
        let expired: Vec<PendingResponse> = {
            let mut table = self.pending_responses.lock().expect("correlation table lock poisoned");
            let ids: Vec<u32> =
                table.iter().filter(|(_, p)| now > p.deadline).map(|(id, _)| *id).collect();
            ids.iter().filter_map(|id| table.remove(id)).collect()
        };
        let found = !expired.is_empty();
        for pending in expired {
            pending.complete(Err(self.client_error(Error::Timeout)));
        }
        found
    }
}

/// The bounded pre-writer queue.
struct PendingQueue {
    items: Mutex<VecDeque<WorkItem>>,
    notify: Notify,
    capacity: usize,
}

impl PendingQueue {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))), notify: Notify::new(), capacity }
    }

    /// Enqueues `item`. On a full queue one displace-oldest step runs:
    /// the oldest entry is pulled out and returned for the caller to fail
    /// with overflow. If even that doesn't make room the item comes back
    /// in `Err`.
    fn enqueue(&self, item: WorkItem) -> Result<Option<WorkItem>, WorkItem> {
        let displaced = {
            let mut items = self.items.lock().expect("pending queue lock poisoned");
            if items.len() < self.capacity {
                items.push_back(item);
                None
            } else {
                let displaced = items.pop_front();
                if items.len() < self.capacity {
                    items.push_back(item);
                    displaced
                } else {
                    return Err(item);
                }
            }
        };
        self.notify.notify_one();
        Ok(displaced)
    }

    fn try_pop(&self) -> Option<WorkItem> {
        self.items.lock().expect("pending queue lock poisoned").pop_front()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().expect("pending queue lock poisoned").is_empty()
    }

    /// Waits until the queue holds at least one item.
    async fn wait_nonempty(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Removes and returns every expired item, preserving the order of
    /// the rest.
    fn take_expired(&self, now: Instant) -> Vec<WorkItem> {
        let mut expired = Vec::new();
        let mut items = self.items.lock().expect("pending queue lock poisoned");
        for _ in 0..items.len() {
            match items.pop_front() {
                Some(item) if now > item.deadline => expired.push(item),
                Some(item) => items.push_back(item),
                None => break,
            }
        }
        expired
    }
}

fn conn_error(err: impl Into<ConnError>) -> Error {
    Error::conn(err.into())
}

/// Dials, serves, reconnects, forever.
async fn worker<C: MessageCodec>(shared: Arc<Shared>) {
    loop {
        // dial lazily: no connection until there is something to send
        shared.queue.wait_nonempty().await;

        let conn = match (shared.dial)(shared.config.addr.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(addr = %shared.config.addr, cause = %e, "cannot connect to the server");
                shared.set_last_error(Some(Error::dial(&shared.config.addr, e)));
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        shared.set_last_error(None);

        match serve_conn::<C>(&shared, conn).await {
            Ok(()) => {
                debug!("connection closed by the server, reconnecting");
            }
            Err(err) => {
                warn!(cause = %err, "connection failed, reconnecting");
                shared.set_last_error(Some(err));
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Runs one connection to completion: handshake, then reader and writer
/// until either fails or the stream ends.
async fn serve_conn<C: MessageCodec>(shared: &Arc<Shared>, conn: Connection) -> Result<(), Error> {
    let (read_compress, conn) =
        handshake::client(conn, shared.config.compress, shared.config.tls.as_ref())
            .await
            .map_err(|e| conn_error(ConnError::Handshake(e)))?;

    let (read_half, write_half) = tokio::io::split(conn);
    let framed_read = FramedRead::with_capacity(
        CompressedReader::new(read_half, read_compress),
        ResponseFrameDecoder::<C>::new(),
        shared.config.read_buffer_size,
    );
    let mut framed_write = FramedWrite::new(
        CompressedWriter::new(write_half, shared.config.compress),
        RequestFrameEncoder::<C>::new(),
    );
    framed_write.set_backpressure_boundary(shared.config.write_buffer_size);

    let cancel = CancellationToken::new();
    // if this future is dropped (client torn down), the tasks still unwind
    let _teardown = cancel.clone().drop_guard();
    let mut reader = tokio::spawn(conn_reader(shared.clone(), framed_read, cancel.clone()));
    let mut writer = tokio::spawn(conn_writer(shared.clone(), framed_write, cancel.clone()));

    // whichever task fails first tears the connection down; the other
    // observes the cancellation (or the dead socket) and unwinds
    tokio::select! {
        read_result = &mut reader => {
            cancel.cancel();
            let _ = (&mut writer).await;
            flatten(read_result)
        }
        write_result = &mut writer => {
            cancel.cancel();
            let _ = (&mut reader).await;
            flatten(write_result)
        }
    }
}

fn flatten(result: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match result {
        Ok(task_result) => task_result,
        Err(join_err) => Err(conn_error(ConnError::Io { source: std::io::Error::other(join_err) })),
    }
}

type ClientFramedRead<C> =
    FramedRead<CompressedReader<ReadHalf<Connection>>, ResponseFrameDecoder<C>>;
type ClientFramedWrite<C> =
    FramedWrite<CompressedWriter<WriteHalf<Connection>>, RequestFrameEncoder<C>>;

async fn conn_writer<C: MessageCodec>(
    shared: Arc<Shared>,
    mut framed: ClientFramedWrite<C>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let max_batch_delay = shared.config.max_batch_delay;
    let write_timeout = shared.config.write_timeout;
    let mut flush_at: Option<Instant> = None;

    loop {
        let item = match shared.queue.try_pop() {
            Some(item) => item,
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    _ = shared.queue.notify.notified() => continue,
                    _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)),
                            if flush_at.is_some() => {
                        write_op(write_timeout, framed.flush()).await.map_err(conn_error)?;
                        flush_at = None;
                        continue;
                    }
                }
            }
        };

        if Instant::now() > item.deadline {
            item.complete(Err(shared.client_error(Error::Timeout)));
            continue;
        }

        let request_id = shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let WorkItem { request, deadline, done } = item;

        if let Err(e) = write_op(write_timeout, framed.feed((request_id, request))).await {
            let err = conn_error(e);
            let _ = done.send(Err(shared.client_error(err.clone())));
            return Err(err);
        }

        {
            let mut table =
                shared.pending_responses.lock().expect("correlation table lock poisoned");
            if table.contains_key(&request_id) {
                drop(table);
                let err = conn_error(ConnError::RequestIdCollision(request_id));
                let _ = done.send(Err(err.clone()));
                return Err(err);
            }
            table.insert(request_id, PendingResponse { deadline, done });
        }

        if shared.queue.is_empty() {
            if max_batch_delay.is_zero() {
                write_op(write_timeout, framed.flush()).await.map_err(conn_error)?;
                flush_at = None;
            } else {
                // re-armed after every write that empties the queue
                flush_at = Some(Instant::now() + max_batch_delay);
            }
        }
    }
}

async fn conn_reader<C: MessageCodec>(
    shared: Arc<Shared>,
    mut framed: ClientFramedRead<C>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let read_timeout = shared.config.read_timeout;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = next_frame(read_timeout, &mut framed) => frame,
        };

        match frame {
            Ok(Some((id, response))) => match shared.remove_pending(id) {
                Some(pending) => pending.complete(Ok(response)),
                None => {
                    // the sweeper evicted this id; the response was
                    // decoded anyway to keep the stream aligned
                    trace!(id, "dropping response for an evicted request");
                }
            },
            // end of stream on an id boundary: a clean close
            Ok(None) => return Ok(()),
            Err(e) => {
                let owner = framed.decoder().in_flight().and_then(|id| shared.remove_pending(id));
                let err = conn_error(e);
                if let Some(pending) = owner {
                    pending.complete(Err(shared.client_error(err.clone())));
                }
                return Err(err);
            }
        }
    }
}

/// Fails requests the reader and writer can't get to in time: expired
/// items still in the queue and expired correlation-table entries.
///
/// The sleep adapts: halve toward the floor while sweeps find work, grow
/// 1.5x toward the ceiling while they don't.
async fn sweeper(shared: Arc<Shared>) {
    let mut interval = MIN_SWEEP_INTERVAL;
    loop {
        tokio::time::sleep(interval).await;
        let found_requests = shared.sweep_pending_requests();
        let found_responses = shared.sweep_pending_responses();
        interval = if found_requests || found_responses {
            (interval / 2).max(MIN_SWEEP_INTERVAL)
        } else {
            (interval * 3 / 2).min(MAX_SWEEP_INTERVAL)
        };
    }
}
