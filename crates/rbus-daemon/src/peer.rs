//! Per-connection I/O tasks of the daemon.
//!
//! Each authenticated peer gets a reader task that forwards decoded
//! messages to the router in stream order, and a sender task that drains the
//! peer's [`Outbox`]. The router never touches a socket; it only pushes into
//! outboxes.
//!
//! # Backpressure
//!
//! - Reader tasks feed the router through a bounded channel, so a flooding
//!   peer stalls on its own socket.
//! - An outbox holds at most its configured number of messages. A push past
//!   that limit is refused with [`PushResult::Full`] and the router aborts
//!   the peer: queued messages are discarded and the connection closes.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use rbus_core::connection::BusStream;
use rbus_core::ring::RingQueue;
use rbus_core::wire::{Message, MessageCodec};
use tokio::io::{AsyncWrite, WriteHalf};
use tokio::sync::mpsc::Sender;
use tokio::sync::Notify;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::listener::ConnectionPermit;
use crate::router::RouterEvent;

/// Daemon-internal identifier of a connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of [`Outbox::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    /// The message is queued for writing.
    Queued,
    /// The outbox holds its limit of messages; the message was dropped.
    Full,
    /// The outbox is closed; the message was dropped.
    Closed,
}

/// Outbound queue of one peer.
pub struct Outbox {
    queue: Mutex<RingQueue<Message>>,
    limit: usize,
    ready: Notify,
    closed: CancellationToken,
    aborted: CancellationToken,
}

impl Outbox {
    /// Empty outbox with room for `capacity` messages before it grows and
    /// never more than `limit` queued.
    #[must_use]
    pub fn new(capacity: usize, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(RingQueue::new(capacity.min(limit).max(1))),
            limit,
            ready: Notify::new(),
            closed: CancellationToken::new(),
            aborted: CancellationToken::new(),
        })
    }

    /// Queues a message unless the outbox is closed or full.
    pub fn push(&self, message: Message) -> PushResult {
        if self.closed.is_cancelled() {
            return PushResult::Closed;
        }
        {
            let mut queue = lock(&self.queue);
            if queue.len() >= self.limit {
                return PushResult::Full;
            }
            queue.add(message);
        }
        self.ready.notify_one();
        PushResult::Queued
    }

    /// Stops the peer; queued messages are still flushed.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Stops the peer at once, discarding queued and in-flight messages.
    pub fn abort(&self) {
        self.aborted.cancel();
        self.closed.cancel();
        lock(&self.queue).drain();
    }

    /// Maximum number of queued messages.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Returns `true` once [`Outbox::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of messages waiting to be written.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Returns `true` if nothing is waiting to be written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    pub(crate) fn take_all(&self) -> Vec<Message> {
        lock(&self.queue).drain()
    }
}

/// Runs the reader and sender of `peer` until either side ends.
///
/// The router is told about the disconnect exactly once, after the reader
/// stops. `permit` is released when both tasks have finished.
pub async fn run(
    peer: PeerId,
    stream: BusStream,
    outbox: Arc<Outbox>,
    events: Sender<RouterEvent>,
    permit: ConnectionPermit,
) {
    let (reader, writer) = tokio::io::split(stream);
    let sender = tokio::spawn(send_loop(peer, writer, Arc::clone(&outbox)));

    let mut frames = FramedRead::new(reader, MessageCodec::new());
    loop {
        let next = tokio::select! {
            () = outbox.closed.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                trace!(%peer, %message, "received");
                let event = RouterEvent::Message { peer, message };
                let sent = tokio::select! {
                    () = outbox.closed.cancelled() => break,
                    sent = events.send(event) => sent,
                };
                if sent.is_err() {
                    break;
                }
            },
            Some(Err(e)) => {
                warn!(%peer, error = %e, "dropping connection after read error");
                break;
            },
            None => {
                debug!(%peer, "peer closed the connection");
                break;
            },
        }
    }

    // The router may already be gone during shutdown.
    let _ = events.send(RouterEvent::Disconnected { peer }).await;
    outbox.close();
    if let Err(e) = sender.await {
        debug!(%peer, error = %e, "sender task join failed");
    }
    drop(permit);
}

async fn send_loop(peer: PeerId, writer: WriteHalf<BusStream>, outbox: Arc<Outbox>) {
    let mut sink = FramedWrite::new(writer, MessageCodec::new());
    loop {
        let batch = outbox.take_all();
        if batch.is_empty() {
            tokio::select! {
                () = outbox.closed.cancelled() => break,
                () = outbox.ready.notified() => continue,
            }
        }
        let written = tokio::select! {
            () = outbox.aborted.cancelled() => return,
            written = write_batch(peer, &mut sink, batch) => written,
        };
        if let Err(e) = written {
            warn!(%peer, error = %e, "failed to write to peer");
            outbox.close();
            return;
        }
    }

    let rest = outbox.take_all();
    let flushed = tokio::select! {
        () = outbox.aborted.cancelled() => return,
        flushed = write_batch(peer, &mut sink, rest) => flushed,
    };
    if let Err(e) = flushed {
        debug!(%peer, error = %e, "failed to flush on close");
    }
    if let Err(e) = SinkExt::<Message>::close(&mut sink).await {
        debug!(%peer, error = %e, "failed to shut down writer");
    }
}

async fn write_batch<W>(
    peer: PeerId,
    sink: &mut FramedWrite<W, MessageCodec>,
    batch: Vec<Message>,
) -> Result<(), rbus_core::wire::WireError>
where
    W: AsyncWrite + Unpin,
{
    for message in batch {
        trace!(%peer, %message, "sending");
        match sink.feed(message).await {
            Ok(()) => {},
            Err(rbus_core::wire::WireError::Io(e)) => return Err(e.into()),
            Err(e) => warn!(%peer, error = %e, "dropping message that cannot be encoded"),
        }
    }
    SinkExt::<Message>::flush(sink).await
}
