//! Reader and sender tasks of a connection.
//!
//! Each connection runs exactly one of each. The reader decodes frames and
//! hands them to [`Connection::handle_incoming`]; the sender drains the
//! outbound queue. Either one failing closes the connection.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::{lock, Connection};
use crate::wire::{Message, MessageCodec, MessageType, WireError};

pub(super) async fn read_loop<R>(connection: Connection, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, MessageCodec::new());
    let shutdown = connection.inner.shutdown.clone();
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                trace!(%message, "received");
                connection.handle_incoming(message);
            },
            Some(Err(e)) => {
                warn!(error = %e, "failed to read message");
                break;
            },
            None => {
                debug!("peer closed the connection");
                break;
            },
        }
    }
    connection.close();
}

pub(super) async fn write_loop<W>(connection: Connection, writer: W)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, MessageCodec::new());
    let shutdown = connection.inner.shutdown.clone();
    loop {
        let batch = lock(&connection.inner.outgoing).drain();
        if batch.is_empty() {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = connection.inner.outgoing_ready.notified() => continue,
            }
        }
        if let Err(e) = write_batch(&connection, &mut sink, batch).await {
            warn!(error = %e, "failed to write message");
            connection.close();
            return;
        }
    }

    // Flush what was queued before the close.
    let rest = lock(&connection.inner.outgoing).drain();
    if let Err(e) = write_batch(&connection, &mut sink, rest).await {
        debug!(error = %e, "failed to flush on close");
    }
    if let Err(e) = SinkExt::<Message>::close(&mut sink).await {
        debug!(error = %e, "failed to shut down writer");
    }
}

/// Writes `batch`, failing individual calls that cannot be encoded.
///
/// Only transport errors are returned.
async fn write_batch<W>(
    connection: &Connection,
    sink: &mut FramedWrite<W, MessageCodec>,
    batch: Vec<Message>,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    for message in batch {
        let serial = message.serial();
        let is_call = message.message_type() == MessageType::MethodCall;
        trace!(%message, "sending");
        match sink.feed(message).await {
            Ok(()) => {},
            Err(WireError::Io(e)) => {
                if is_call {
                    connection.fail_send(serial, &e.to_string());
                }
                return Err(WireError::Io(e));
            },
            Err(e) => {
                warn!(serial, error = %e, "dropping message that cannot be encoded");
                if is_call {
                    connection.fail_send(serial, &e.to_string());
                }
            },
        }
    }
    SinkExt::<Message>::flush(sink).await
}
