//! Outstanding method calls and their replies.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::worker::WorkerPool;
use crate::error::{BusError, BusResult};
use crate::wire::{Message, MessageType};

/// Callback run on a worker when the reply to a call arrives.
pub type ReplyCallback = Box<dyn FnOnce(BusResult<Message>) + Send + 'static>;

/// How a pending call hands over its reply.
pub(crate) enum PendingCall {
    /// Awaited through a [`PendingReply`].
    Channel(oneshot::Sender<BusResult<Message>>),
    /// Run as a worker task.
    Callback(ReplyCallback),
}

impl PendingCall {
    pub(crate) fn resolve(self, result: BusResult<Message>, workers: &WorkerPool) {
        match self {
            Self::Channel(sender) => {
                // The caller may have stopped waiting.
                let _ = sender.send(result);
            },
            Self::Callback(callback) => {
                workers.submit("reply-callback", move || callback(result));
            },
        }
    }
}

/// Converts a reply message into the caller-facing result.
pub(crate) fn reply_result(reply: Message) -> BusResult<Message> {
    if reply.message_type() == MessageType::Error {
        let name = reply.error_name().unwrap_or_default().to_string();
        let text = reply.error_text().unwrap_or_default().to_string();
        Err(BusError::method_error(name, text))
    } else {
        Ok(reply)
    }
}

/// A reply that has not necessarily arrived yet.
///
/// Await it, or poll without blocking through [`PendingReply::try_reply`].
/// Dropping it abandons the reply; the call itself is not cancelled.
#[derive(Debug)]
pub struct PendingReply {
    serial: u32,
    receiver: oneshot::Receiver<BusResult<Message>>,
    done: bool,
}

impl PendingReply {
    pub(crate) const fn new(serial: u32, receiver: oneshot::Receiver<BusResult<Message>>) -> Self {
        Self {
            serial,
            receiver,
            done: false,
        }
    }

    /// Serial of the call.
    #[must_use]
    pub const fn serial(&self) -> u32 {
        self.serial
    }

    /// Returns the reply if it has arrived, `None` otherwise.
    ///
    /// The reply is handed out once; later calls return `None`.
    pub fn try_reply(&mut self) -> Option<BusResult<Message>> {
        if self.done {
            return None;
        }
        let result = match self.receiver.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(BusError::Disconnected),
        };
        self.done = true;
        Some(result)
    }
}

impl Future for PendingReply {
    type Output = BusResult<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(BusError::Disconnected));
        }
        let result = match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(BusError::Disconnected),
        };
        self.done = true;
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::errors;

    fn call() -> Message {
        let mut call = Message::method_call("/", "Ping").unwrap();
        call.set_serial(3);
        call
    }

    #[test]
    fn test_reply_result() {
        assert!(reply_result(Message::method_return(&call())).is_ok());
        let err = reply_result(Message::error(&call(), errors::FAILED, "nope")).unwrap_err();
        assert_eq!(err.error_name(), Some(errors::FAILED));
        assert_eq!(err.to_string(), format!("{}: nope", errors::FAILED));
    }

    #[tokio::test]
    async fn test_pending_reply_resolves() {
        let (tx, rx) = oneshot::channel();
        let mut reply = PendingReply::new(3, rx);
        assert!(reply.try_reply().is_none());
        tx.send(Ok(Message::method_return(&call()))).unwrap();
        let message = reply.await.unwrap();
        assert_eq!(message.reply_serial(), Some(3));
    }

    #[test]
    fn test_try_reply_after_sender_dropped() {
        let (tx, rx) = oneshot::channel::<BusResult<Message>>();
        let mut reply = PendingReply::new(1, rx);
        drop(tx);
        assert!(matches!(reply.try_reply(), Some(Err(BusError::Disconnected))));
        assert!(reply.try_reply().is_none());
    }
}
