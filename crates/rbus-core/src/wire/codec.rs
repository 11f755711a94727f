//! Stream framing for [`Message`]s.
//!
//! [`MessageCodec`] plugs the wire format into `tokio_util::codec`, so a
//! socket half becomes a `Stream` of messages (`FramedRead`) or a `Sink`
//! (`FramedWrite`).
//!
//! # Resumable Decoding
//!
//! The decoder parses the 16-byte fixed prefix once, remembers the frame
//! length it announces and then returns `Ok(None)` until the buffer holds the
//! whole frame, so a message split across many reads is never re-parsed from
//! scratch. After a complete message the state resets.

use std::borrow::Borrow;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::error::WireError;
use super::message::{FixedHeader, Message};
use super::FIXED_HEADER_LENGTH;

#[derive(Debug, Clone, Copy, Default)]
enum DecodeState {
    /// Waiting for the fixed prefix.
    #[default]
    Head,
    /// Prefix parsed; waiting for `total_len` bytes.
    Frame { total_len: usize },
}

/// Codec translating between bytes and [`Message`]s.
#[derive(Debug, Default)]
pub struct MessageCodec {
    state: DecodeState,
}

impl MessageCodec {
    /// Creates a codec in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if a frame is partially buffered.
    #[must_use]
    pub const fn is_mid_frame(&self) -> bool {
        matches!(self.state, DecodeState::Frame { .. })
    }
}

impl Decoder for MessageCodec {
    type Error = WireError;
    type Item = Message;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        let total_len = match self.state {
            DecodeState::Head => {
                if src.len() < FIXED_HEADER_LENGTH {
                    return Ok(None);
                }
                // Validated against MAX_MESSAGE_LENGTH before we reserve.
                let total_len = FixedHeader::parse(&src[..FIXED_HEADER_LENGTH])?.total_len();
                self.state = DecodeState::Frame { total_len };
                total_len
            },
            DecodeState::Frame { total_len } => total_len,
        };

        if src.len() < total_len {
            src.reserve(total_len - src.len());
            trace!(
                buffered = src.len(),
                total_len,
                "waiting for remainder of message"
            );
            return Ok(None);
        }

        let frame = src.split_to(total_len);
        self.state = DecodeState::Head;
        Message::decode(&frame).map(Some)
    }
}

impl<M: Borrow<Message>> Encoder<M> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), WireError> {
        let bytes = item.borrow().encode()?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}
