/*!
Incremental message extraction from a byte stream.

A serial transport delivers bytes in arbitrary chunks: a read may end in the
middle of a message or contain several messages back to back. The decoder
buffers input until a full `0x7E ... 0xE7` message is available, skips noise
between messages and resynchronises after a corrupt frame.
*/

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::message::{decode_prefix, FrameError, Message};
use crate::protocol::START_OF_MESSAGE;

/// Decoder synchronization state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Searching for a start delimiter
    Hunting,
    /// Positioned on a start delimiter, waiting for the rest of the message
    InMessage { needed: usize },
}

/// Buffering decoder for widget messages
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: BytesMut,
    state: SyncState,
    messages_decoded: u64,
    bytes_skipped: u64,
    framing_errors: u64,
}

impl StreamDecoder {
    /// Create a new empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            state: SyncState::Hunting,
            messages_decoded: 0,
            bytes_skipped: 0,
            framing_errors: 0,
        }
    }

    /// Append raw bytes received from the transport
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Extract the next complete message.
    ///
    /// `Ok(None)` means more bytes are needed. A framing error is returned
    /// once for the offending frame; the decoder has already skipped past its
    /// start delimiter, so calling again continues with the following data.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        self.skip_to_start();

        if self.buffer.is_empty() {
            self.state = SyncState::Hunting;
            return Ok(None);
        }

        match decode_prefix(&self.buffer) {
            Ok((message, used)) => {
                self.buffer.advance(used);
                self.messages_decoded += 1;
                self.state = SyncState::Hunting;
                Ok(Some(message))
            }
            Err(FrameError::Incomplete { needed }) => {
                self.state = SyncState::InMessage { needed };
                Ok(None)
            }
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                self.framing_errors += 1;
                // Skip this start delimiter and hunt for the next one
                self.buffer.advance(1);
                self.state = SyncState::Hunting;
                Err(e)
            }
        }
    }

    /// Push bytes and collect every complete message, ignoring framing errors
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Message> {
        self.push(bytes);

        let mut messages = Vec::new();
        loop {
            match self.next_message() {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        messages
    }

    /// Discard everything before the next start delimiter
    fn skip_to_start(&mut self) {
        let skip = self
            .buffer
            .iter()
            .position(|&b| b == START_OF_MESSAGE)
            .unwrap_or(self.buffer.len());

        if skip > 0 {
            debug!("Skipping {} bytes of noise before start delimiter", skip);
            self.bytes_skipped += skip as u64;
            self.buffer.advance(skip);
        }
    }

    /// Get current state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Number of bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Get statistics: (messages decoded, bytes skipped, framing errors)
    pub fn stats(&self) -> (u64, u64, u64) {
        (self.messages_decoded, self.bytes_skipped, self.framing_errors)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}
