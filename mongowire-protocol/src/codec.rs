//! Incremental decoder for length-prefixed messages.

use crate::error::ProtocolError;
use crate::message::{check_message_length, Message, ReplyMessage, HEADER_SIZE};
use bytes::{Bytes, BytesMut};

/// Buffers incoming bytes and splits them into whole messages.
pub struct MessageDecoder {
    buffer: BytesMut,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Bytes still missing before the next message is complete.
    ///
    /// Returns 0 once a whole message is buffered. Until the length prefix
    /// has arrived this reports what is needed to complete the header.
    pub fn needed(&self) -> Result<usize, ProtocolError> {
        match self.peek_length()? {
            Some(len) => Ok(len.saturating_sub(self.buffer.len())),
            None => Ok(HEADER_SIZE - self.buffer.len()),
        }
    }

    fn peek_length(&self) -> Result<Option<usize>, ProtocolError> {
        let Some(prefix) = self.buffer.get(..4) else {
            return Ok(None);
        };
        let declared = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        check_message_length(declared).map(Some)
    }

    /// Splits off the next complete message, if one is buffered.
    pub fn decode_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        match self.peek_length()? {
            Some(len) if self.buffer.len() >= len => Ok(Some(self.buffer.split_to(len).freeze())),
            _ => Ok(None),
        }
    }

    /// Attempts to decode the next message of any kind.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Message::decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Attempts to decode the next message as a reply.
    pub fn decode_reply(&mut self) -> Result<Option<ReplyMessage>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => ReplyMessage::decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}
