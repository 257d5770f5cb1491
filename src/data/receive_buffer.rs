//! Raw receive accumulator.

use bytes::{Bytes, BytesMut};

/// Append-only store for notification bytes not yet read by the consumer.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    bytes: BytesMut,
}

impl ReceiveBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification payload.
    pub fn append(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Take everything accumulated so far, leaving the buffer empty.
    pub fn drain(&mut self) -> Bytes {
        self.bytes.split().freeze()
    }

    /// Discard everything accumulated.
    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Bytes waiting to be drained.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
