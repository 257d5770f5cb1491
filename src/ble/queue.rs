//! Serialized radio write queue.
//!
//! The radio accepts one outstanding write at a time. Every characteristic
//! and descriptor write goes through [`OperationQueue`], which keeps the
//! head of the queue in flight and dispatches the next entry only once the
//! head's completion arrives.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, trace, warn};

use crate::ble::gatt::{CharacteristicHandle, DescriptorHandle, WriteMode};
use crate::ble::transport::Transport;

/// A radio write waiting for its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOperation {
    /// One payload unit for a characteristic.
    CharacteristicWrite {
        /// Target characteristic.
        handle: CharacteristicHandle,
        /// Payload, at most one negotiated unit.
        payload: Bytes,
        /// Acknowledgement mode chosen during discovery.
        mode: WriteMode,
    },
    /// A descriptor value.
    DescriptorWrite {
        /// Target descriptor.
        handle: DescriptorHandle,
        /// Descriptor value.
        value: Bytes,
    },
}

/// Which kind of completion a platform callback reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Characteristic write completion.
    Characteristic,
    /// Descriptor write completion.
    Descriptor,
}

impl PendingOperation {
    /// The completion kind this operation expects.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CharacteristicWrite { .. } => OperationKind::Characteristic,
            Self::DescriptorWrite { .. } => OperationKind::Descriptor,
        }
    }

    fn dispatch<T: Transport + ?Sized>(&self, transport: &mut T) -> crate::error::Result<()> {
        match self {
            Self::CharacteristicWrite {
                handle,
                payload,
                mode,
            } => transport.write_characteristic(*handle, payload, *mode),
            Self::DescriptorWrite { handle, value } => transport.write_descriptor(*handle, value),
        }
    }
}

/// FIFO of pending writes with at most one in flight.
#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<PendingOperation>,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued operations, including the one in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The operation currently in flight.
    pub fn in_flight(&self) -> Option<&PendingOperation> {
        self.pending.front()
    }

    /// Append an operation, dispatching it at once if the queue was idle.
    pub fn enqueue<T: Transport + ?Sized>(&mut self, op: PendingOperation, transport: &mut T) {
        self.pending.push_back(op);
        trace!("Queued radio operation, {} pending", self.pending.len());

        if self.pending.len() == 1 {
            self.dispatch_head(transport);
        }
    }

    /// Retire the in-flight operation and dispatch the next one.
    ///
    /// Success and failure both free the slot. Failures are logged, not retried.
    pub fn on_operation_complete<T: Transport + ?Sized>(
        &mut self,
        kind: OperationKind,
        success: bool,
        transport: &mut T,
    ) {
        let Some(done) = self.pending.pop_front() else {
            warn!("{:?} write completed with nothing in flight", kind);
            return;
        };

        if done.kind() != kind {
            warn!(
                "{:?} completion arrived while {:?} write was in flight",
                kind,
                done.kind()
            );
        }

        if success {
            debug!("{:?} write completed", done.kind());
        } else {
            warn!("{:?} write failed", done.kind());
        }

        self.dispatch_head(transport);
    }

    /// Drop every pending operation without dispatching.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Dropping {} pending radio operations", self.pending.len());
        }
        self.pending.clear();
    }

    /// Issue the head to the transport.
    ///
    /// A request the platform refuses outright will never complete, so it is
    /// retired as a failure and the next head is tried.
    fn dispatch_head<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        while let Some(head) = self.pending.front() {
            match head.dispatch(transport) {
                Ok(()) => {
                    trace!("Dispatched {:?} write", head.kind());
                    return;
                }
                Err(e) => {
                    warn!("Radio rejected {:?} write: {}", head.kind(), e);
                    self.pending.pop_front();
                }
            }
        }
    }
}
