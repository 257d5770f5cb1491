//! Receive reassembly.
//!
//! The peripheral streams one 300-sample record as up to three notifications.
//! There is no length prefix or sequence number; the host tracks a rolling
//! phase counter and branches on payload length:
//!
//! | payload | phase 1            | phase 2                 | phase 3            |
//! |---------|--------------------|-------------------------|--------------------|
//! | empty   | ignored            | ignored                 | ignored            |
//! | single  | slot 1             | slot 2                  | slot 3, emit       |
//! | double  | slots 1 and 2      | slots 2 and 3, emit     | framing error      |
//!
//! After a non-empty payload the phase advances by one. A double payload at
//! phase 2 consumes phase 3 as well, so the counter wraps to phase 1.
//! Payloads that fail to decode leave both the samples and the phase untouched.

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::data::burst::{BurstRecord, Phase, RECORD_SAMPLES};
use crate::data::receive_buffer::ReceiveBuffer;
use crate::error::{Error, Result};
use crate::protocol::frame::{decode_chunk, PayloadKind, SAMPLES_PER_CHUNK};

/// Marker written to the record log each time the phase wraps.
pub const RECORD_SEPARATOR: &str = "==================================";

/// Phase-driven assembler for 300-sample records.
#[derive(Debug, Clone)]
pub struct BurstAssembler {
    phase: Phase,
    samples: [f32; RECORD_SAMPLES],
    emitted: u64,
}

impl Default for BurstAssembler {
    fn default() -> Self {
        Self {
            phase: Phase::FIRST,
            samples: [0.0; RECORD_SAMPLES],
            emitted: 0,
        }
    }
}

impl BurstAssembler {
    /// Create an assembler at phase 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// The phase the next payload will be applied to.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The working sample buffer.
    pub fn samples(&self) -> &[f32; RECORD_SAMPLES] {
        &self.samples
    }

    /// Number of records emitted so far.
    pub fn records_emitted(&self) -> u64 {
        self.emitted
    }

    /// Apply one notification payload.
    ///
    /// Returns the completed record when this payload finishes one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] for a payload that does not decode, or for
    /// a double payload arriving at phase 3. The latter still advances the phase.
    pub fn feed(&mut self, payload: &[u8]) -> Result<Option<BurstRecord>> {
        let phase = self.phase;
        trace!("Payload of {} bytes at phase {}", payload.len(), phase);

        match PayloadKind::classify(payload.len()) {
            PayloadKind::Empty => {
                debug!("Empty payload received");
                Ok(None)
            }
            PayloadKind::Single => {
                let chunk = decode_chunk(payload, 0)?;
                self.write_slot(phase.offset(), &chunk);

                let record = (phase.get() == 3).then(|| self.emit());
                self.advance(1);
                Ok(record)
            }
            PayloadKind::Double if phase.get() < 3 => {
                let first = decode_chunk(payload, 0)?;
                let second = decode_chunk(payload, 1)?;
                self.write_slot(phase.offset(), &first);
                self.write_slot(phase.offset() + SAMPLES_PER_CHUNK, &second);

                if phase.get() == 1 {
                    self.advance(1);
                    Ok(None)
                } else {
                    let record = self.emit();
                    self.advance(2);
                    Ok(Some(record))
                }
            }
            PayloadKind::Double => {
                self.advance(1);
                Err(Error::framing(format!(
                    "double payload of {} bytes at phase {}",
                    payload.len(),
                    phase
                )))
            }
        }
    }

    fn write_slot(&mut self, offset: usize, chunk: &[f32]) {
        self.samples[offset..offset + chunk.len()].copy_from_slice(chunk);
    }

    fn emit(&mut self) -> BurstRecord {
        let record = BurstRecord::new(self.emitted, &self.samples);
        self.emitted += 1;
        debug!("Record {} complete", record.sequence);
        record
    }

    fn advance(&mut self, steps: u8) {
        let (next, wrapped) = self.phase.advance(steps);
        self.phase = next;
        if wrapped {
            info!(target: "transparent_uart_ble::record", "{}", RECORD_SEPARATOR);
        }
    }
}

/// Raw accumulator plus burst assembly for the receive characteristic.
#[derive(Debug, Default)]
pub struct ReceiveReassembler {
    buffer: ReceiveBuffer,
    bursts: BurstAssembler,
}

impl ReceiveReassembler {
    /// Create an empty reassembler at phase 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle one notification.
    ///
    /// The bytes are always kept for [`drain`](Self::drain), even when
    /// burst assembly rejects them.
    pub fn on_notification(&mut self, value: &[u8]) -> Result<Option<BurstRecord>> {
        self.buffer.append(value);
        self.bursts.feed(value)
    }

    /// Take the raw bytes received since the last drain.
    pub fn drain(&mut self) -> Bytes {
        self.buffer.drain()
    }

    /// Discard undrained bytes. The burst phase is kept.
    pub fn reset_buffer(&mut self) {
        self.buffer.reset();
    }

    /// Bytes waiting to be drained.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// The burst assembler.
    pub fn bursts(&self) -> &BurstAssembler {
        &self.bursts
    }
}
