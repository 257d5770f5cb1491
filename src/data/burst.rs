//! Reassembled sensor records.

use chrono::{DateTime, Utc};

use crate::protocol::frame::SAMPLES_PER_CHUNK;

/// Number of phases making up one record.
pub const PHASES_PER_RECORD: u8 = 3;

/// Samples in a complete record.
pub const RECORD_SAMPLES: usize = SAMPLES_PER_CHUNK * PHASES_PER_RECORD as usize;

/// Position of the next notification within the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Phase(u8);

impl Phase {
    /// The first phase of a record.
    pub const FIRST: Phase = Phase(1);

    /// Create a phase from its 1-based number.
    ///
    /// Returns `None` outside `1..=3`.
    pub fn new(value: u8) -> Option<Self> {
        (1..=PHASES_PER_RECORD).contains(&value).then_some(Self(value))
    }

    /// The 1-based phase number.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Offset of this phase's slot in the record.
    pub fn offset(self) -> usize {
        (self.0 as usize - 1) * SAMPLES_PER_CHUNK
    }

    /// Advance by `steps`, reporting whether the counter wrapped past the last phase.
    pub fn advance(self, steps: u8) -> (Self, bool) {
        let next = self.0 + steps;
        if next > PHASES_PER_RECORD {
            (Self::FIRST, true)
        } else {
            (Self(next), false)
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Self::FIRST
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0, PHASES_PER_RECORD)
    }
}

/// One logical record stitched together from up to three notifications.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BurstRecord {
    /// Sequence number, counting from zero per reassembler.
    pub sequence: u64,
    /// When the record was completed.
    pub completed_at: DateTime<Utc>,
    samples: Vec<f32>,
}

impl BurstRecord {
    /// Create a record from a full sample buffer.
    pub fn new(sequence: u64, samples: &[f32; RECORD_SAMPLES]) -> Self {
        Self {
            sequence,
            completed_at: Utc::now(),
            samples: samples.to_vec(),
        }
    }

    /// The 300 samples in order.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// The samples contributed by one phase slot.
    pub fn slot(&self, phase: Phase) -> &[f32] {
        &self.samples[phase.offset()..phase.offset() + SAMPLES_PER_CHUNK]
    }

    /// Key under which the record is filed by a storage collaborator.
    pub fn storage_key(&self) -> String {
        self.completed_at.format("%m%d%I%M%S").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_phase_cycle() {
        let p = Phase::FIRST;
        let (p, wrapped) = p.advance(1);
        assert_eq!((p.get(), wrapped), (2, false));
        let (p, wrapped) = p.advance(1);
        assert_eq!((p.get(), wrapped), (3, false));
        let (p, wrapped) = p.advance(1);
        assert_eq!((p, wrapped), (Phase::FIRST, true));
    }

    #[test]
    fn test_phase_double_step_wraps() {
        let (p, wrapped) = Phase::new(2).unwrap().advance(2);
        assert_eq!((p, wrapped), (Phase::FIRST, true));
    }

    #[test]
    fn test_phase_bounds() {
        assert!(Phase::new(0).is_none());
        assert!(Phase::new(4).is_none());
        assert_eq!(Phase::new(3).unwrap().offset(), 200);
    }

    #[test]
    fn test_record_slots_and_key() {
        let mut samples = [0.0f32; RECORD_SAMPLES];
        samples[150] = 42.0;
        let mut record = BurstRecord::new(7, &samples);
        record.completed_at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap();

        assert_eq!(record.samples().len(), RECORD_SAMPLES);
        assert_eq!(record.slot(Phase::new(2).unwrap())[50], 42.0);
        assert_eq!(record.storage_key(), "0309020506");
    }
}
