//! Data received from the peripheral.

pub mod burst;
pub mod receive_buffer;

pub use burst::{BurstRecord, Phase, RECORD_SAMPLES};
pub use receive_buffer::ReceiveBuffer;
