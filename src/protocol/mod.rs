//! Wire format of the transparent UART link.
//!
//! This module contains:
//! - Outbound chunking and sample decoding
//! - Multi-notification record reassembly

pub mod frame;
pub mod reassembler;

pub use frame::{decode_samples, encode, PayloadKind};
pub use reassembler::{BurstAssembler, ReceiveReassembler};
