// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # transparent-uart-ble
//!
//! A cross-platform Rust library for talking to BLE peripherals that expose a
//! transparent UART service: one characteristic the host writes to and one
//! the peripheral notifies on.
//!
//! ## Features
//!
//! - **Link management**: connect with automatic retries, discovery and a
//!   caller-armed connect timeout
//! - **Serialized writes**: at most one GATT write in flight, chunked to the
//!   negotiated transfer unit
//! - **Capability negotiation**: the service, both characteristics, the
//!   notify and write properties and the notification descriptor are checked
//!   before anything is written
//! - **Record reassembly**: 300-sample sensor records stitched together from
//!   up to three notifications
//! - **Testable core**: the state machine is synchronous and talks to the
//!   platform only through the [`Transport`] trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use transparent_uart_ble::{LinkSignal, Result, UartClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = UartClient::new().await?;
//!
//!     let _records = client.on_record(|record| {
//!         println!("Record {}: {} samples", record.sequence, record.samples().len());
//!     });
//!
//!     client.connect_and_wait("AA:BB:CC:DD:EE:FF").await?;
//!     client.write_to_uart(b"start\r\n").await?;
//!
//!     let mut signals = client.subscribe_signals();
//!     while let Ok(signal) = signals.recv().await {
//!         match signal {
//!             LinkSignal::NewDataReceived => {
//!                 let bytes = client.read_received_bytes().await?;
//!                 println!("{} bytes", bytes.len());
//!             }
//!             LinkSignal::Disconnected => break,
//!             _ => {}
//!         }
//!     }
//!
//!     client.shutdown().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Peripherals are addressed by their
//! CoreBluetooth identifier rather than a MAC address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod protocol;

// Re-exports for convenience
pub use client::{CallbackHandle, LinkSnapshot, UartClient};
pub use config::EngineConfig;
pub use error::{Capability, Error, Result};

pub use ble::connection::{ConnectionEvent, LinkSignal, LinkState, LinkStateMachine};
pub use ble::negotiator::NegotiatedCapabilities;
pub use ble::transport::{Transport, TransportEvent};
pub use data::{BurstRecord, Phase};

/// Install a test subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
#[cfg(test)]
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("transparent_uart_ble=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<UartClient>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<EngineConfig>();
        let _ = std::any::TypeId::of::<BurstRecord>();
        let _ = std::any::TypeId::of::<LinkSignal>();
        let _ = std::any::TypeId::of::<ConnectionEvent>();
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::debug!("subscriber installed");
    }

    #[test]
    fn test_default_config_matches_link_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_budget, 3);
        assert_eq!(config.default_unit_size, 20);
    }
}
