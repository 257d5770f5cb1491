//! BLE link layer.
//!
//! The platform is reached only through the [`Transport`] trait. Everything
//! above it (queueing, negotiation, the link state machine) is synchronous
//! and driven by [`TransportEvent`]s.

pub mod btleplug_transport;
pub mod connection;
pub mod gatt;
pub mod negotiator;
pub mod queue;
pub mod transport;
pub mod uuids;

pub use btleplug_transport::BtleplugTransport;
pub use connection::{ConnectionAttempt, ConnectionEvent, LinkSignal, LinkState, LinkStateMachine};
pub use gatt::{CharacteristicHandle, DescriptorHandle, GattService, WriteMode};
pub use negotiator::NegotiatedCapabilities;
pub use queue::{OperationQueue, PendingOperation};
pub use transport::{GattStatus, PeerState, Transport, TransportEvent};
pub use uuids::*;
