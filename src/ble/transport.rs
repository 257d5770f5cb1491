//! Platform transport boundary.
//!
//! The link engine talks to the BLE stack only through the [`Transport`]
//! trait, and the stack answers only through [`TransportEvent`]s. Requests
//! are fire-and-forget: a primitive returning `Ok` means the platform
//! accepted the request, and the outcome arrives later as an event.

use uuid::Uuid;

use crate::ble::gatt::{CharacteristicHandle, DescriptorHandle, GattService, WriteMode};
use crate::error::Result;

/// Request primitives offered by the platform BLE stack.
#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// Start connecting to the peripheral at `address`.
    fn open_connection(&mut self, address: &str) -> Result<()>;

    /// Tear down the link and release the platform handle.
    ///
    /// An established link reports `Disconnected` through
    /// [`TransportEvent::ConnectionStateChanged`].
    fn close_connection(&mut self) -> Result<()>;

    /// Start GATT service discovery.
    fn discover_services(&mut self) -> Result<()>;

    /// Write one payload unit to a characteristic.
    fn write_characteristic(
        &mut self,
        handle: CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Write a descriptor value.
    fn write_descriptor(&mut self, handle: DescriptorHandle, value: &[u8]) -> Result<()>;

    /// Route notifications for a characteristic to the host.
    fn enable_local_notifications(
        &mut self,
        handle: CharacteristicHandle,
        enabled: bool,
    ) -> Result<()>;

    /// Ask for a larger ATT MTU.
    fn request_transfer_unit(&mut self, mtu: u16) -> Result<()>;
}

/// Outcome status reported with a platform callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattStatus {
    /// The operation completed.
    Success,
    /// The operation failed with a platform-specific code.
    Failure(u8),
}

impl GattStatus {
    /// Check for success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for GattStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(code) => write!(f, "failure ({code})"),
        }
    }
}

/// Link-level state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// The link is up.
    Connected,
    /// The link is down.
    Disconnected,
}

/// A platform callback, delivered to the engine one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connect or disconnect request finished, or the link dropped.
    ConnectionStateChanged {
        /// Whether the request succeeded.
        status: GattStatus,
        /// The link state after the change.
        state: PeerState,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Whether discovery succeeded.
        status: GattStatus,
        /// The discovered services (empty on failure).
        services: Vec<GattService>,
    },
    /// The MTU negotiation finished.
    TransferUnitChanged {
        /// The negotiated MTU.
        mtu: u16,
        /// Whether negotiation succeeded.
        status: GattStatus,
    },
    /// A characteristic write completed.
    CharacteristicWritten {
        /// The characteristic written.
        handle: CharacteristicHandle,
        /// Whether the write succeeded.
        status: GattStatus,
    },
    /// A descriptor write completed.
    DescriptorWritten {
        /// The descriptor written.
        handle: DescriptorHandle,
        /// Whether the write succeeded.
        status: GattStatus,
    },
    /// A characteristic notification arrived.
    Notification {
        /// UUID of the notifying characteristic.
        characteristic: Uuid,
        /// The notified value.
        value: Vec<u8>,
    },
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-written transport double that records calls in order.

    use super::*;
    use crate::error::Error;

    /// One recorded transport call.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Open(String),
        Close,
        Discover,
        WriteCharacteristic(CharacteristicHandle, Vec<u8>, WriteMode),
        WriteDescriptor(DescriptorHandle, Vec<u8>),
        EnableNotifications(CharacteristicHandle, bool),
        RequestTransferUnit(u16),
    }

    /// Records every call and optionally rejects writes.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        pub calls: Vec<Call>,
        pub reject_writes: bool,
        pub reject_open: bool,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn take_calls(&mut self) -> Vec<Call> {
            std::mem::take(&mut self.calls)
        }

        pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| f(c)).count()
        }
    }

    impl Transport for RecordingTransport {
        fn open_connection(&mut self, address: &str) -> Result<()> {
            self.calls.push(Call::Open(address.to_string()));
            if self.reject_open {
                return Err(Error::transport("open_connection", "rejected"));
            }
            Ok(())
        }

        fn close_connection(&mut self) -> Result<()> {
            self.calls.push(Call::Close);
            Ok(())
        }

        fn discover_services(&mut self) -> Result<()> {
            self.calls.push(Call::Discover);
            Ok(())
        }

        fn write_characteristic(
            &mut self,
            handle: CharacteristicHandle,
            value: &[u8],
            mode: WriteMode,
        ) -> Result<()> {
            self.calls
                .push(Call::WriteCharacteristic(handle, value.to_vec(), mode));
            if self.reject_writes {
                return Err(Error::transport("write_characteristic", "rejected"));
            }
            Ok(())
        }

        fn write_descriptor(&mut self, handle: DescriptorHandle, value: &[u8]) -> Result<()> {
            self.calls.push(Call::WriteDescriptor(handle, value.to_vec()));
            if self.reject_writes {
                return Err(Error::transport("write_descriptor", "rejected"));
            }
            Ok(())
        }

        fn enable_local_notifications(
            &mut self,
            handle: CharacteristicHandle,
            enabled: bool,
        ) -> Result<()> {
            self.calls.push(Call::EnableNotifications(handle, enabled));
            Ok(())
        }

        fn request_transfer_unit(&mut self, mtu: u16) -> Result<()> {
            self.calls.push(Call::RequestTransferUnit(mtu));
            Ok(())
        }
    }
}
