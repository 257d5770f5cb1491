//! Error types for the transparent-uart-ble crate.

use thiserror::Error;

use crate::ble::connection::LinkState;

/// A capability the link needs from the peripheral's GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The transparent UART service itself.
    Service,
    /// The characteristic the peripheral notifies on.
    ReceiveCharacteristic,
    /// The notify property on the receive characteristic.
    NotifyProperty,
    /// The client characteristic configuration descriptor on the receive characteristic.
    NotificationDescriptor,
    /// The characteristic the host writes to.
    SendCharacteristic,
    /// A write property (with or without response) on the send characteristic.
    WriteProperty,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => write!(f, "transparent UART service"),
            Self::ReceiveCharacteristic => write!(f, "receive characteristic"),
            Self::NotifyProperty => write!(f, "notify property on receive characteristic"),
            Self::NotificationDescriptor => write!(f, "notification descriptor (CCCD)"),
            Self::SendCharacteristic => write!(f, "send characteristic"),
            Self::WriteProperty => write!(f, "write property on send characteristic"),
        }
    }
}

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No peripheral with the requested address is known to the adapter.
    #[error("Peripheral not found: {address}")]
    PeripheralNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Operation requires a discovered connection but there is none.
    #[error("Peripheral not connected")]
    NotConnected,

    /// A transport primitive failed at the platform level.
    #[error("Transport error during {operation}: {reason}")]
    Transport {
        /// The primitive that failed.
        operation: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// A notification payload did not match the expected sample framing.
    #[error("Framing error: {context}")]
    Framing {
        /// Description of what was malformed.
        context: String,
    },

    /// A required GATT capability is absent on the peripheral.
    #[error("Capability missing: {capability}")]
    CapabilityMissing {
        /// The capability that was not found.
        capability: Capability,
    },

    /// The operation is not valid in the current link state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The link state at the time of the call.
        state: LinkState,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The connect timeout expired before the UART was ready.
    #[error("Connect timed out")]
    Timeout,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::Transport`] failure.
    pub(crate) fn transport(operation: &'static str, reason: impl ToString) -> Self {
        Self::Transport {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a [`Error::Framing`] failure.
    pub(crate) fn framing(context: impl Into<String>) -> Self {
        Self::Framing {
            context: context.into(),
        }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CapabilityMissing {
            capability: Capability::NotifyProperty,
        };
        assert_eq!(
            err.to_string(),
            "Capability missing: notify property on receive characteristic"
        );

        let err = Error::InvalidState {
            operation: "connect",
            state: LinkState::Connected,
        };
        assert_eq!(err.to_string(), "Cannot connect while Connected");

        assert_eq!(Error::Timeout.to_string(), "Connect timed out");

        let err = Error::transport("discover_services", "gatt status 133");
        assert_eq!(
            err.to_string(),
            "Transport error during discover_services: gatt status 133"
        );
    }
}
