//! GATT attribute model.
//!
//! A platform-neutral snapshot of the services, characteristics and
//! descriptors reported by service discovery. Only what capability
//! negotiation needs is kept.

use btleplug::api::{CharPropFlags, WriteType};
use uuid::Uuid;

/// Identifies a characteristic within a peripheral's GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// UUID of the owning service.
    pub service: Uuid,
    /// UUID of the characteristic.
    pub characteristic: Uuid,
}

impl CharacteristicHandle {
    /// Create a new characteristic handle.
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl std::fmt::Display for CharacteristicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Identifies a descriptor on a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    /// The characteristic the descriptor belongs to.
    pub characteristic: CharacteristicHandle,
    /// UUID of the descriptor.
    pub descriptor: Uuid,
}

impl DescriptorHandle {
    /// Create a new descriptor handle.
    pub fn new(characteristic: CharacteristicHandle, descriptor: Uuid) -> Self {
        Self {
            characteristic,
            descriptor,
        }
    }
}

impl std::fmt::Display for DescriptorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.characteristic, self.descriptor)
    }
}

/// How characteristic writes are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteMode {
    /// Write request, acknowledged by the peripheral.
    WithResponse,
    /// Write command, no acknowledgement.
    WithoutResponse,
}

impl WriteMode {
    /// Pick the write mode a characteristic supports, preferring no-ack writes.
    pub fn select(properties: CharPropFlags) -> Option<Self> {
        if properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            Some(Self::WithoutResponse)
        } else if properties.contains(CharPropFlags::WRITE) {
            Some(Self::WithResponse)
        } else {
            None
        }
    }
}

impl From<WriteMode> for WriteType {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        }
    }
}

/// A discovered descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    /// Descriptor UUID.
    pub uuid: Uuid,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Advertised properties.
    pub properties: CharPropFlags,
    /// Descriptors attached to the characteristic.
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    /// Create a characteristic without descriptors.
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        Self {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor.
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(GattDescriptor { uuid });
        self
    }

    /// Look up a descriptor by UUID.
    pub fn descriptor(&self, uuid: &Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == *uuid)
    }

    /// Check if the characteristic advertises notifications.
    pub fn can_notify(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of the service.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Create an empty service.
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Attach a characteristic.
    pub fn with_characteristic(mut self, characteristic: GattCharacteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Look up a characteristic by UUID.
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

/// Find a service by UUID in a discovery result.
pub fn find_service<'a>(services: &'a [GattService], uuid: &Uuid) -> Option<&'a GattService> {
    services.iter().find(|s| s.uuid == *uuid)
}

impl From<&btleplug::api::Service> for GattService {
    fn from(service: &btleplug::api::Service) -> Self {
        Self {
            uuid: service.uuid,
            characteristics: service
                .characteristics
                .iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    properties: c.properties,
                    descriptors: c
                        .descriptors
                        .iter()
                        .map(|d| GattDescriptor { uuid: d.uuid })
                        .collect(),
                })
                .collect(),
        }
    }
}
