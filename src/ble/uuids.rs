//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains all UUID constants used for transparent UART communication.

use uuid::Uuid;

// Transparent UART Service (Nordic NUS layout, used by Microchip BM7x modules)
/// Transparent UART private service UUID.
pub const TRANSPARENT_UART_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// Send characteristic UUID (host writes to the peripheral).
pub const TRANSPARENT_SEND_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// Receive characteristic UUID (notifications from the peripheral).
pub const TRANSPARENT_RECEIVE_UUID: Uuid =
    Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

// Standard descriptors
/// Client Characteristic Configuration Descriptor UUID.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
