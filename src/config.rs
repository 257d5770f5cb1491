//! Engine configuration.

use std::time::Duration;

/// Connection attempts made after the first one fails.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// How long the caller waits in `Connecting` before abandoning the attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transfer unit requested once discovery succeeds.
pub const DEFAULT_REQUESTED_TRANSFER_UNIT: u16 = 512;

/// Characteristic payload size in force until the transfer unit is negotiated.
pub const DEFAULT_UNIT_SIZE: usize = 20;

/// ATT header overhead subtracted from a negotiated MTU.
pub const ATT_HEADER_SIZE: usize = 3;

/// Tunables for the link engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Number of automatic reconnect attempts on a failed connection result.
    pub retry_budget: u32,
    /// Timeout armed by the driver on entering `Connecting`.
    pub connect_timeout: Duration,
    /// MTU requested after a successful discovery.
    pub requested_transfer_unit: u16,
    /// Payload unit size used before the MTU response arrives.
    pub default_unit_size: usize,
    /// Capacity of the link signal broadcast channel.
    pub signal_capacity: usize,
    /// Capacity of the completed record broadcast channel.
    pub record_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_budget: DEFAULT_RETRY_BUDGET,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            requested_transfer_unit: DEFAULT_REQUESTED_TRANSFER_UNIT,
            default_unit_size: DEFAULT_UNIT_SIZE,
            signal_capacity: 32,
            record_capacity: 16,
        }
    }
}

impl EngineConfig {
    /// Set the reconnect retry budget.
    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the transfer unit requested after discovery.
    pub fn with_requested_transfer_unit(mut self, mtu: u16) -> Self {
        self.requested_transfer_unit = mtu;
        self
    }

    /// Set the payload unit size used before negotiation.
    ///
    /// Values of zero are clamped to one byte.
    pub fn with_default_unit_size(mut self, unit_size: usize) -> Self {
        self.default_unit_size = unit_size.max(1);
        self
    }

    /// Set the broadcast channel capacities for signals and records.
    pub fn with_channel_capacity(mut self, signals: usize, records: usize) -> Self {
        self.signal_capacity = signals.max(1);
        self.record_capacity = records.max(1);
        self
    }
}

/// Payload unit size for a negotiated MTU.
///
/// Never returns zero, even for a nonsensical MTU below the ATT header size.
pub fn unit_size_for_mtu(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(ATT_HEADER_SIZE).max(1)
}
