//! [`Transport`] implementation backed by btleplug.
//!
//! btleplug is async while the link engine is not, so every request spawns a
//! task on the tokio runtime and posts its outcome back as a
//! [`TransportEvent`]. Each `open_connection` starts a new generation; results
//! from tasks belonging to an older generation are dropped.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::gatt::{CharacteristicHandle, DescriptorHandle, GattService, WriteMode};
use crate::ble::transport::{GattStatus, PeerState, Transport, TransportEvent};
use crate::ble::uuids::CCCD_UUID;
use crate::error::{Error, Result};

/// Status reported for a failed platform request.
pub const GATT_ERROR: u8 = 0x85;

/// Status reported when the peripheral drops an established link.
pub const LINK_LOST: u8 = 0x08;

/// How long to scan for a peripheral the adapter has not seen yet.
const SCAN_WINDOW: Duration = Duration::from_secs(5);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Get the first Bluetooth adapter on this system.
///
/// # Errors
///
/// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|_e| Error::BluetoothUnavailable)?;

    let adapter = manager
        .adapters()
        .await
        .map_err(Error::Bluetooth)?
        .into_iter()
        .next()
        .ok_or(Error::BluetoothUnavailable)?;

    info!(
        "Using Bluetooth adapter: {:?}",
        adapter.adapter_info().await.ok()
    );

    Ok(adapter)
}

/// State of the platform link for the current generation.
#[derive(Default)]
struct LinkSlot {
    generation: u64,
    connecting: bool,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
}

impl LinkSlot {
    fn release(&mut self) -> Option<Peripheral> {
        self.connecting = false;
        self.characteristics.clear();
        self.peripheral.take()
    }
}

/// Posts events back to the engine, dropping those from stale generations.
#[derive(Clone)]
struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    slot: Arc<RwLock<LinkSlot>>,
}

impl EventSink {
    fn post(&self, generation: u64, event: TransportEvent) {
        if self.slot.read().generation != generation {
            trace!("Dropping event from generation {}: {:?}", generation, event);
            return;
        }
        if self.tx.send(event).is_err() {
            debug!("Transport event receiver closed");
        }
    }
}

/// BLE transport over a btleplug adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    slot: Arc<RwLock<LinkSlot>>,
    sink: EventSink,
    notification_task: Option<JoinHandle<()>>,
    adapter_task: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Create a transport posting its events to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn new(adapter: Adapter, events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Internal(e.to_string()))?;
        let slot = Arc::new(RwLock::new(LinkSlot::default()));

        Ok(Self {
            adapter,
            runtime,
            sink: EventSink {
                tx: events,
                slot: slot.clone(),
            },
            slot,
            notification_task: None,
            adapter_task: None,
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// The connected peripheral and its generation.
    fn live(&self) -> Result<(u64, Peripheral)> {
        let slot = self.slot.read();
        match &slot.peripheral {
            Some(p) => Ok((slot.generation, p.clone())),
            None => Err(Error::NotConnected),
        }
    }

    fn characteristic(
        &self,
        operation: &'static str,
        handle: CharacteristicHandle,
    ) -> Result<Characteristic> {
        self.slot
            .read()
            .characteristics
            .get(&(handle.service, handle.characteristic))
            .cloned()
            .ok_or_else(|| Error::transport(operation, format!("unknown characteristic {handle}")))
    }

    fn stop_notifications(&mut self) {
        if let Some(task) = self.notification_task.take() {
            task.abort();
            debug!("Notification forwarding stopped");
        }
    }

    /// Forward adapter-level disconnects of the active peripheral.
    fn ensure_adapter_listener(&mut self) {
        if self.adapter_task.is_some() {
            return;
        }

        let adapter = self.adapter.clone();
        let slot = self.slot.clone();
        let sink = self.sink.clone();

        self.adapter_task = Some(self.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                let CentralEvent::DeviceDisconnected(id) = event else {
                    continue;
                };

                let generation = {
                    let mut slot = slot.write();
                    let active = slot
                        .peripheral
                        .as_ref()
                        .map(|p| p.id() == id)
                        .unwrap_or(false);
                    if active {
                        slot.release();
                        Some(slot.generation)
                    } else {
                        None
                    }
                };

                if let Some(generation) = generation {
                    info!("Peripheral {:?} dropped the link", id);
                    sink.post(
                        generation,
                        TransportEvent::ConnectionStateChanged {
                            status: GattStatus::Failure(LINK_LOST),
                            state: PeerState::Disconnected,
                        },
                    );
                }
            }

            debug!("Adapter event stream ended");
        }));
    }
}

impl Transport for BtleplugTransport {
    fn open_connection(&mut self, address: &str) -> Result<()> {
        self.stop_notifications();
        self.ensure_adapter_listener();

        let generation = {
            let mut slot = self.slot.write();
            slot.release();
            slot.generation += 1;
            slot.connecting = true;
            slot.generation
        };

        let adapter = self.adapter.clone();
        let slot = self.slot.clone();
        let sink = self.sink.clone();
        let address = address.to_string();

        self.spawn(async move {
            let result = async {
                let peripheral = find_peripheral(&adapter, &address).await?;
                peripheral.connect().await?;
                Ok::<_, Error>(peripheral)
            }
            .await;

            let status = match result {
                Ok(peripheral) => {
                    let current = {
                        let mut slot = slot.write();
                        if slot.generation == generation {
                            slot.connecting = false;
                            slot.peripheral = Some(peripheral.clone());
                        }
                        slot.generation == generation
                    };
                    if !current {
                        debug!("Connection to {} superseded, dropping it", address);
                        let _ = peripheral.disconnect().await;
                        return;
                    }
                    GattStatus::Success
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    let mut slot = slot.write();
                    if slot.generation == generation {
                        slot.connecting = false;
                    }
                    GattStatus::Failure(GATT_ERROR)
                }
            };

            let state = if status.is_success() {
                PeerState::Connected
            } else {
                PeerState::Disconnected
            };
            sink.post(
                generation,
                TransportEvent::ConnectionStateChanged { status, state },
            );
        });

        Ok(())
    }

    fn close_connection(&mut self) -> Result<()> {
        self.stop_notifications();

        let (generation, connecting, peripheral) = {
            let mut slot = self.slot.write();
            let connecting = slot.connecting;
            let peripheral = slot.release();
            if connecting {
                // Orphan the pending connect so its result is discarded.
                slot.generation += 1;
            }
            (slot.generation, connecting, peripheral)
        };

        let disconnected = TransportEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: PeerState::Disconnected,
        };

        match peripheral {
            Some(peripheral) => {
                let sink = self.sink.clone();
                self.spawn(async move {
                    if let Err(e) = peripheral.disconnect().await {
                        warn!("Disconnect failed: {}", e);
                    }
                    sink.post(generation, disconnected);
                });
            }
            None if connecting => self.sink.post(generation, disconnected),
            None => debug!("No live link to close"),
        }

        Ok(())
    }

    fn discover_services(&mut self) -> Result<()> {
        let (generation, peripheral) = self.live()?;
        let slot = self.slot.clone();
        let sink = self.sink.clone();

        self.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral.services();
                    {
                        let mut slot = slot.write();
                        if slot.generation == generation {
                            slot.characteristics = services
                                .iter()
                                .flat_map(|s| s.characteristics.iter())
                                .map(|c| ((c.service_uuid, c.uuid), c.clone()))
                                .collect();
                        }
                    }
                    debug!("Discovered {} services", services.len());
                    TransportEvent::ServicesDiscovered {
                        status: GattStatus::Success,
                        services: services.iter().map(GattService::from).collect(),
                    }
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    TransportEvent::ServicesDiscovered {
                        status: GattStatus::Failure(GATT_ERROR),
                        services: Vec::new(),
                    }
                }
            };
            sink.post(generation, event);
        });

        Ok(())
    }

    fn write_characteristic(
        &mut self,
        handle: CharacteristicHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let (generation, peripheral) = self.live()?;
        let characteristic = self.characteristic("write_characteristic", handle)?;
        let value = value.to_vec();
        let write_type = WriteType::from(mode);
        let sink = self.sink.clone();

        self.spawn(async move {
            let result = peripheral.write(&characteristic, &value, write_type).await;
            trace!("Wrote {} bytes to {}", value.len(), handle);
            sink.post(
                generation,
                TransportEvent::CharacteristicWritten {
                    handle,
                    status: status_of("write_characteristic", result),
                },
            );
        });

        Ok(())
    }

    fn write_descriptor(&mut self, handle: DescriptorHandle, value: &[u8]) -> Result<()> {
        let (generation, peripheral) = self.live()?;
        let characteristic = self.characteristic("write_descriptor", handle.characteristic)?;
        let sink = self.sink.clone();

        if handle.descriptor == CCCD_UUID {
            let enable = cccd_enables(value);
            debug!(
                "{} notifications on {}",
                if enable { "Subscribing to" } else { "Unsubscribing from" },
                handle.characteristic
            );
            self.spawn(async move {
                let result = if enable {
                    peripheral.subscribe(&characteristic).await
                } else {
                    peripheral.unsubscribe(&characteristic).await
                };
                sink.post(
                    generation,
                    TransportEvent::DescriptorWritten {
                        handle,
                        status: status_of("write_descriptor", result),
                    },
                );
            });
            return Ok(());
        }

        let descriptor = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == handle.descriptor)
            .cloned()
            .ok_or_else(|| {
                Error::transport(
                    "write_descriptor",
                    format!("unknown descriptor {}", handle.descriptor),
                )
            })?;
        let value = value.to_vec();

        self.spawn(async move {
            let result = peripheral.write_descriptor(&descriptor, &value).await;
            sink.post(
                generation,
                TransportEvent::DescriptorWritten {
                    handle,
                    status: status_of("write_descriptor", result),
                },
            );
        });

        Ok(())
    }

    fn enable_local_notifications(
        &mut self,
        handle: CharacteristicHandle,
        enabled: bool,
    ) -> Result<()> {
        self.stop_notifications();
        if !enabled {
            return Ok(());
        }

        let (generation, peripheral) = self.live()?;
        let sink = self.sink.clone();
        let target = handle.characteristic;

        self.notification_task = Some(self.spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            debug!("Forwarding notifications from {}", target);

            while let Some(notification) = notifications.next().await {
                if notification.uuid != target {
                    trace!("Notification from {} not routed", notification.uuid);
                    continue;
                }
                sink.post(
                    generation,
                    TransportEvent::Notification {
                        characteristic: notification.uuid,
                        value: notification.value,
                    },
                );
            }

            debug!("Notification stream ended");
        }));

        Ok(())
    }

    fn request_transfer_unit(&mut self, mtu: u16) -> Result<()> {
        // btleplug negotiates the MTU on its own and reports nothing back.
        debug!("Transfer unit request for {} not forwarded", mtu);
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.stop_notifications();
        if let Some(task) = self.adapter_task.take() {
            task.abort();
        }
    }
}

/// Check if a CCCD value turns notifications or indications on.
fn cccd_enables(value: &[u8]) -> bool {
    value.first().map(|b| b & 0x03 != 0).unwrap_or(false)
}

fn status_of(operation: &str, result: std::result::Result<(), btleplug::Error>) -> GattStatus {
    match result {
        Ok(()) => GattStatus::Success,
        Err(e) => {
            warn!("{} failed: {}", operation, e);
            GattStatus::Failure(GATT_ERROR)
        }
    }
}

fn matches_address(peripheral: &Peripheral, address: &str) -> bool {
    peripheral.address().to_string().eq_ignore_ascii_case(address)
        || peripheral.id().to_string().eq_ignore_ascii_case(address)
}

async fn lookup(adapter: &Adapter, address: &str) -> Option<Peripheral> {
    match adapter.peripherals().await {
        Ok(peripherals) => peripherals
            .into_iter()
            .find(|p| matches_address(p, address)),
        Err(e) => {
            trace!("Failed to list peripherals: {}", e);
            None
        }
    }
}

/// Find a peripheral by address, scanning briefly if the adapter has not seen it.
async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Peripheral> {
    if let Some(peripheral) = lookup(adapter, address).await {
        return Ok(peripheral);
    }

    debug!("{} not known to the adapter, scanning", address);
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = Instant::now() + SCAN_WINDOW;
    let found = loop {
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        if let Some(peripheral) = lookup(adapter, address).await {
            break Some(peripheral);
        }
        if Instant::now() >= deadline {
            break None;
        }
    };

    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan: {}", e);
    }

    found.ok_or_else(|| Error::PeripheralNotFound {
        address: address.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::ENABLE_NOTIFICATION_VALUE;

    #[test]
    fn test_cccd_values() {
        assert!(cccd_enables(&ENABLE_NOTIFICATION_VALUE));
        assert!(cccd_enables(&[0x02, 0x00]));
        assert!(!cccd_enables(&[0x00, 0x00]));
        assert!(!cccd_enables(&[]));
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of("write", Ok(())), GattStatus::Success);
        assert_eq!(
            status_of("write", Err(btleplug::Error::NotConnected)),
            GattStatus::Failure(GATT_ERROR)
        );
    }

    #[tokio::test]
    async fn test_sink_drops_stale_generations() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slot = Arc::new(RwLock::new(LinkSlot::default()));
        let sink = EventSink {
            tx,
            slot: slot.clone(),
        };
        let event = TransportEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: PeerState::Connected,
        };

        sink.post(0, event.clone());
        slot.write().generation = 1;
        sink.post(0, event.clone());
        sink.post(1, event.clone());

        assert_eq!(rx.recv().await, Some(event.clone()));
        assert_eq!(rx.recv().await, Some(event));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_slot_release() {
        let mut slot = LinkSlot {
            connecting: true,
            ..Default::default()
        };
        assert!(slot.release().is_none());
        assert!(!slot.connecting);
    }
}
