//! Capability negotiation.
//!
//! Runs once per connection when service discovery completes. The
//! discovered GATT table is checked in full before anything is written, so
//! a peripheral missing any required capability leaves no writes behind.

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::ble::gatt::{
    find_service, CharacteristicHandle, DescriptorHandle, GattService, WriteMode,
};
use crate::ble::queue::{OperationQueue, PendingOperation};
use crate::ble::transport::Transport;
use crate::ble::uuids::*;
use crate::config::unit_size_for_mtu;
use crate::error::{Capability, Error, Result};

/// What the peripheral offers for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    /// The characteristic the peripheral notifies on.
    pub receive: CharacteristicHandle,
    /// The characteristic the host writes to.
    pub send: CharacteristicHandle,
    /// Write mode chosen for the send characteristic.
    pub write_mode: WriteMode,
    /// Whether notification enablement was issued.
    pub notify_enabled: bool,
    /// Largest payload per characteristic write.
    pub unit_size: usize,
}

impl NegotiatedCapabilities {
    /// Apply a negotiated MTU.
    pub fn apply_mtu(&mut self, mtu: u16) {
        self.unit_size = unit_size_for_mtu(mtu);
    }
}

/// Validated discovery result, ready to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPlan {
    /// Receive characteristic.
    pub receive: CharacteristicHandle,
    /// Its notification descriptor.
    pub cccd: DescriptorHandle,
    /// Send characteristic.
    pub send: CharacteristicHandle,
    /// Write mode for the send characteristic.
    pub write_mode: WriteMode,
}

/// Check the discovered services for everything the link needs.
///
/// Every missing capability is logged; the first one is returned.
///
/// # Errors
///
/// Returns [`Error::CapabilityMissing`] if the service, either
/// characteristic, the notify property, the notification descriptor or a
/// write property is absent.
pub fn inspect(services: &[GattService]) -> Result<DiscoveryPlan> {
    let Some(service) = find_service(services, &TRANSPARENT_UART_SERVICE_UUID) else {
        warn!("Did not find transparent UART service");
        return Err(Error::CapabilityMissing {
            capability: Capability::Service,
        });
    };
    info!("Found transparent UART service");

    let mut missing = Vec::new();

    let receive = match service.characteristic(&TRANSPARENT_RECEIVE_UUID) {
        Some(characteristic) => {
            debug!("Found receive characteristic");
            if !characteristic.can_notify() {
                warn!("Receive characteristic does not have notify property");
                missing.push(Capability::NotifyProperty);
            } else if characteristic.descriptor(&CCCD_UUID).is_none() {
                warn!("No CCCD descriptor on receive characteristic");
                missing.push(Capability::NotificationDescriptor);
            }
            Some(CharacteristicHandle::new(service.uuid, characteristic.uuid))
        }
        None => {
            warn!("Did not find receive characteristic");
            missing.push(Capability::ReceiveCharacteristic);
            None
        }
    };

    let send = match service.characteristic(&TRANSPARENT_SEND_UUID) {
        Some(characteristic) => {
            debug!("Found send characteristic");
            let mode = WriteMode::select(characteristic.properties);
            if mode.is_none() {
                warn!("Send characteristic does not have write property");
                missing.push(Capability::WriteProperty);
            }
            mode.map(|m| (CharacteristicHandle::new(service.uuid, characteristic.uuid), m))
        }
        None => {
            warn!("Did not find send characteristic");
            missing.push(Capability::SendCharacteristic);
            None
        }
    };

    match (missing.first(), receive, send) {
        (None, Some(receive), Some((send, write_mode))) => Ok(DiscoveryPlan {
            receive,
            cccd: DescriptorHandle::new(receive, CCCD_UUID),
            send,
            write_mode,
        }),
        (Some(&capability), _, _) => Err(Error::CapabilityMissing { capability }),
        _ => Err(Error::Internal(
            "capability check passed without handles".to_string(),
        )),
    }
}

/// Apply a validated plan.
///
/// Enables notifications locally, queues the remote CCCD write and asks for a
/// larger transfer unit. The unit size stays at `default_unit_size` until the
/// MTU response arrives.
///
/// # Errors
///
/// Returns [`Error::Transport`] if local notification enablement is refused.
pub fn apply<T: Transport + ?Sized>(
    plan: &DiscoveryPlan,
    queue: &mut OperationQueue,
    transport: &mut T,
    requested_mtu: u16,
    default_unit_size: usize,
) -> Result<NegotiatedCapabilities> {
    transport.enable_local_notifications(plan.receive, true)?;

    queue.enqueue(
        PendingOperation::DescriptorWrite {
            handle: plan.cccd,
            value: Bytes::from_static(&ENABLE_NOTIFICATION_VALUE),
        },
        transport,
    );

    if let Err(e) = transport.request_transfer_unit(requested_mtu) {
        warn!("Transfer unit request refused, keeping default: {}", e);
    }

    debug!("Send characteristic uses {:?}", plan.write_mode);

    Ok(NegotiatedCapabilities {
        receive: plan.receive,
        send: plan.send,
        write_mode: plan.write_mode,
        notify_enabled: true,
        unit_size: default_unit_size,
    })
}

/// Inspect the services and apply the result.
///
/// # Errors
///
/// See [`inspect`] and [`apply`].
pub fn negotiate<T: Transport + ?Sized>(
    services: &[GattService],
    queue: &mut OperationQueue,
    transport: &mut T,
    requested_mtu: u16,
    default_unit_size: usize,
) -> Result<NegotiatedCapabilities> {
    let plan = inspect(services)?;
    apply(&plan, queue, transport, requested_mtu, default_unit_size)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use btleplug::api::CharPropFlags;

    use crate::ble::gatt::{GattCharacteristic, GattService};
    use crate::ble::uuids::*;

    /// A well-formed transparent UART table.
    pub fn uart_services() -> Vec<GattService> {
        uart_services_with(
            CharPropFlags::NOTIFY,
            true,
            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        )
    }

    pub fn uart_services_with(
        receive_props: CharPropFlags,
        with_cccd: bool,
        send_props: CharPropFlags,
    ) -> Vec<GattService> {
        let mut receive = GattCharacteristic::new(TRANSPARENT_RECEIVE_UUID, receive_props);
        if with_cccd {
            receive = receive.with_descriptor(CCCD_UUID);
        }
        vec![GattService::new(TRANSPARENT_UART_SERVICE_UUID)
            .with_characteristic(receive)
            .with_characteristic(GattCharacteristic::new(TRANSPARENT_SEND_UUID, send_props))]
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::ble::transport::testing::{Call, RecordingTransport};
    use crate::ble::transport::MockTransport;
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;

    fn receive_handle() -> CharacteristicHandle {
        CharacteristicHandle::new(TRANSPARENT_UART_SERVICE_UUID, TRANSPARENT_RECEIVE_UUID)
    }

    fn missing(services: &[GattService]) -> Capability {
        match inspect(services) {
            Err(Error::CapabilityMissing { capability }) => capability,
            other => panic!("expected missing capability, got {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_success() {
        let mut transport = RecordingTransport::new();
        let mut queue = OperationQueue::new();

        let caps = negotiate(&uart_services(), &mut queue, &mut transport, 512, 20).unwrap();

        assert_eq!(caps.write_mode, WriteMode::WithoutResponse);
        assert_eq!(caps.unit_size, 20);
        assert!(caps.notify_enabled);
        assert_eq!(
            transport.take_calls(),
            vec![
                Call::EnableNotifications(receive_handle(), true),
                Call::WriteDescriptor(
                    DescriptorHandle::new(receive_handle(), CCCD_UUID),
                    ENABLE_NOTIFICATION_VALUE.to_vec()
                ),
                Call::RequestTransferUnit(512),
            ]
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_write_with_response_fallback() {
        let services = uart_services_with(CharPropFlags::NOTIFY, true, CharPropFlags::WRITE);
        let plan = inspect(&services).unwrap();
        assert_eq!(plan.write_mode, WriteMode::WithResponse);
    }

    #[test]
    fn test_missing_service() {
        assert_eq!(missing(&[]), Capability::Service);
    }

    #[test]
    fn test_missing_notify_property_leaves_queue_empty() {
        let services = uart_services_with(CharPropFlags::READ, true, CharPropFlags::WRITE);
        let mut mock = MockTransport::new();
        mock.expect_enable_local_notifications().never();
        mock.expect_write_descriptor().never();
        mock.expect_request_transfer_unit().never();

        let mut queue = OperationQueue::new();
        let result = negotiate(&services, &mut queue, &mut mock, 512, 20);

        assert!(matches!(
            result,
            Err(Error::CapabilityMissing {
                capability: Capability::NotifyProperty
            })
        ));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_missing_descriptor() {
        let services = uart_services_with(CharPropFlags::NOTIFY, false, CharPropFlags::WRITE);
        assert_eq!(missing(&services), Capability::NotificationDescriptor);
    }

    #[test]
    fn test_missing_write_property() {
        let services = uart_services_with(CharPropFlags::NOTIFY, true, CharPropFlags::READ);
        assert_eq!(missing(&services), Capability::WriteProperty);
    }

    #[test]
    fn test_missing_characteristics() {
        let services = vec![GattService::new(TRANSPARENT_UART_SERVICE_UUID)];
        assert_eq!(missing(&services), Capability::ReceiveCharacteristic);
    }

    #[test]
    fn test_apply_mtu() {
        let mut transport = RecordingTransport::new();
        let mut queue = OperationQueue::new();
        let mut caps = negotiate(&uart_services(), &mut queue, &mut transport, 512, 20).unwrap();
        caps.apply_mtu(247);
        assert_eq!(caps.unit_size, 244);
    }
}
