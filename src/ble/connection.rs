//! BLE link management.
//!
//! [`LinkStateMachine`] owns the connection lifecycle for one peripheral. It
//! is driven by two sources only: public calls ([`connect`], [`disconnect`],
//! [`write_to_uart`], [`read_received_bytes`]) and platform callbacks fed
//! one at a time through [`handle_event`]. It holds no locks; whoever drives
//! it must serialize those calls.
//!
//! [`connect`]: LinkStateMachine::connect
//! [`disconnect`]: LinkStateMachine::disconnect
//! [`write_to_uart`]: LinkStateMachine::write_to_uart
//! [`read_received_bytes`]: LinkStateMachine::read_received_bytes
//! [`handle_event`]: LinkStateMachine::handle_event

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::gatt::GattService;
use crate::ble::negotiator::{self, NegotiatedCapabilities};
use crate::ble::queue::{OperationKind, OperationQueue, PendingOperation};
use crate::ble::transport::{GattStatus, PeerState, Transport, TransportEvent};
use crate::ble::uuids::TRANSPARENT_RECEIVE_UUID;
use crate::config::EngineConfig;
use crate::data::burst::BurstRecord;
use crate::error::{Error, Result};
use crate::protocol::frame;
use crate::protocol::reassembler::ReceiveReassembler;

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// No link and no attempt in progress.
    #[default]
    Disconnected,
    /// Waiting for the platform to report the link up.
    Connecting,
    /// Link up, GATT discovery and negotiation in progress.
    Discovering,
    /// Link up and the UART service ready for use.
    Connected,
    /// Teardown requested, waiting for the platform to confirm.
    Disconnecting,
}

impl LinkState {
    /// Check if the UART is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Discovering | Self::Disconnecting
        )
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Signals raised to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkSignal {
    /// The link came up; discovery follows.
    Connected,
    /// The link is down for good (retries exhausted or requested).
    Disconnected,
    /// The UART service is ready.
    DiscoveryDone,
    /// The peripheral lacks the UART service or its capabilities.
    DiscoveryFailed,
    /// Notification bytes are waiting in the receive buffer.
    NewDataReceived,
    /// The caller-armed connect timeout expired while still connecting.
    ConnectTimeout,
}

/// Event for link state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Address of the peripheral.
    pub address: String,
    /// The previous link state.
    pub old: LinkState,
    /// The new link state.
    pub new: LinkState,
}

/// Identifies one armed connect timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeoutToken(u64);

/// The platform connection handle of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    /// Peripheral address the handle was opened for.
    pub address: String,
    /// Increments with every `connect`.
    pub generation: u64,
}

/// Bookkeeping for the current connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAttempt {
    /// Peripheral address.
    pub address: String,
    /// Reconnects left before a failure is reported.
    pub retries_remaining: u32,
    /// The live platform handle.
    pub handle: TransportHandle,
}

/// Everything that lives exactly as long as one connection.
#[derive(Debug)]
struct Session {
    attempt: ConnectionAttempt,
    queue: OperationQueue,
    capabilities: Option<NegotiatedCapabilities>,
    reassembler: ReceiveReassembler,
}

impl Session {
    fn new(attempt: ConnectionAttempt) -> Self {
        Self {
            attempt,
            queue: OperationQueue::new(),
            capabilities: None,
            reassembler: ReceiveReassembler::new(),
        }
    }
}

/// Connection lifecycle, write serialization and receive pipeline for one peripheral.
pub struct LinkStateMachine<T: Transport> {
    transport: T,
    config: EngineConfig,
    state: LinkState,
    /// Mirror of `state` for readers outside the driver task.
    shared_state: Arc<RwLock<LinkState>>,
    session: Option<Session>,
    /// Handle left over from the previous session, closed on the next connect.
    stale_handle: Option<TransportHandle>,
    address: Option<String>,
    generation: u64,
    connect_timer: Option<TimeoutToken>,
    next_timer: u64,
    signal_tx: broadcast::Sender<LinkSignal>,
    record_tx: broadcast::Sender<BurstRecord>,
    state_tx: broadcast::Sender<ConnectionEvent>,
}

impl<T: Transport> LinkStateMachine<T> {
    /// Create a state machine in `Disconnected`.
    pub fn new(transport: T, config: EngineConfig) -> Self {
        let (signal_tx, _) = broadcast::channel(config.signal_capacity);
        let (record_tx, _) = broadcast::channel(config.record_capacity);
        let (state_tx, _) = broadcast::channel(config.signal_capacity);

        Self {
            transport,
            config,
            state: LinkState::Disconnected,
            shared_state: Arc::new(RwLock::new(LinkState::Disconnected)),
            session: None,
            stale_handle: None,
            address: None,
            generation: 0,
            connect_timer: None,
            next_timer: 0,
            signal_tx,
            record_tx,
            state_tx,
        }
    }

    /// Get the current link state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Check if the UART is usable.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Address of the current or most recent peripheral.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// The current connection attempt, if a session is live.
    pub fn attempt(&self) -> Option<&ConnectionAttempt> {
        self.session.as_ref().map(|s| &s.attempt)
    }

    /// Capabilities negotiated for the current session.
    pub fn capabilities(&self) -> Option<&NegotiatedCapabilities> {
        self.session.as_ref().and_then(|s| s.capabilities.as_ref())
    }

    /// Payload unit size outbound writes are chunked to.
    pub fn unit_size(&self) -> usize {
        self.capabilities()
            .map(|c| c.unit_size)
            .unwrap_or(self.config.default_unit_size)
    }

    /// Radio writes queued or in flight.
    pub fn pending_operations(&self) -> usize {
        self.session.as_ref().map(|s| s.queue.len()).unwrap_or(0)
    }

    /// Notification bytes not yet drained.
    pub fn pending_bytes(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.reassembler.pending_bytes())
            .unwrap_or(0)
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Subscribe to consumer signals.
    pub fn subscribe_signals(&self) -> broadcast::Receiver<LinkSignal> {
        self.signal_tx.subscribe()
    }

    /// Subscribe to completed records.
    pub fn subscribe_records(&self) -> broadcast::Receiver<BurstRecord> {
        self.record_tx.subscribe()
    }

    /// Subscribe to link state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.state_tx.subscribe()
    }

    pub(crate) fn signal_sender(&self) -> broadcast::Sender<LinkSignal> {
        self.signal_tx.clone()
    }

    pub(crate) fn record_sender(&self) -> broadcast::Sender<BurstRecord> {
        self.record_tx.clone()
    }

    pub(crate) fn state_sender(&self) -> broadcast::Sender<ConnectionEvent> {
        self.state_tx.clone()
    }

    /// Shared view of the link state, updated before any signal or event
    /// for the transition goes out.
    pub fn shared_state(&self) -> Arc<RwLock<LinkState>> {
        Arc::clone(&self.shared_state)
    }

    /// Start connecting to the peripheral at `address`.
    ///
    /// Any handle left from a previous session is closed first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless `Disconnected`,
    /// [`Error::InvalidParameter`] for an empty address, or the transport's
    /// error if the connect request is refused. A refused request also
    /// raises [`LinkSignal::Disconnected`].
    pub fn connect(&mut self, address: &str) -> Result<()> {
        if self.state != LinkState::Disconnected {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        let address = address.trim();
        if address.is_empty() {
            return Err(Error::InvalidParameter {
                name: "address".to_string(),
                value: String::new(),
            });
        }

        if let Some(stale) = self.stale_handle.take() {
            debug!(
                "Closing stale handle for {} (generation {})",
                stale.address, stale.generation
            );
            if let Err(e) = self.transport.close_connection() {
                warn!("Failed to close stale handle: {}", e);
            }
        }

        self.address = Some(address.to_string());
        self.generation += 1;
        let handle = TransportHandle {
            address: address.to_string(),
            generation: self.generation,
        };

        if let Err(e) = self.transport.open_connection(address) {
            error!("Connect request to {} refused: {}", address, e);
            self.emit(LinkSignal::Disconnected);
            return Err(e);
        }

        debug!("Attempting to create a new connection to {}", address);
        self.session = Some(Session::new(ConnectionAttempt {
            address: address.to_string(),
            retries_remaining: self.config.retry_budget,
            handle,
        }));
        self.set_state(LinkState::Connecting);

        Ok(())
    }

    /// Disconnect, or cancel an attempt in progress.
    ///
    /// The state reaches `Disconnected` when the platform confirms.
    pub fn disconnect(&mut self) -> Result<()> {
        match self.state {
            LinkState::Disconnected | LinkState::Disconnecting => {
                debug!("Disconnect ignored while {}", self.state);
                return Ok(());
            }
            _ => {}
        }

        if let Some(session) = self.session.as_mut() {
            session.attempt.retries_remaining = 0;
        }

        self.set_state(LinkState::Disconnecting);
        self.request_close();
        Ok(())
    }

    /// Arm the connect timeout for the attempt in progress.
    ///
    /// Returns `None` unless `Connecting`. Arming again replaces the
    /// previous token.
    pub fn arm_connect_timeout(&mut self) -> Option<TimeoutToken> {
        if self.state != LinkState::Connecting {
            return None;
        }

        self.next_timer += 1;
        let token = TimeoutToken(self.next_timer);
        self.connect_timer = Some(token);
        trace!("Connect timeout armed ({:?})", token);
        Some(token)
    }

    /// Cancel the connect timeout, if armed.
    pub fn cancel_connect_timeout(&mut self) {
        if self.connect_timer.take().is_some() {
            trace!("Connect timeout cancelled");
        }
    }

    /// Check if a connect timeout is armed.
    pub fn connect_timeout_armed(&self) -> bool {
        self.connect_timer.is_some()
    }

    /// The connect timeout for `token` expired.
    ///
    /// Stale or cancelled tokens are ignored.
    pub fn on_connect_timeout(&mut self, token: TimeoutToken) {
        if self.connect_timer != Some(token) {
            trace!("Ignoring expired connect timeout {:?}", token);
            return;
        }
        self.connect_timer = None;

        if self.state != LinkState::Connecting {
            return;
        }

        warn!(
            "Connection attempt to {} timed out",
            self.address.as_deref().unwrap_or("?")
        );
        if let Some(session) = self.session.as_mut() {
            session.attempt.retries_remaining = 0;
        }
        self.set_state(LinkState::Disconnecting);
        self.emit(LinkSignal::ConnectTimeout);
        self.request_close();
    }

    /// Write bytes to the UART, chunked to the negotiated unit size.
    ///
    /// Returns the number of radio writes queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless discovery has completed.
    pub fn write_to_uart(&mut self, bytes: &[u8]) -> Result<usize> {
        let session = match self.session.as_mut() {
            Some(s) if self.state == LinkState::Connected && s.capabilities.is_some() => s,
            _ => {
                warn!("Write attempted while {}", self.state);
                return Err(Error::NotConnected);
            }
        };

        let Some(caps) = session.capabilities.as_ref() else {
            return Err(Error::NotConnected);
        };
        let (handle, mode) = (caps.send, caps.write_mode);
        let chunks = frame::encode(bytes, caps.unit_size)?;
        let count = chunks.len();

        for payload in chunks {
            session.queue.enqueue(
                PendingOperation::CharacteristicWrite {
                    handle,
                    payload,
                    mode,
                },
                &mut self.transport,
            );
        }

        trace!("Queued {} bytes as {} writes", bytes.len(), count);
        Ok(count)
    }

    /// Take every notification byte received since the last read.
    pub fn read_received_bytes(&mut self) -> Bytes {
        self.session
            .as_mut()
            .map(|s| s.reassembler.drain())
            .unwrap_or_default()
    }

    /// Feed one platform callback into the state machine.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state_changed(status, state)
            }
            TransportEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services)
            }
            TransportEvent::TransferUnitChanged { mtu, status } => {
                self.on_transfer_unit_changed(mtu, status)
            }
            TransportEvent::CharacteristicWritten { handle, status } => {
                trace!("Characteristic write to {} completed: {}", handle, status);
                self.on_write_complete(OperationKind::Characteristic, status)
            }
            TransportEvent::DescriptorWritten { handle, status } => {
                trace!("Descriptor write to {} completed: {}", handle, status);
                self.on_write_complete(OperationKind::Descriptor, status)
            }
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
        }
    }

    fn on_connection_state_changed(&mut self, status: GattStatus, peer: PeerState) {
        let Some(session) = self.session.as_mut() else {
            debug!("Link {:?} ({}) with no session, ignoring", peer, status);
            return;
        };

        if !status.is_success() {
            if session.attempt.retries_remaining > 0 {
                session.attempt.retries_remaining -= 1;
                warn!(
                    "Connection attempt failed ({}), trying again ({} retries left)",
                    status, session.attempt.retries_remaining
                );
                let address = session.attempt.address.clone();
                if let Err(e) = self.transport.open_connection(&address) {
                    error!("Reconnect request refused: {}", e);
                    self.finish_disconnect();
                }
            } else if peer == PeerState::Disconnected {
                info!("Unexpectedly disconnected ({})", status);
                self.finish_disconnect();
            } else {
                warn!("Link error ({}) while peer still connected", status);
            }
            return;
        }

        session.attempt.retries_remaining = 0;

        match peer {
            PeerState::Connected => match self.state {
                LinkState::Connecting => {
                    info!("Connected to {}", session.attempt.address);
                    session.reassembler.reset_buffer();
                    session.queue.clear();
                    session.capabilities = None;

                    self.set_state(LinkState::Discovering);
                    self.emit(LinkSignal::Connected);

                    if let Err(e) = self.transport.discover_services() {
                        warn!("Service discovery request refused: {}", e);
                        self.fail_discovery();
                    }
                }
                LinkState::Disconnecting => {
                    debug!("Link came up during teardown, closing again");
                    self.request_close();
                }
                other => debug!("Duplicate connected report while {}", other),
            },
            PeerState::Disconnected => {
                info!("Disconnected from {}", session.attempt.address);
                self.finish_disconnect();
            }
        }
    }

    fn on_services_discovered(&mut self, status: GattStatus, services: &[GattService]) {
        if self.state != LinkState::Discovering {
            debug!("Discovery result while {}, ignoring", self.state);
            return;
        }

        if !status.is_success() {
            warn!("Failed service discovery with status: {}", status);
            self.fail_discovery();
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };

        let result = negotiator::negotiate(
            services,
            &mut session.queue,
            &mut self.transport,
            self.config.requested_transfer_unit,
            self.config.default_unit_size,
        );

        match result {
            Ok(caps) => {
                session.capabilities = Some(caps);
                self.cancel_connect_timeout();
                self.set_state(LinkState::Connected);
                info!("Transparent UART ready");
                self.emit(LinkSignal::DiscoveryDone);
            }
            Err(e) => {
                warn!("Discovery failed: {}", e);
                self.fail_discovery();
            }
        }
    }

    fn on_transfer_unit_changed(&mut self, mtu: u16, status: GattStatus) {
        if !status.is_success() {
            warn!("Transfer unit negotiation failed: {}", status);
            return;
        }

        match self
            .session
            .as_mut()
            .and_then(|s| s.capabilities.as_mut())
        {
            Some(caps) => {
                caps.apply_mtu(mtu);
                info!(
                    "Transfer unit negotiated: MTU {}, payload {} bytes",
                    mtu, caps.unit_size
                );
            }
            None => debug!("MTU {} reported before discovery completed, ignoring", mtu),
        }
    }

    fn on_write_complete(&mut self, kind: OperationKind, status: GattStatus) {
        if !status.is_success() {
            warn!("Error writing GATT {:?} with status: {}", kind, status);
        }

        match self.session.as_mut() {
            Some(session) => {
                session
                    .queue
                    .on_operation_complete(kind, status.is_success(), &mut self.transport)
            }
            None => debug!("{:?} write completed with no session", kind),
        }
    }

    fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        if characteristic != TRANSPARENT_RECEIVE_UUID {
            debug!("Notification from unexpected characteristic {}", characteristic);
            return;
        }

        let Some(session) = self.session.as_mut() else {
            debug!("Notification with no session, dropping");
            return;
        };

        debug!("Notification received: {} bytes", value.len());
        let outcome = session.reassembler.on_notification(value);
        self.emit(LinkSignal::NewDataReceived);

        match outcome {
            Ok(Some(record)) => {
                let _ = self.record_tx.send(record);
            }
            Ok(None) => {}
            Err(e) => warn!("Payload skipped: {}", e),
        }
    }

    /// Give up on discovery and tear the link down.
    fn fail_discovery(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.attempt.retries_remaining = 0;
        }
        self.set_state(LinkState::Disconnecting);
        self.emit(LinkSignal::DiscoveryFailed);
        self.request_close();
    }

    /// Ask the platform to drop the link.
    ///
    /// If the platform refuses, no disconnect report will follow, so the
    /// session ends here.
    fn request_close(&mut self) {
        if let Err(e) = self.transport.close_connection() {
            warn!("Disconnect request refused: {}", e);
            self.finish_disconnect();
        }
    }

    /// Enter `Disconnected` and tear the session down.
    fn finish_disconnect(&mut self) {
        self.set_state(LinkState::Disconnected);
        if let Some(session) = self.session.take() {
            self.stale_handle = Some(session.attempt.handle);
        }
        self.emit(LinkSignal::Disconnected);
    }

    fn emit(&self, signal: LinkSignal) {
        trace!("Signal {:?}", signal);
        let _ = self.signal_tx.send(signal);
    }

    /// Update the link state and emit an event.
    fn set_state(&mut self, new_state: LinkState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state == new_state {
            return;
        }
        *self.shared_state.write() = new_state;

        debug!("Link state changed: {} -> {}", old_state, new_state);

        if old_state == LinkState::Connecting {
            self.cancel_connect_timeout();
        }

        let _ = self.state_tx.send(ConnectionEvent {
            address: self.address.clone().unwrap_or_default(),
            old: old_state,
            new: new_state,
        });
    }
}

impl<T: Transport> std::fmt::Debug for LinkStateMachine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkStateMachine")
            .field("state", &self.state)
            .field("address", &self.address)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
