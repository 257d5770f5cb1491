//! Async client for a transparent UART peripheral.
//!
//! [`UartClient`] runs a [`LinkStateMachine`] inside one tokio task. Platform
//! events and public calls are both funneled into that task, so the state
//! machine sees them strictly one at a time.

use btleplug::api::Central;
use btleplug::platform::Adapter;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::btleplug_transport::{default_adapter, BtleplugTransport};
use crate::ble::connection::{
    ConnectionEvent, LinkSignal, LinkState, LinkStateMachine, TimeoutToken,
};
use crate::ble::negotiator::NegotiatedCapabilities;
use crate::ble::transport::{Transport, TransportEvent};
use crate::config::EngineConfig;
use crate::data::burst::BurstRecord;
use crate::error::{Error, Result};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Point-in-time view of the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// Current link state.
    pub state: LinkState,
    /// Address of the current or most recent peripheral.
    pub address: Option<String>,
    /// Negotiated capabilities, once discovery has completed.
    pub capabilities: Option<NegotiatedCapabilities>,
    /// Payload unit size in force.
    pub unit_size: usize,
    /// Radio writes queued or in flight.
    pub pending_operations: usize,
    /// Received bytes not yet read.
    pub pending_bytes: usize,
}

enum Command {
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Read {
        reply: oneshot::Sender<Bytes>,
    },
    Snapshot {
        reply: oneshot::Sender<LinkSnapshot>,
    },
    Shutdown,
}

/// Client for one transparent UART peripheral.
pub struct UartClient {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<RwLock<LinkState>>,
    signal_tx: broadcast::Sender<LinkSignal>,
    record_tx: broadcast::Sender<BurstRecord>,
    state_tx: broadcast::Sender<ConnectionEvent>,
    callback_counter: AtomicU64,
    driver: Mutex<Option<JoinHandle<()>>>,
    adapter: Option<Adapter>,
}

impl UartClient {
    /// Create a client on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let adapter = default_adapter().await?;
        Self::with_adapter(adapter, EngineConfig::default())
    }

    /// Create a client on a specific adapter.
    pub fn with_adapter(adapter: Adapter, config: EngineConfig) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = BtleplugTransport::new(adapter.clone(), event_tx)?;

        let mut client = Self::with_transport(transport, event_rx, config);
        client.adapter = Some(adapter);
        Ok(client)
    }

    /// Create a client over any transport.
    ///
    /// `events` must carry the transport's callbacks. Must be called from
    /// within a tokio runtime.
    pub fn with_transport<T>(
        transport: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        config: EngineConfig,
    ) -> Self
    where
        T: Transport + Send + 'static,
    {
        let machine = LinkStateMachine::new(transport, config);
        let signal_tx = machine.signal_sender();
        let record_tx = machine.record_sender();
        let state_tx = machine.state_sender();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let state = machine.shared_state();

        let driver = tokio::spawn(run_driver(machine, events, command_rx));

        Self {
            commands,
            state,
            signal_tx,
            record_tx,
            state_tx,
            callback_counter: AtomicU64::new(0),
            driver: Mutex::new(Some(driver)),
            adapter: None,
        }
    }

    /// Check whether a Bluetooth radio is present and answering.
    pub async fn is_bluetooth_radio_enabled(&self) -> bool {
        match &self.adapter {
            Some(adapter) => adapter.adapter_info().await.is_ok(),
            None => false,
        }
    }

    async fn request<R>(&self, build: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::Internal("link driver stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("link driver stopped".to_string()))
    }

    // === Connection ===

    /// Start connecting to the peripheral at `address`.
    ///
    /// Progress is reported through signals. The connect timeout from the
    /// configuration is armed automatically.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.request(|reply| Command::Connect { address, reply })
            .await?
    }

    /// Connect and wait until the UART is ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the connect timeout fires, or
    /// [`Error::NotConnected`] if the link goes down or discovery fails.
    pub async fn connect_and_wait(&self, address: &str) -> Result<()> {
        let mut signals = self.subscribe_signals();
        self.connect(address).await?;

        loop {
            match signals.recv().await {
                Ok(LinkSignal::DiscoveryDone) => return Ok(()),
                Ok(LinkSignal::ConnectTimeout) => return Err(Error::Timeout),
                Ok(LinkSignal::Disconnected) | Ok(LinkSignal::DiscoveryFailed) => {
                    return Err(Error::NotConnected)
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} link signals while waiting", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal("link driver stopped".to_string()))
                }
            }
        }
    }

    /// Disconnect from the peripheral.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Get the current link state.
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Check if the UART is usable.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Get a consistent view of the link.
    pub async fn snapshot(&self) -> Result<LinkSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    // === UART ===

    /// Write bytes to the UART.
    ///
    /// Returns the number of radio writes queued.
    pub async fn write_to_uart(&self, data: &[u8]) -> Result<usize> {
        let data = data.to_vec();
        self.request(|reply| Command::Write { data, reply }).await?
    }

    /// Take the bytes received since the last read.
    pub async fn read_received_bytes(&self) -> Result<Bytes> {
        self.request(|reply| Command::Read { reply }).await
    }

    // === Subscriptions ===

    /// Subscribe to link signals.
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

    /// Register a callback for link signals.
    pub fn on_signal<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(LinkSignal) + Send + Sync + 'static,
    {
        self.listen(self.signal_tx.subscribe(), move |signal| callback(signal))
    }

    /// Register a callback for completed records.
    pub fn on_record<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&BurstRecord) + Send + Sync + 'static,
    {
        self.listen(self.record_tx.subscribe(), move |record| callback(&record))
    }

    /// Register a callback for link state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.listen(self.state_tx.subscribe(), move |event| callback(&event))
    }

    fn listen<V, F>(&self, mut rx: broadcast::Receiver<V>, callback: F) -> CallbackHandle
    where
        V: Clone + Send + 'static,
        F: Fn(V) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => callback(value),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Callback {} lagged, {} items skipped", callback_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Lifecycle ===

    /// Disconnect and stop the driver task.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down UART client");

        let _ = self.commands.send(Command::Shutdown);
        let driver = self.driver.lock().take();
        if let Some(handle) = driver {
            handle
                .await
                .map_err(|e| Error::Internal(format!("link driver panicked: {e}")))?;
        }

        Ok(())
    }
}

impl Drop for UartClient {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// The single task that owns the state machine.
async fn run_driver<T: Transport>(
    mut machine: LinkStateMachine<T>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (timeout_tx, mut timeouts) = mpsc::unbounded_channel::<TimeoutToken>();
    let connect_timeout = machine.config().connect_timeout;

    debug!("Link driver started");

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown) | None => break,
                Some(command) => execute(&mut machine, command, &timeout_tx, connect_timeout),
            },
            Some(event) = events.recv() => machine.handle_event(event),
            Some(token) = timeouts.recv() => machine.on_connect_timeout(token),
        }
    }

    if machine.state() != LinkState::Disconnected {
        if let Err(e) = machine.disconnect() {
            warn!("Disconnect during shutdown failed: {}", e);
        }
    }

    debug!("Link driver stopped");
}

fn execute<T: Transport>(
    machine: &mut LinkStateMachine<T>,
    command: Command,
    timeouts: &mpsc::UnboundedSender<TimeoutToken>,
    connect_timeout: Duration,
) {
    match command {
        Command::Connect { address, reply } => {
            let result = machine.connect(&address);
            if result.is_ok() {
                if let Some(token) = machine.arm_connect_timeout() {
                    let timeouts = timeouts.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(connect_timeout).await;
                        let _ = timeouts.send(token);
                    });
                }
            }
            let _ = reply.send(result);
        }
        Command::Disconnect { reply } => {
            let _ = reply.send(machine.disconnect());
        }
        Command::Write { data, reply } => {
            let _ = reply.send(machine.write_to_uart(&data));
        }
        Command::Read { reply } => {
            let _ = reply.send(machine.read_received_bytes());
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(LinkSnapshot {
                state: machine.state(),
                address: machine.address().map(str::to_string),
                capabilities: machine.capabilities().cloned(),
                unit_size: machine.unit_size(),
                pending_operations: machine.pending_operations(),
                pending_bytes: machine.pending_bytes(),
            });
        }
        Command::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::CharacteristicHandle;
    use crate::ble::negotiator::fixtures::uart_services;
    use crate::ble::transport::testing::RecordingTransport;
    use crate::ble::transport::{GattStatus, PeerState};
    use crate::ble::uuids::*;
    use crate::protocol::frame::{encode_samples, SAMPLES_PER_CHUNK};
    use pretty_assertions::assert_eq;
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
    const WAIT: Duration = Duration::from_secs(2);

    fn client_with(config: EngineConfig) -> (UartClient, mpsc::UnboundedSender<TransportEvent>) {
        crate::init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            UartClient::with_transport(RecordingTransport::new(), rx, config),
            tx,
        )
    }

    fn client() -> (UartClient, mpsc::UnboundedSender<TransportEvent>) {
        client_with(EngineConfig::default())
    }

    async fn wait_for(rx: &mut broadcast::Receiver<LinkSignal>, wanted: LinkSignal) {
        timeout(WAIT, async {
            while let Ok(signal) = rx.recv().await {
                if signal == wanted {
                    return;
                }
            }
            panic!("signal channel closed");
        })
        .await
        .expect("signal not received");
    }

    fn bring_up(events: &mpsc::UnboundedSender<TransportEvent>) {
        events
            .send(TransportEvent::ConnectionStateChanged {
                status: GattStatus::Success,
                state: PeerState::Connected,
            })
            .unwrap();
        events
            .send(TransportEvent::ServicesDiscovered {
                status: GattStatus::Success,
                services: uart_services(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_discover_write_read() {
        let (client, events) = client();
        let mut signals = client.subscribe_signals();

        assert_ok!(client.connect(ADDRESS).await);
        assert_eq!(client.state(), LinkState::Connecting);

        bring_up(&events);
        wait_for(&mut signals, LinkSignal::DiscoveryDone).await;
        assert!(client.is_connected());

        let snapshot = client.snapshot().await.unwrap();
        assert_eq!(snapshot.unit_size, 20);
        assert_eq!(snapshot.address.as_deref(), Some(ADDRESS));

        assert_eq!(client.write_to_uart(&[7u8; 50]).await.unwrap(), 3);

        events
            .send(TransportEvent::Notification {
                characteristic: TRANSPARENT_RECEIVE_UUID,
                value: b"abc".to_vec(),
            })
            .unwrap();
        wait_for(&mut signals, LinkSignal::NewDataReceived).await;
        assert_eq!(&client.read_received_bytes().await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (client, _events) = client();
        assert_ok!(client.connect(ADDRESS).await);
        let err = assert_err!(client.connect(ADDRESS).await);
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_write_before_connect_fails() {
        let (client, _events) = client();
        assert!(matches!(
            client.write_to_uart(b"hi").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout_signal() {
        let (client, events) =
            client_with(EngineConfig::default().with_connect_timeout(Duration::from_millis(20)));
        let mut signals = client.subscribe_signals();

        assert_ok!(client.connect(ADDRESS).await);
        wait_for(&mut signals, LinkSignal::ConnectTimeout).await;
        assert_eq!(client.state(), LinkState::Disconnecting);

        events
            .send(TransportEvent::ConnectionStateChanged {
                status: GattStatus::Success,
                state: PeerState::Disconnected,
            })
            .unwrap();
        wait_for(&mut signals, LinkSignal::Disconnected).await;
        assert_eq!(client.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_wait() {
        let (client, events) = client();
        let peer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bring_up(&events);
            events
        });

        assert_ok!(timeout(WAIT, client.connect_and_wait(ADDRESS)).await.unwrap());
        assert!(client.is_connected());
        let _events = peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_and_wait_times_out() {
        let (client, _events) =
            client_with(EngineConfig::default().with_connect_timeout(Duration::from_millis(20)));

        let result = timeout(WAIT, client.connect_and_wait(ADDRESS)).await.unwrap();
        assert!(matches!(assert_err!(result), Error::Timeout));
        assert_eq!(client.state(), LinkState::Disconnecting);
    }

    #[tokio::test]
    async fn test_record_callback() {
        let (client, events) = client();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let _handle = client.on_record(move |record| {
            let _ = seen_tx.send(record.samples().to_vec());
        });

        let mut signals = client.subscribe_signals();
        client.connect(ADDRESS).await.unwrap();
        bring_up(&events);
        wait_for(&mut signals, LinkSignal::DiscoveryDone).await;

        for v in [10u16, 20, 30] {
            events
                .send(TransportEvent::Notification {
                    characteristic: TRANSPARENT_RECEIVE_UUID,
                    value: encode_samples(&[v; SAMPLES_PER_CHUNK]),
                })
                .unwrap();
        }

        let samples = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(samples.len(), 300);
        assert_eq!((samples[0], samples[150], samples[299]), (10.0, 20.0, 30.0));
    }

    #[tokio::test]
    async fn test_unregistered_callback_stops() {
        let (client, _events) = client();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handle = client.on_signal(move |signal| {
            let _ = seen_tx.send(signal);
        });
        assert_eq!(handle.id(), 0);
        handle.unregister();

        client.connect(ADDRESS).await.unwrap();
        client.disconnect().await.unwrap();
        assert!(timeout(Duration::from_millis(50), seen_rx.recv())
            .await
            .map(|v| v.is_none())
            .unwrap_or(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_state_visible_once_reply_or_signal_arrives() {
        for _ in 0..50 {
            let (client, events) = client();
            let mut signals = client.subscribe_signals();

            assert_ok!(client.connect(ADDRESS).await);
            assert_eq!(client.state(), LinkState::Connecting);

            bring_up(&events);
            wait_for(&mut signals, LinkSignal::DiscoveryDone).await;
            assert!(client.is_connected());

            assert_ok!(client.disconnect().await);
            assert_eq!(client.state(), LinkState::Disconnecting);
            events
                .send(TransportEvent::ConnectionStateChanged {
                    status: GattStatus::Success,
                    state: PeerState::Disconnected,
                })
                .unwrap();
            wait_for(&mut signals, LinkSignal::Disconnected).await;
            assert_eq!(client.state(), LinkState::Disconnected);

            client.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_state_changes_published() {
        let (client, _events) = client();
        let mut states = client.subscribe_state();
        client.connect(ADDRESS).await.unwrap();

        let event = timeout(WAIT, states.recv()).await.unwrap().unwrap();
        assert_eq!(event.new, LinkState::Connecting);
    }

    #[tokio::test]
    async fn test_shutdown_stops_driver() {
        let (client, _events) = client();
        client.shutdown().await.unwrap();
        assert!(matches!(
            client.read_received_bytes().await,
            Err(Error::Internal(_))
        ));
        assert!(!client.is_bluetooth_radio_enabled().await);
    }

    #[test]
    fn test_snapshot_is_comparable() {
        let handle = CharacteristicHandle::new(TRANSPARENT_UART_SERVICE_UUID, TRANSPARENT_SEND_UUID);
        let a = LinkSnapshot {
            state: LinkState::Connected,
            address: None,
            capabilities: Some(NegotiatedCapabilities {
                receive: handle,
                send: handle,
                write_mode: crate::ble::gatt::WriteMode::WithResponse,
                notify_enabled: true,
                unit_size: 20,
            }),
            unit_size: 20,
            pending_operations: 0,
            pending_bytes: 0,
        };
        assert_eq!(a.clone(), a);
    }
}
