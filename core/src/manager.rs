//! Connection manager — public façade plus the single-owner actor task
//!
//! All state mutation (queue admission and advancement, connection state
//! transitions, listener set changes) happens on one spawned task. Transport
//! completions are delivered back into that task as [`Completion`] messages,
//! never invoked from arbitrary callback threads, which preserves the
//! single-writer invariant without locks. Public operations validate, enqueue,
//! and return immediately; results arrive through the listener channel.

use crate::connection::{ConnectionRegistry, ConnectionState};
use crate::error::LinkError;
use crate::event::{LinkEvent, ListenerId, Listeners};
use crate::gatt::{DeviceId, ServiceCatalog, WriteMode, ATT_WRITE_HEADER_LEN};
use crate::queue::{OperationKind, OperationQueue, PendingOperation};
use crate::transport::{LinkHandle, Transport, TransportEvent};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Commands accepted by the manager task
pub enum Command {
    /// Establish a connection to a device
    Connect {
        device: DeviceId,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    /// Tear a connection down, cancelling its pending work
    Teardown {
        device: DeviceId,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    /// Enqueue a characteristic read
    Read {
        device: DeviceId,
        characteristic: Uuid,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    /// Enqueue a characteristic write
    Write {
        device: DeviceId,
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    /// Enqueue a CCCD toggle
    SetNotifications {
        device: DeviceId,
        characteristic: Uuid,
        enable: bool,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    /// Enqueue an MTU negotiation
    RequestMtu {
        device: DeviceId,
        value: u16,
        reply: mpsc::Sender<Result<(), LinkError>>,
    },
    /// Create and register a fresh listener channel
    Subscribe {
        reply: mpsc::Sender<(ListenerId, mpsc::UnboundedReceiver<LinkEvent>)>,
    },
    /// Register an externally created listener sender (idempotent per id)
    Register {
        id: ListenerId,
        sender: mpsc::UnboundedSender<LinkEvent>,
        reply: mpsc::Sender<bool>,
    },
    /// Remove a listener
    Unsubscribe {
        id: ListenerId,
        reply: mpsc::Sender<bool>,
    },
    /// Read-only view: connection state of a device
    State {
        device: DeviceId,
        reply: mpsc::Sender<ConnectionState>,
    },
    /// Read-only view: discovered catalog of a device
    Catalog {
        device: DeviceId,
        reply: mpsc::Sender<Option<ServiceCatalog>>,
    },
    /// Read-only view: negotiated MTU of a device
    NegotiatedMtu {
        device: DeviceId,
        reply: mpsc::Sender<Option<u16>>,
    },
    /// Read-only view: hardware-confirmed notification state
    IsNotifying {
        device: DeviceId,
        characteristic: Uuid,
        reply: mpsc::Sender<bool>,
    },
    /// Read-only view: pending work including the in-flight slot
    QueueDepth { reply: mpsc::Sender<usize> },
    /// Tear down every connection and stop the task
    Shutdown { reply: mpsc::Sender<()> },
}

/// Successful payload of a transport operation
enum OpOutput {
    Ack,
    Value(Vec<u8>),
    Mtu(u16),
}

/// Transport completions re-entering the manager task
enum Completion {
    Connect {
        device: DeviceId,
        result: Result<LinkHandle, LinkError>,
    },
    Discovery {
        device: DeviceId,
        result: Result<ServiceCatalog, LinkError>,
    },
    Operation {
        id: u64,
        result: Result<OpOutput, LinkError>,
    },
    Disconnect {
        device: DeviceId,
        result: Result<(), LinkError>,
    },
}

/// Operation counters since manager start
#[derive(Debug, Clone, Copy)]
pub struct LinkStats {
    /// Operations admitted to the queue
    pub ops_enqueued: u64,
    /// Operations handed to the transport
    pub ops_dispatched: u64,
    /// Operations resolved successfully
    pub ops_completed: u64,
    /// Operations resolved with a transport failure
    pub ops_failed: u64,
    /// Operations resolved as cancelled
    pub ops_cancelled: u64,
    /// Events broadcast to listeners
    pub events_broadcast: u64,
    started_at: Instant,
}

impl LinkStats {
    fn new() -> Self {
        Self {
            ops_enqueued: 0,
            ops_dispatched: 0,
            ops_completed: 0,
            ops_failed: 0,
            ops_cancelled: 0,
            events_broadcast: 0,
            started_at: Instant::now(),
        }
    }

    /// Time since the manager task was started
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Handle to the running manager task
///
/// Cheap to clone; every clone talks to the same task. Dropping the last
/// clone stops the task.
#[derive(Clone)]
pub struct LinkManager {
    command_tx: mpsc::Sender<Command>,
    stats: Arc<RwLock<LinkStats>>,
}

impl LinkManager {
    /// Spawn the manager task over a transport
    ///
    /// `transport_events` carries the transport's unsolicited events (link
    /// drops, peripheral-pushed value changes) into the task.
    pub fn start(
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (completion_tx, completion_rx) = mpsc::channel(256);
        let stats = Arc::new(RwLock::new(LinkStats::new()));

        let task = ManagerTask {
            transport,
            registry: ConnectionRegistry::new(),
            queue: OperationQueue::new(),
            listeners: Listeners::new(),
            completion_tx,
            stats: Arc::clone(&stats),
        };
        tokio::spawn(task.run(command_rx, completion_rx, transport_events));

        Self { command_tx, stats }
    }

    /// Connect to a device; fails with `AlreadyConnected` unless the device
    /// is `Disconnected`
    pub async fn connect(&self, device: DeviceId) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Connect {
                device,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)?
    }

    /// Tear a connection down; idempotent when already `Disconnected`
    pub async fn teardown_connection(&self, device: DeviceId) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Teardown {
                device,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)?
    }

    /// Enqueue a characteristic read; the value arrives as
    /// [`LinkEvent::CharacteristicRead`]
    pub async fn read_characteristic(
        &self,
        device: DeviceId,
        characteristic: Uuid,
    ) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Read {
                device,
                characteristic,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)?
    }

    /// Enqueue a characteristic write; the ack arrives as
    /// [`LinkEvent::CharacteristicWritten`]
    pub async fn write_characteristic(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Write {
                device,
                characteristic,
                payload,
                mode,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)?
    }

    /// Enqueue a CCCD write enabling notifications
    pub async fn enable_notifications(
        &self,
        device: DeviceId,
        characteristic: Uuid,
    ) -> Result<(), LinkError> {
        self.set_notifications(device, characteristic, true).await
    }

    /// Enqueue a CCCD write disabling notifications
    pub async fn disable_notifications(
        &self,
        device: DeviceId,
        characteristic: Uuid,
    ) -> Result<(), LinkError> {
        self.set_notifications(device, characteristic, false).await
    }

    async fn set_notifications(
        &self,
        device: DeviceId,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::SetNotifications {
                device,
                characteristic,
                enable,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)?
    }

    /// Enqueue an MTU negotiation; the agreed value arrives as
    /// [`LinkEvent::MtuChanged`]
    pub async fn request_mtu(&self, device: DeviceId, value: u16) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::RequestMtu {
                device,
                value,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)?
    }

    /// Register a fresh listener; events stream on the returned receiver
    pub async fn subscribe(
        &self,
    ) -> Result<(ListenerId, mpsc::UnboundedReceiver<LinkEvent>), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Subscribe { reply: reply_tx })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Register an externally created listener sender under `id`
    ///
    /// Idempotent: returns `false` without side effects when `id` is already
    /// registered.
    pub async fn register_listener(
        &self,
        id: ListenerId,
        sender: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<bool, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Register {
                id,
                sender,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Remove a listener; returns `false` when the id was not registered
    pub async fn unregister_listener(&self, id: ListenerId) -> Result<bool, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Unsubscribe { id, reply: reply_tx })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Current connection state; `Disconnected` for unknown devices
    pub async fn connection_state(&self, device: DeviceId) -> Result<ConnectionState, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::State {
                device,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Read-only copy of the discovered catalog, once `Ready`
    pub async fn service_catalog(
        &self,
        device: DeviceId,
    ) -> Result<Option<ServiceCatalog>, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Catalog {
                device,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Negotiated MTU of a live connection
    pub async fn negotiated_mtu(&self, device: DeviceId) -> Result<Option<u16>, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::NegotiatedMtu {
                device,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Whether notifications are hardware-confirmed enabled
    pub async fn is_notifying(
        &self,
        device: DeviceId,
        characteristic: Uuid,
    ) -> Result<bool, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::IsNotifying {
                device,
                characteristic,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Pending work: backlog plus the in-flight slot
    pub async fn queue_depth(&self) -> Result<usize, LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::QueueDepth { reply: reply_tx })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> LinkStats {
        *self.stats.read()
    }

    /// Tear down every connection and stop the manager task
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(Command::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        reply_rx.recv().await.ok_or(LinkError::ManagerStopped)
    }
}

/// State owned exclusively by the manager task
struct ManagerTask {
    transport: Arc<dyn Transport>,
    registry: ConnectionRegistry,
    queue: OperationQueue,
    listeners: Listeners,
    completion_tx: mpsc::Sender<Completion>,
    stats: Arc<RwLock<LinkStats>>,
}

impl ManagerTask {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut completion_rx: mpsc::Receiver<Completion>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        info!("link manager task started");
        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // All handles dropped
                    None => break,
                },
                Some(done) = completion_rx.recv() => self.handle_completion(done),
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
            }
        }
        info!("link manager task stopped");
    }

    /// Returns true when the task should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { device, reply } => {
                let result = self.connect(device);
                let _ = reply.send(result).await;
            }
            Command::Teardown { device, reply } => {
                self.teardown(&device);
                let _ = reply.send(Ok(())).await;
            }
            Command::Read {
                device,
                characteristic,
                reply,
            } => {
                let result = self
                    .validate_read(&device, &characteristic)
                    .map(|_| self.admit(device, OperationKind::Read { characteristic }));
                let _ = reply.send(result).await;
            }
            Command::Write {
                device,
                characteristic,
                payload,
                mode,
                reply,
            } => {
                let result = self
                    .validate_write(&device, &characteristic, payload.len(), mode)
                    .map(|_| {
                        self.admit(
                            device,
                            OperationKind::Write {
                                characteristic,
                                payload,
                                mode,
                            },
                        )
                    });
                let _ = reply.send(result).await;
            }
            Command::SetNotifications {
                device,
                characteristic,
                enable,
                reply,
            } => {
                let result = self.validate_toggle(&device, &characteristic, enable).map(|_| {
                    if let Some(entry) = self.registry.get_mut(&device) {
                        entry.mark_cccd_pending(characteristic);
                    }
                    self.admit(
                        device,
                        OperationKind::SetNotifications {
                            characteristic,
                            enable,
                        },
                    )
                });
                let _ = reply.send(result).await;
            }
            Command::RequestMtu {
                device,
                value,
                reply,
            } => {
                let result = self
                    .validate_mtu(&device, value)
                    .map(|_| self.admit(device, OperationKind::RequestMtu { value }));
                let _ = reply.send(result).await;
            }
            Command::Subscribe { reply } => {
                let _ = reply.send(self.listeners.subscribe()).await;
            }
            Command::Register { id, sender, reply } => {
                let _ = reply.send(self.listeners.register(id, sender)).await;
            }
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.listeners.unregister(id)).await;
            }
            Command::State { device, reply } => {
                let _ = reply.send(self.registry.state_of(&device)).await;
            }
            Command::Catalog { device, reply } => {
                let catalog = self
                    .registry
                    .get(&device)
                    .and_then(|e| e.catalog())
                    .map(|c| (**c).clone());
                let _ = reply.send(catalog).await;
            }
            Command::NegotiatedMtu { device, reply } => {
                let mtu = self.registry.get(&device).map(|e| e.mtu());
                let _ = reply.send(mtu).await;
            }
            Command::IsNotifying {
                device,
                characteristic,
                reply,
            } => {
                let notifying = self
                    .registry
                    .get(&device)
                    .map(|e| e.is_notifying(&characteristic))
                    .unwrap_or(false);
                let _ = reply.send(notifying).await;
            }
            Command::QueueDepth { reply } => {
                let _ = reply.send(self.queue.depth()).await;
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(()).await;
                return true;
            }
        }
        false
    }

    fn connect(&mut self, device: DeviceId) -> Result<(), LinkError> {
        if !self.registry.insert_connecting(device.clone()) {
            return Err(LinkError::AlreadyConnected);
        }
        info!(device = %device, "connecting");

        let transport = Arc::clone(&self.transport);
        let tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = transport.connect(&device).await;
            let _ = tx.send(Completion::Connect { device, result }).await;
        });
        Ok(())
    }

    fn teardown(&mut self, device: &DeviceId) {
        match self.registry.state_of(device) {
            // Idempotent no-op / already in progress
            ConnectionState::Disconnected | ConnectionState::Disconnecting => return,
            _ => {}
        }
        info!(device = %device, "teardown requested");

        for op in self.queue.cancel_device(device) {
            self.resolve_failed(&op, LinkError::Cancelled);
        }

        let link = match self.registry.get_mut(device) {
            Some(entry) => {
                entry.begin_disconnect();
                entry.link()
            }
            None => return,
        };

        match link {
            Some(link) => {
                let transport = Arc::clone(&self.transport);
                let tx = self.completion_tx.clone();
                let device = device.clone();
                tokio::spawn(async move {
                    let result = transport.disconnect(link).await;
                    let _ = tx.send(Completion::Disconnect { device, result }).await;
                });
            }
            None => {
                // Still connecting, no link to release; the eventual connect
                // completion finds no entry and is discarded.
                self.registry.remove(device);
                self.emit(LinkEvent::Disconnected {
                    device: device.clone(),
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down, tearing all connections down");
        for op in self.queue.cancel_all() {
            self.resolve_failed(&op, LinkError::Cancelled);
        }
        for device in self.registry.devices() {
            if let Some(entry) = self.registry.remove(&device) {
                if let Some(link) = entry.link() {
                    if let Err(e) = self.transport.disconnect(link).await {
                        warn!(device = %device, error = %e, "disconnect failed during shutdown");
                    }
                }
                self.emit(LinkEvent::Disconnected { device });
            }
        }
    }

    // ------------------------------------------------------------------
    // Validation — synchronous, never touches the queue on failure
    // ------------------------------------------------------------------

    fn validate_ready(&self, device: &DeviceId) -> Result<(), LinkError> {
        match self.registry.get(device) {
            None => Err(LinkError::UnknownDevice(device.to_string())),
            Some(entry) if entry.state() != ConnectionState::Ready => Err(LinkError::NotReady),
            Some(_) => Ok(()),
        }
    }

    fn validate_read(&self, device: &DeviceId, characteristic: &Uuid) -> Result<(), LinkError> {
        self.validate_ready(device)?;
        let props = self.lookup_props(device, characteristic)?;
        if !props.read {
            return Err(LinkError::NotSupported);
        }
        Ok(())
    }

    fn validate_write(
        &self,
        device: &DeviceId,
        characteristic: &Uuid,
        payload_len: usize,
        mode: WriteMode,
    ) -> Result<(), LinkError> {
        self.validate_ready(device)?;
        let props = self.lookup_props(device, characteristic)?;
        if !props.supports_write(mode) {
            return Err(LinkError::NotSupported);
        }
        let mtu = self
            .registry
            .get(device)
            .map(|e| e.mtu())
            .unwrap_or_default();
        let max = usize::from(mtu).saturating_sub(ATT_WRITE_HEADER_LEN);
        if payload_len > max {
            return Err(LinkError::PayloadTooLarge {
                len: payload_len,
                max,
            });
        }
        Ok(())
    }

    fn validate_toggle(
        &self,
        device: &DeviceId,
        characteristic: &Uuid,
        enable: bool,
    ) -> Result<(), LinkError> {
        self.validate_ready(device)?;
        let props = self.lookup_props(device, characteristic)?;
        if !props.supports_subscription() {
            return Err(LinkError::NotSupported);
        }
        if let Some(entry) = self.registry.get(device) {
            // Reject while a toggle is queued or in flight, and reject
            // toggles that would not change the confirmed state.
            if entry.cccd_pending(characteristic) || entry.is_notifying(characteristic) == enable {
                return Err(LinkError::NotReady);
            }
        }
        Ok(())
    }

    fn validate_mtu(&self, device: &DeviceId, value: u16) -> Result<(), LinkError> {
        self.validate_ready(device)?;
        let (min, max) = self.transport.mtu_bounds();
        if value < min || value > max {
            return Err(LinkError::InvalidRange { value, min, max });
        }
        Ok(())
    }

    fn lookup_props(
        &self,
        device: &DeviceId,
        characteristic: &Uuid,
    ) -> Result<crate::gatt::CharacteristicProps, LinkError> {
        self.registry
            .get(device)
            .and_then(|e| e.catalog())
            .and_then(|c| c.characteristic(characteristic))
            .map(|c| c.props)
            .ok_or(LinkError::NotSupported)
    }

    // ------------------------------------------------------------------
    // Queue admission and dispatch
    // ------------------------------------------------------------------

    fn admit(&mut self, device: DeviceId, kind: OperationKind) {
        let id = self.queue.push(device.clone(), kind);
        self.stats.write().ops_enqueued += 1;
        debug!(device = %device, id, "operation enqueued, depth {}", self.queue.depth());
        self.pump();
    }

    /// Hand the backlog head to the transport if the in-flight slot is free
    fn pump(&mut self) {
        loop {
            let Some(op) = self.queue.dispatch_next() else {
                return;
            };
            // The device can vanish between enqueue and dispatch only through
            // paths that already cancelled its backlog, but guard anyway.
            let Some(link) = self.registry.get(&op.device).and_then(|e| e.link()) else {
                self.queue.complete(op.id);
                self.resolve_failed(&op, LinkError::Cancelled);
                continue;
            };

            self.stats.write().ops_dispatched += 1;
            debug!(device = %op.device, id = op.id, op = %op.kind, "dispatching");

            let transport = Arc::clone(&self.transport);
            let tx = self.completion_tx.clone();
            let id = op.id;
            let kind = op.kind;
            tokio::spawn(async move {
                let result = match kind {
                    OperationKind::Read { characteristic } => transport
                        .read_characteristic(link, characteristic)
                        .await
                        .map(OpOutput::Value),
                    OperationKind::Write {
                        characteristic,
                        payload,
                        mode,
                    } => transport
                        .write_characteristic(link, characteristic, payload, mode)
                        .await
                        .map(|_| OpOutput::Ack),
                    OperationKind::SetNotifications {
                        characteristic,
                        enable,
                    } => transport
                        .set_notification_state(link, characteristic, enable)
                        .await
                        .map(|_| OpOutput::Ack),
                    OperationKind::RequestMtu { value } => {
                        transport.request_mtu(link, value).await.map(OpOutput::Mtu)
                    }
                };
                let _ = tx.send(Completion::Operation { id, result }).await;
            });
            return;
        }
    }

    // ------------------------------------------------------------------
    // Completion handling — the only place state advances
    // ------------------------------------------------------------------

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connect { device, result } => self.on_connect_complete(device, result),
            Completion::Discovery { device, result } => self.on_discovery_complete(device, result),
            Completion::Operation { id, result } => self.on_operation_complete(id, result),
            Completion::Disconnect { device, result } => {
                if let Err(e) = result {
                    warn!(device = %device, error = %e, "transport disconnect reported failure");
                }
                if self.registry.remove(&device).is_some() {
                    self.emit(LinkEvent::Disconnected { device });
                }
            }
        }
    }

    fn on_connect_complete(&mut self, device: DeviceId, result: Result<LinkHandle, LinkError>) {
        if self.registry.state_of(&device) != ConnectionState::Connecting {
            // Torn down while the connect was outstanding; release a link the
            // transport may have handed us.
            debug!(device = %device, "discarding connect completion for inactive device");
            if let Ok(link) = result {
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    let _ = transport.disconnect(link).await;
                });
            }
            return;
        }

        match result {
            Ok(link) => {
                info!(device = %device, %link, "connected, discovering services");
                if let Some(entry) = self.registry.get_mut(&device) {
                    entry.link_established(link);
                }
                self.emit(LinkEvent::Connected {
                    device: device.clone(),
                });

                let transport = Arc::clone(&self.transport);
                let tx = self.completion_tx.clone();
                tokio::spawn(async move {
                    let result = transport.discover_services(link).await;
                    let _ = tx.send(Completion::Discovery { device, result }).await;
                });
            }
            Err(e) => {
                warn!(device = %device, error = %e, "connect failed");
                self.registry.remove(&device);
                self.emit(LinkEvent::ConnectFailed {
                    device,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_discovery_complete(
        &mut self,
        device: DeviceId,
        result: Result<ServiceCatalog, LinkError>,
    ) {
        if self.registry.state_of(&device) != ConnectionState::DiscoveringServices {
            debug!(device = %device, "discarding discovery completion for inactive device");
            return;
        }

        match result {
            Ok(catalog) => {
                info!(
                    device = %device,
                    services = catalog.services().len(),
                    "service discovery complete"
                );
                if let Some(entry) = self.registry.get_mut(&device) {
                    entry.discovery_complete(catalog.clone());
                }
                self.emit(LinkEvent::ServicesDiscovered { device, catalog });
            }
            Err(e) => {
                // The connection never became usable; tear the link down and
                // report it as a connect failure.
                warn!(device = %device, error = %e, "service discovery failed");
                let link = self.registry.get_mut(&device).and_then(|entry| {
                    entry.begin_disconnect();
                    entry.link()
                });
                if let Some(link) = link {
                    let transport = Arc::clone(&self.transport);
                    let tx = self.completion_tx.clone();
                    let dev = device.clone();
                    tokio::spawn(async move {
                        let result = transport.disconnect(link).await;
                        let _ = tx.send(Completion::Disconnect { device: dev, result }).await;
                    });
                } else {
                    self.registry.remove(&device);
                }
                self.emit(LinkEvent::ConnectFailed {
                    device,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_operation_complete(&mut self, id: u64, result: Result<OpOutput, LinkError>) {
        let Some(in_flight) = self.queue.complete(id) else {
            warn!(id, "completion for unknown operation, ignoring");
            return;
        };
        let op = in_flight.op;

        if in_flight.cancelled {
            // Device torn down after dispatch; the late result is discarded.
            self.resolve_failed(&op, LinkError::Cancelled);
        } else {
            match result {
                Ok(output) => self.resolve_success(&op, output),
                Err(e) => self.resolve_failed(&op, e),
            }
        }

        // Always advance, success or failure: a failed operation must never
        // wedge the queue.
        self.pump();
    }

    fn resolve_success(&mut self, op: &PendingOperation, output: OpOutput) {
        self.stats.write().ops_completed += 1;
        let device = op.device.clone();

        match (&op.kind, output) {
            (OperationKind::Read { characteristic }, OpOutput::Value(value)) => {
                self.emit(LinkEvent::CharacteristicRead {
                    device,
                    characteristic: *characteristic,
                    value,
                });
            }
            (OperationKind::Write { characteristic, .. }, _) => {
                self.emit(LinkEvent::CharacteristicWritten {
                    device,
                    characteristic: *characteristic,
                });
            }
            (
                OperationKind::SetNotifications {
                    characteristic,
                    enable,
                },
                _,
            ) => {
                if let Some(entry) = self.registry.get_mut(&device) {
                    entry.cccd_confirmed(*characteristic, *enable);
                }
                let event = if *enable {
                    LinkEvent::NotificationsEnabled {
                        device,
                        characteristic: *characteristic,
                    }
                } else {
                    LinkEvent::NotificationsDisabled {
                        device,
                        characteristic: *characteristic,
                    }
                };
                self.emit(event);
            }
            (OperationKind::RequestMtu { .. }, OpOutput::Mtu(mtu)) => {
                if let Some(entry) = self.registry.get_mut(&device) {
                    entry.set_mtu(mtu);
                }
                self.emit(LinkEvent::MtuChanged { device, mtu });
            }
            (kind, _) => {
                warn!(device = %device, op = %kind, "transport returned mismatched output");
            }
        }
    }

    fn resolve_failed(&mut self, op: &PendingOperation, error: LinkError) {
        {
            let mut stats = self.stats.write();
            if error == LinkError::Cancelled {
                stats.ops_cancelled += 1;
            } else {
                stats.ops_failed += 1;
            }
        }

        // A failed or cancelled toggle leaves the confirmed state untouched
        if let OperationKind::SetNotifications { characteristic, .. } = &op.kind {
            if let Some(entry) = self.registry.get_mut(&op.device) {
                entry.cccd_aborted(characteristic);
            }
        }

        self.emit(LinkEvent::OperationFailed {
            device: op.device.clone(),
            characteristic: op.kind.characteristic(),
            operation: op.kind.label().to_string(),
            error,
        });
    }

    // ------------------------------------------------------------------
    // Unsolicited transport events — never pass through the queue
    // ------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LinkDropped { device } => {
                if self.registry.remove(&device).is_none() {
                    debug!(device = %device, "link drop for unknown device, ignoring");
                    return;
                }
                warn!(device = %device, "link dropped");
                for op in self.queue.cancel_device(&device) {
                    self.resolve_failed(&op, LinkError::Cancelled);
                }
                self.emit(LinkEvent::Disconnected { device });
            }
            TransportEvent::CharacteristicChanged {
                device,
                characteristic,
                value,
            } => {
                if self.registry.get(&device).is_none() {
                    debug!(device = %device, "notification from unknown device, ignoring");
                    return;
                }
                self.emit(LinkEvent::CharacteristicChanged {
                    device,
                    characteristic,
                    value,
                });
            }
        }
    }

    fn emit(&mut self, event: LinkEvent) {
        debug!(%event, "broadcasting");
        self.stats.write().events_broadcast += 1;
        self.listeners.broadcast(&event);
    }
}
