//! Listener events and the registration-ordered broadcast set
//!
//! One event per observable occurrence. Delivery order matches registration
//! order so tests (and callers) see deterministic fan-out. Peripheral-pushed
//! value changes arrive as `CharacteristicChanged` — same union, but they are
//! unsolicited transport events, never completions of a queued operation.

use crate::error::LinkError;
use crate::gatt::{DeviceId, ServiceCatalog};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Events delivered to every registered listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkEvent {
    /// Transport connect succeeded; discovery starts automatically
    Connected { device: DeviceId },
    /// Transport connect (or service discovery) failed; the device is back to
    /// `Disconnected`
    ConnectFailed { device: DeviceId, reason: String },
    /// The device left the registry: teardown confirmed or link dropped
    Disconnected { device: DeviceId },
    /// Service discovery completed; the device is `Ready`
    ServicesDiscovered {
        device: DeviceId,
        catalog: ServiceCatalog,
    },
    /// A queued read completed with a value
    CharacteristicRead {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// A queued write was acknowledged
    CharacteristicWritten {
        device: DeviceId,
        characteristic: Uuid,
    },
    /// The CCCD enable write was confirmed by hardware
    NotificationsEnabled {
        device: DeviceId,
        characteristic: Uuid,
    },
    /// The CCCD disable write was confirmed by hardware
    NotificationsDisabled {
        device: DeviceId,
        characteristic: Uuid,
    },
    /// Unsolicited value change pushed by the peripheral (bypasses the queue)
    CharacteristicChanged {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// MTU negotiation completed
    MtuChanged { device: DeviceId, mtu: u16 },
    /// A queued operation resolved with `Cancelled` or `TransportFailure`
    OperationFailed {
        device: DeviceId,
        characteristic: Option<Uuid>,
        operation: String,
        error: LinkError,
    },
}

impl LinkEvent {
    /// The device this event concerns
    pub fn device(&self) -> &DeviceId {
        match self {
            LinkEvent::Connected { device }
            | LinkEvent::ConnectFailed { device, .. }
            | LinkEvent::Disconnected { device }
            | LinkEvent::ServicesDiscovered { device, .. }
            | LinkEvent::CharacteristicRead { device, .. }
            | LinkEvent::CharacteristicWritten { device, .. }
            | LinkEvent::NotificationsEnabled { device, .. }
            | LinkEvent::NotificationsDisabled { device, .. }
            | LinkEvent::CharacteristicChanged { device, .. }
            | LinkEvent::MtuChanged { device, .. }
            | LinkEvent::OperationFailed { device, .. } => device,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            LinkEvent::Connected { .. } => "Connected",
            LinkEvent::ConnectFailed { .. } => "ConnectFailed",
            LinkEvent::Disconnected { .. } => "Disconnected",
            LinkEvent::ServicesDiscovered { .. } => "ServicesDiscovered",
            LinkEvent::CharacteristicRead { .. } => "CharacteristicRead",
            LinkEvent::CharacteristicWritten { .. } => "CharacteristicWritten",
            LinkEvent::NotificationsEnabled { .. } => "NotificationsEnabled",
            LinkEvent::NotificationsDisabled { .. } => "NotificationsDisabled",
            LinkEvent::CharacteristicChanged { .. } => "CharacteristicChanged",
            LinkEvent::MtuChanged { .. } => "MtuChanged",
            LinkEvent::OperationFailed { .. } => "OperationFailed",
        }
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::ConnectFailed { device, reason } => {
                write!(f, "ConnectFailed {{ device: {}, reason: {} }}", device, reason)
            }
            LinkEvent::MtuChanged { device, mtu } => {
                write!(f, "MtuChanged {{ device: {}, mtu: {} }}", device, mtu)
            }
            LinkEvent::OperationFailed {
                device,
                operation,
                error,
                ..
            } => write!(
                f,
                "OperationFailed {{ device: {}, operation: {}, error: {} }}",
                device, operation, error
            ),
            other => write!(f, "{} {{ device: {} }}", other.name(), other.device()),
        }
    }
}

/// Handle identifying a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);

/// Registration-ordered set of listener channels
///
/// Owned by the manager actor; listeners that drop their receiver are pruned
/// on the next broadcast.
#[derive(Debug, Default)]
pub struct Listeners {
    entries: Vec<(ListenerId, mpsc::UnboundedSender<LinkEvent>)>,
    next_id: u64,
}

impl Listeners {
    /// Create an empty listener set
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh listener channel and register it last in delivery order
    pub fn subscribe(&mut self) -> (ListenerId, mpsc::UnboundedReceiver<LinkEvent>) {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.push((id, tx));
        debug!(listener = id.0, "listener registered");
        (id, rx)
    }

    /// Register an externally created sender under `id`
    ///
    /// Idempotent: registering an id that is already present has no effect and
    /// returns `false`.
    pub fn register(&mut self, id: ListenerId, sender: mpsc::UnboundedSender<LinkEvent>) -> bool {
        if self.entries.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        self.next_id = self.next_id.max(id.0 + 1);
        self.entries.push((id, sender));
        true
    }

    /// Remove a listener; removing an absent id is a no-op
    pub fn unregister(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        before != self.entries.len()
    }

    /// Deliver one event to every listener, in registration order
    pub fn broadcast(&mut self, event: &LinkEvent) {
        self.entries
            .retain(|(id, tx)| match tx.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    debug!(listener = id.0, "listener dropped, pruning");
                    false
                }
            });
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nobody is listening
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
