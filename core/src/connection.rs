//! Per-device connection state and the registry that owns it
//!
//! Exactly one state per device at any time. Transitions are driven only by
//! transport completion events or explicit teardown requests; no external
//! component holds a mutable reference to an entry — all access goes through
//! the manager actor.

use crate::gatt::{DeviceId, ServiceCatalog, DEFAULT_ATT_MTU};
use crate::transport::LinkHandle;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle state of one remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No registry entry (or teardown completed)
    Disconnected,
    /// Transport connect issued, completion pending
    Connecting,
    /// Link up, service discovery in progress
    DiscoveringServices,
    /// Link up, catalog populated — GATT operations accepted
    Ready,
    /// Teardown requested, transport disconnect pending
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::DiscoveringServices => "DiscoveringServices",
            ConnectionState::Ready => "Ready",
            ConnectionState::Disconnecting => "Disconnecting",
        };
        write!(f, "{}", name)
    }
}

/// Everything the manager tracks for one live (or establishing) connection
#[derive(Debug)]
pub struct ConnectionEntry {
    state: ConnectionState,
    link: Option<LinkHandle>,
    catalog: Option<Arc<ServiceCatalog>>,
    mtu: u16,
    /// Characteristics with hardware-confirmed notifications enabled
    notifying: HashSet<Uuid>,
    /// Characteristics with a CCCD toggle queued or in flight
    cccd_pending: HashSet<Uuid>,
}

impl ConnectionEntry {
    fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            link: None,
            catalog: None,
            mtu: DEFAULT_ATT_MTU,
            notifying: HashSet::new(),
            cccd_pending: HashSet::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The live link handle, once the transport issued one
    pub fn link(&self) -> Option<LinkHandle> {
        self.link
    }

    /// The immutable catalog, once discovery completed
    pub fn catalog(&self) -> Option<&Arc<ServiceCatalog>> {
        self.catalog.as_ref()
    }

    /// Negotiated MTU (starts at the ATT default)
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Whether notifications are hardware-confirmed enabled
    pub fn is_notifying(&self, characteristic: &Uuid) -> bool {
        self.notifying.contains(characteristic)
    }

    /// Whether a CCCD toggle for this characteristic is queued or in flight
    pub fn cccd_pending(&self, characteristic: &Uuid) -> bool {
        self.cccd_pending.contains(characteristic)
    }

    /// Transport connect succeeded: link established, discovery begins
    pub fn link_established(&mut self, link: LinkHandle) {
        self.link = Some(link);
        self.state = ConnectionState::DiscoveringServices;
    }

    /// Discovery completed: catalog populated, operations accepted
    pub fn discovery_complete(&mut self, catalog: ServiceCatalog) {
        self.catalog = Some(Arc::new(catalog));
        self.state = ConnectionState::Ready;
    }

    /// Teardown requested: stop accepting work, wait for transport confirm
    pub fn begin_disconnect(&mut self) {
        self.state = ConnectionState::Disconnecting;
        self.cccd_pending.clear();
    }

    /// Record the start of a CCCD toggle for a characteristic
    pub fn mark_cccd_pending(&mut self, characteristic: Uuid) {
        self.cccd_pending.insert(characteristic);
    }

    /// CCCD write confirmed by hardware: update the notifying set
    pub fn cccd_confirmed(&mut self, characteristic: Uuid, enabled: bool) {
        self.cccd_pending.remove(&characteristic);
        if enabled {
            self.notifying.insert(characteristic);
        } else {
            self.notifying.remove(&characteristic);
        }
    }

    /// CCCD write failed or was cancelled: clear the pending mark only
    pub fn cccd_aborted(&mut self, characteristic: &Uuid) {
        self.cccd_pending.remove(characteristic);
    }

    /// Record the MTU the peripheral agreed to
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu;
    }
}

/// Owned map from device id to connection entry
///
/// An entry exists exactly while the device is in a non-`Disconnected` state;
/// absence *is* the `Disconnected` state.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<DeviceId, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry in `Connecting` state
    ///
    /// Returns `false` when the device already has an entry (any state other
    /// than `Disconnected`).
    pub fn insert_connecting(&mut self, device: DeviceId) -> bool {
        if self.entries.contains_key(&device) {
            return false;
        }
        debug!(device = %device, "registry: Disconnected -> Connecting");
        self.entries.insert(device, ConnectionEntry::new());
        true
    }

    /// State lookup; absent entries are `Disconnected`
    pub fn state_of(&self, device: &DeviceId) -> ConnectionState {
        self.entries
            .get(device)
            .map(|e| e.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Immutable entry access
    pub fn get(&self, device: &DeviceId) -> Option<&ConnectionEntry> {
        self.entries.get(device)
    }

    /// Mutable entry access (manager actor only)
    pub fn get_mut(&mut self, device: &DeviceId) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(device)
    }

    /// Remove an entry (terminal disconnect); the catalog dies with it
    pub fn remove(&mut self, device: &DeviceId) -> Option<ConnectionEntry> {
        let entry = self.entries.remove(device);
        if entry.is_some() {
            debug!(device = %device, "registry: entry removed");
        }
        entry
    }

    /// Devices currently tracked, in no particular order
    pub fn devices(&self) -> Vec<DeviceId> {
        self.entries.keys().cloned().collect()
    }

    /// Number of tracked devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no device is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
