//! GATT data model: device identity, characteristic capabilities, and the
//! service catalog discovered per connection.
//!
//! The catalog is populated once per connection, immutably, when the transport
//! reports discovery complete, and is dropped with its owning connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default ATT MTU every link starts with before negotiation
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest MTU the ATT protocol allows
pub const MAX_ATT_MTU: u16 = 517;

/// ATT write request header (opcode + attribute handle)
pub const ATT_WRITE_HEADER_LEN: usize = 3;

/// Client Characteristic Configuration descriptor (0x2902)
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// Stable identifier for a remote BLE peripheral (e.g. its hardware address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier from its transport address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The underlying address string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// Write mode for characteristic writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    /// Write request — peripheral acknowledges at the ATT layer
    WithResponse,
    /// Write command — no acknowledgement
    WithoutResponse,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::WithResponse => write!(f, "WithResponse"),
            WriteMode::WithoutResponse => write!(f, "WithoutResponse"),
        }
    }
}

/// Capability set of a characteristic, as advertised by the peripheral
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProps {
    /// Value can be read
    pub read: bool,
    /// Accepts write requests (with response)
    pub write: bool,
    /// Accepts write commands (without response)
    pub write_without_response: bool,
    /// Pushes unacknowledged value-change notifications
    pub notify: bool,
    /// Pushes acknowledged value-change indications
    pub indicate: bool,
}

impl CharacteristicProps {
    /// Whether a write in the given mode is allowed
    pub fn supports_write(&self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.write,
            WriteMode::WithoutResponse => self.write_without_response,
        }
    }

    /// Whether the client can subscribe to value changes at all
    pub fn supports_subscription(&self) -> bool {
        self.notify || self.indicate
    }
}

/// A discovered characteristic with its capability set and descriptor list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Characteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Advertised capability set
    pub props: CharacteristicProps,
    /// Descriptor UUIDs (the CCCD among them for subscribable characteristics)
    pub descriptors: Vec<Uuid>,
}

/// A discovered service with its characteristics in discovery order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics in discovery order
    pub characteristics: Vec<Characteristic>,
}

/// Ordered catalog of services discovered on one connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceCatalog {
    services: Vec<Service>,
}

impl ServiceCatalog {
    /// Build a catalog from discovered services, preserving order
    pub fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    /// Discovered services in discovery order
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Find a characteristic by UUID across all services
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *uuid)
    }

    /// Total number of characteristics across all services
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// True when discovery returned no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
