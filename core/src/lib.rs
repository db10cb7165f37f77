// GattLink Core — BLE GATT connection management
//
// One outstanding GATT operation per adapter, ever. Everything else in this
// crate exists to uphold that rule without making callers think about it.

pub mod connection;
pub mod error;
pub mod event;
pub mod gatt;
pub mod manager;
pub mod queue;
pub mod transport;

pub use connection::ConnectionState;
pub use error::LinkError;
pub use event::{LinkEvent, ListenerId};
pub use gatt::{
    Characteristic, CharacteristicProps, DeviceId, Service, ServiceCatalog, WriteMode,
    ATT_WRITE_HEADER_LEN, CCCD_UUID, DEFAULT_ATT_MTU, MAX_ATT_MTU,
};
pub use manager::{LinkManager, LinkStats};
pub use transport::{LinkHandle, Transport, TransportEvent};
