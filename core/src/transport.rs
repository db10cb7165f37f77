//! Transport boundary — the asynchronous hardware driver the manager consumes
//!
//! Every method eventually completes out-of-band from the radio's perspective;
//! the manager turns each completion into a message delivered back into its
//! own actor task. Unsolicited occurrences (link drop, peripheral-pushed value
//! changes) arrive on a separate [`TransportEvent`] channel and never pass
//! through the operation queue.

use crate::error::LinkError;
use crate::gatt::{DeviceId, ServiceCatalog, WriteMode, DEFAULT_ATT_MTU, MAX_ATT_MTU};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque handle to a live physical link, issued by the transport on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkHandle(pub u64);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Asynchronous BLE transport primitives
///
/// Implementations wrap a platform radio stack. Failures are reported as
/// [`LinkError::TransportFailure`] with an opaque detail string; the manager
/// never interprets the detail, only forwards it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a physical link to the peripheral
    async fn connect(&self, device: &DeviceId) -> Result<LinkHandle, LinkError>;

    /// Enumerate services and characteristics on an established link
    async fn discover_services(&self, link: LinkHandle) -> Result<ServiceCatalog, LinkError>;

    /// Read a characteristic value
    async fn read_characteristic(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, LinkError>;

    /// Write a characteristic value
    async fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), LinkError>;

    /// Toggle the client characteristic configuration for notifications
    async fn set_notification_state(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), LinkError>;

    /// Negotiate the link MTU; returns the value the peripheral agreed to
    async fn request_mtu(&self, link: LinkHandle, value: u16) -> Result<u16, LinkError>;

    /// Tear the physical link down
    async fn disconnect(&self, link: LinkHandle) -> Result<(), LinkError>;

    /// Legal MTU request bounds advertised by this transport
    fn mtu_bounds(&self) -> (u16, u16) {
        (DEFAULT_ATT_MTU, MAX_ATT_MTU)
    }
}

/// Unsolicited occurrences pushed by the transport outside the
/// request/response cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportEvent {
    /// The physical link dropped without a manager-initiated disconnect
    LinkDropped { device: DeviceId },
    /// The peripheral pushed a value change for a subscribed characteristic
    CharacteristicChanged {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LinkDropped { device } => {
                write!(f, "LinkDropped {{ device: {} }}", device)
            }
            TransportEvent::CharacteristicChanged {
                device,
                characteristic,
                value,
            } => write!(
                f,
                "CharacteristicChanged {{ device: {}, characteristic: {}, value_len: {} }}",
                device,
                characteristic,
                value.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_handle_display() {
        assert_eq!(LinkHandle(7).to_string(), "link#7");
    }

    #[test]
    fn test_transport_event_display() {
        let event = TransportEvent::CharacteristicChanged {
            device: DeviceId::from("AA:BB"),
            characteristic: Uuid::from_u128(0x2A37),
            value: vec![0x16, 0x50],
        };
        let display = event.to_string();
        assert!(display.contains("CharacteristicChanged"));
        assert!(display.contains("AA:BB"));
        assert!(display.contains("value_len: 2"));

        let drop = TransportEvent::LinkDropped {
            device: DeviceId::from("AA:BB"),
        };
        assert!(drop.to_string().contains("LinkDropped"));
    }
}
