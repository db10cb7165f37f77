//! Error taxonomy for the GattLink connection core
//!
//! Validation errors are returned synchronously from the public operations and
//! never enter the operation queue. Runtime errors (`Cancelled`,
//! `TransportFailure`) travel the listener path as operation outcomes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the connection manager and transport boundary
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LinkError {
    /// `connect` was called for a device that is not `Disconnected`
    #[error("device already connected or connecting")]
    AlreadyConnected,

    /// Operation requires the `Ready` state (or collides with an in-flight
    /// notification toggle for the same characteristic)
    #[error("connection not ready")]
    NotReady,

    /// The characteristic's capability set does not allow the operation
    #[error("operation not supported by characteristic")]
    NotSupported,

    /// Write payload exceeds the negotiated MTU minus ATT overhead
    #[error("payload of {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Requested MTU falls outside the transport-advertised bounds
    #[error("mtu {value} outside advertised bounds {min}..={max}")]
    InvalidRange { value: u16, min: u16, max: u16 },

    /// Operation discarded due to teardown or link loss
    #[error("operation cancelled")]
    Cancelled,

    /// Opaque failure surfaced from the transport boundary
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Operation addressed a device with no registry entry
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The manager actor task is no longer running
    #[error("manager task not running")]
    ManagerStopped,
}

impl LinkError {
    /// True for errors that are detected before an operation is enqueued
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LinkError::AlreadyConnected
                | LinkError::NotReady
                | LinkError::NotSupported
                | LinkError::PayloadTooLarge { .. }
                | LinkError::InvalidRange { .. }
                | LinkError::UnknownDevice(_)
        )
    }
}
