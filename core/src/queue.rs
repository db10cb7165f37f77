//! Operation queue — FIFO admission, strict single-flight dispatch
//!
//! One backlog and one in-flight slot for the whole manager: BLE hardware
//! serializes GATT traffic at the chip level even across multiple links, so a
//! second dispatch before the previous completion arrives is never allowed.
//! The queue always advances on completion, success or failure; a failed
//! operation must never wedge the backlog.

use crate::error::LinkError;
use crate::gatt::{DeviceId, WriteMode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// The unit of work a public operation enqueues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Read a characteristic value
    Read { characteristic: Uuid },
    /// Write a characteristic value
    Write {
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    },
    /// CCCD write toggling the notification state
    SetNotifications { characteristic: Uuid, enable: bool },
    /// MTU negotiation
    RequestMtu { value: u16 },
}

impl OperationKind {
    /// Target characteristic, when the operation has one
    pub fn characteristic(&self) -> Option<Uuid> {
        match self {
            OperationKind::Read { characteristic }
            | OperationKind::Write { characteristic, .. }
            | OperationKind::SetNotifications { characteristic, .. } => Some(*characteristic),
            OperationKind::RequestMtu { .. } => None,
        }
    }

    /// Short name used in events and logs
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Read { .. } => "read",
            OperationKind::Write { .. } => "write",
            OperationKind::SetNotifications { enable: true, .. } => "enable-notifications",
            OperationKind::SetNotifications { enable: false, .. } => "disable-notifications",
            OperationKind::RequestMtu { .. } => "request-mtu",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A queued operation awaiting dispatch or completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Monotonic id pairing a dispatch with its transport completion
    pub id: u64,
    /// Target device
    pub device: DeviceId,
    /// What to do
    pub kind: OperationKind,
}

/// The occupied in-flight slot
#[derive(Debug, Clone)]
pub struct InFlight {
    /// The dispatched operation
    pub op: PendingOperation,
    /// Set when the owning device was torn down after dispatch; the eventual
    /// completion is discarded and reported as `Cancelled`
    pub cancelled: bool,
}

/// Ordered backlog plus a single optional in-flight slot
#[derive(Debug, Default)]
pub struct OperationQueue {
    backlog: VecDeque<PendingOperation>,
    in_flight: Option<InFlight>,
    next_id: u64,
}

impl OperationQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation to the backlog; returns its id
    pub fn push(&mut self, device: DeviceId, kind: OperationKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.backlog.push_back(PendingOperation { id, device, kind });
        id
    }

    /// Move the backlog head into the in-flight slot, if the slot is free
    ///
    /// Returns the operation to hand to the transport, or `None` when the slot
    /// is occupied or the backlog is empty.
    pub fn dispatch_next(&mut self) -> Option<PendingOperation> {
        if self.in_flight.is_some() {
            return None;
        }
        let op = self.backlog.pop_front()?;
        self.in_flight = Some(InFlight {
            op: op.clone(),
            cancelled: false,
        });
        Some(op)
    }

    /// Clear the in-flight slot for the given operation id
    ///
    /// Returns `None` when the slot is empty or holds a different operation
    /// (a stale completion); the caller must not advance the queue in that
    /// case.
    pub fn complete(&mut self, op_id: u64) -> Option<InFlight> {
        match &self.in_flight {
            Some(in_flight) if in_flight.op.id == op_id => self.in_flight.take(),
            _ => None,
        }
    }

    /// Remove every backlog entry for `device`, returning them in order, and
    /// mark a matching in-flight operation for discard-on-arrival
    ///
    /// The in-flight operation is never aborted in place: a completion already
    /// issued to hardware cannot be un-issued.
    pub fn cancel_device(&mut self, device: &DeviceId) -> Vec<PendingOperation> {
        let mut cancelled = Vec::new();
        self.backlog.retain(|op| {
            if op.device == *device {
                cancelled.push(op.clone());
                false
            } else {
                true
            }
        });
        if let Some(in_flight) = &mut self.in_flight {
            if in_flight.op.device == *device {
                in_flight.cancelled = true;
            }
        }
        cancelled
    }

    /// Drain the whole backlog (manager shutdown); marks any in-flight
    /// operation for discard-on-arrival
    pub fn cancel_all(&mut self) -> Vec<PendingOperation> {
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.cancelled = true;
        }
        self.backlog.drain(..).collect()
    }

    /// Backlog length, excluding the in-flight slot
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Pending work including the in-flight slot
    pub fn depth(&self) -> usize {
        self.backlog.len() + usize::from(self.in_flight.is_some())
    }

    /// Whether an operation has been dispatched and not yet completed
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// The in-flight operation, if any
    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_op(characteristic: u128) -> OperationKind {
        OperationKind::Read {
            characteristic: Uuid::from_u128(characteristic),
        }
    }

    #[test]
    fn test_fifo_dispatch_order() {
        let mut queue = OperationQueue::new();
        let dev = DeviceId::from("D1");

        let id1 = queue.push(dev.clone(), read_op(1));
        let id2 = queue.push(dev.clone(), read_op(2));
        let id3 = queue.push(dev, read_op(3));

        let first = queue.dispatch_next().expect("head should dispatch");
        assert_eq!(first.id, id1);
        queue.complete(id1).expect("in-flight should resolve");

        let second = queue.dispatch_next().expect("second should dispatch");
        assert_eq!(second.id, id2);
        queue.complete(id2).expect("in-flight should resolve");

        let third = queue.dispatch_next().expect("third should dispatch");
        assert_eq!(third.id, id3);
    }

    #[test]
    fn test_single_flight_invariant() {
        let mut queue = OperationQueue::new();
        let dev = DeviceId::from("D1");

        queue.push(dev.clone(), read_op(1));
        queue.push(dev, read_op(2));

        let first = queue.dispatch_next().expect("dispatch");
        // Slot occupied: no second dispatch until completion
        assert!(queue.dispatch_next().is_none());
        assert!(queue.is_busy());
        assert_eq!(queue.depth(), 2);

        queue.complete(first.id).expect("resolve");
        assert!(!queue.is_busy());
        assert!(queue.dispatch_next().is_some());
    }

    #[test]
    fn test_complete_rejects_stale_id() {
        let mut queue = OperationQueue::new();
        let dev = DeviceId::from("D1");
        queue.push(dev, read_op(1));

        let op = queue.dispatch_next().expect("dispatch");
        assert!(queue.complete(op.id + 99).is_none());
        assert!(queue.is_busy(), "stale id must not clear the slot");
        assert!(queue.complete(op.id).is_some());
    }

    #[test]
    fn test_complete_on_empty_slot() {
        let mut queue = OperationQueue::new();
        assert!(queue.complete(0).is_none());
    }

    #[test]
    fn test_cancel_device_drains_backlog_in_order() {
        let mut queue = OperationQueue::new();
        let d1 = DeviceId::from("D1");
        let d2 = DeviceId::from("D2");

        let a = queue.push(d1.clone(), read_op(1));
        let b = queue.push(d2.clone(), read_op(2));
        let c = queue.push(d1.clone(), read_op(3));

        let cancelled = queue.cancel_device(&d1);
        assert_eq!(cancelled.len(), 2);
        assert_eq!(cancelled[0].id, a);
        assert_eq!(cancelled[1].id, c);

        // Other device's work survives
        assert_eq!(queue.backlog_len(), 1);
        assert_eq!(queue.dispatch_next().expect("dispatch").id, b);
    }

    #[test]
    fn test_cancel_device_marks_in_flight() {
        let mut queue = OperationQueue::new();
        let dev = DeviceId::from("D1");
        queue.push(dev.clone(), read_op(1));

        let op = queue.dispatch_next().expect("dispatch");
        let cancelled = queue.cancel_device(&dev);
        assert!(cancelled.is_empty(), "in-flight op stays in its slot");

        let in_flight = queue.complete(op.id).expect("late completion arrives");
        assert!(in_flight.cancelled, "must be marked for discard-on-arrival");
    }

    #[test]
    fn test_cancel_device_leaves_other_in_flight_untouched() {
        let mut queue = OperationQueue::new();
        let d1 = DeviceId::from("D1");
        let d2 = DeviceId::from("D2");
        queue.push(d1, read_op(1));

        let op = queue.dispatch_next().expect("dispatch");
        queue.cancel_device(&d2);

        let in_flight = queue.complete(op.id).expect("completion");
        assert!(!in_flight.cancelled);
    }

    #[test]
    fn test_cancel_all() {
        let mut queue = OperationQueue::new();
        let dev = DeviceId::from("D1");
        queue.push(dev.clone(), read_op(1));
        queue.push(dev.clone(), read_op(2));
        queue.push(dev, read_op(3));

        let op = queue.dispatch_next().expect("dispatch");
        let cancelled = queue.cancel_all();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(queue.backlog_len(), 0);
        assert!(queue.complete(op.id).expect("completion").cancelled);
    }

    #[test]
    fn test_operation_kind_labels() {
        assert_eq!(read_op(1).label(), "read");
        assert_eq!(
            OperationKind::Write {
                characteristic: Uuid::from_u128(1),
                payload: vec![0x12],
                mode: WriteMode::WithResponse,
            }
            .label(),
            "write"
        );
        assert_eq!(
            OperationKind::SetNotifications {
                characteristic: Uuid::from_u128(1),
                enable: true,
            }
            .label(),
            "enable-notifications"
        );
        assert_eq!(OperationKind::RequestMtu { value: 185 }.label(), "request-mtu");
    }

    #[test]
    fn test_operation_kind_characteristic() {
        assert!(read_op(7).characteristic().is_some());
        assert!(OperationKind::RequestMtu { value: 185 }
            .characteristic()
            .is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Completions arrive in enqueue order, whatever the interleaving
            // of devices, because there is exactly one in-flight slot.
            #[test]
            fn prop_completions_follow_enqueue_order(devices in proptest::collection::vec(0u8..4, 1..32)) {
                let mut queue = OperationQueue::new();
                let mut expected = Vec::new();

                for (i, dev) in devices.iter().enumerate() {
                    let device = DeviceId::new(format!("D{}", dev));
                    let id = queue.push(device, read_op(i as u128));
                    expected.push(id);
                }

                let mut completed = Vec::new();
                while let Some(op) = queue.dispatch_next() {
                    prop_assert!(queue.dispatch_next().is_none(), "single-flight violated");
                    queue.complete(op.id).expect("in-flight resolves");
                    completed.push(op.id);
                }

                prop_assert_eq!(completed, expected);
            }

            // Cancelling one device never reorders or drops the others.
            #[test]
            fn prop_cancel_preserves_survivors(devices in proptest::collection::vec(0u8..3, 1..24), victim in 0u8..3) {
                let mut queue = OperationQueue::new();
                let mut survivors = Vec::new();

                for (i, dev) in devices.iter().enumerate() {
                    let device = DeviceId::new(format!("D{}", dev));
                    let id = queue.push(device, read_op(i as u128));
                    if *dev != victim {
                        survivors.push(id);
                    }
                }

                queue.cancel_device(&DeviceId::new(format!("D{}", victim)));

                let mut completed = Vec::new();
                while let Some(op) = queue.dispatch_next() {
                    queue.complete(op.id).expect("in-flight resolves");
                    completed.push(op.id);
                }

                prop_assert_eq!(completed, survivors);
            }
        }
    }
}
