//! Shared test transport: every trait call surfaces as a [`Call`] on a
//! channel the test body drains, and blocks until the test scripts its
//! outcome. This gives tests full control over completion order.

use async_trait::async_trait;
use gattlink_core::{
    Characteristic, CharacteristicProps, DeviceId, LinkError, LinkHandle, Service, ServiceCatalog,
    Transport, WriteMode,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Opt-in log output for test debugging, e.g. RUST_LOG=debug (idempotent)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// What the manager asked the transport to do
#[derive(Debug)]
pub enum CallKind {
    Connect(DeviceId),
    Discover(LinkHandle),
    Read(LinkHandle, Uuid),
    Write(LinkHandle, Uuid, Vec<u8>, WriteMode),
    SetNotify(LinkHandle, Uuid, bool),
    Mtu(LinkHandle, u16),
    Disconnect(LinkHandle),
}

/// The scripted outcome a test hands back
#[derive(Debug)]
pub enum Reply {
    Link(LinkHandle),
    Catalog(ServiceCatalog),
    Value(Vec<u8>),
    Ack,
    Mtu(u16),
}

pub struct Call {
    pub kind: CallKind,
    pub respond: oneshot::Sender<Result<Reply, LinkError>>,
}

pub struct ScriptedTransport {
    calls_tx: mpsc::UnboundedSender<Call>,
}

impl ScriptedTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { calls_tx }), calls_rx)
    }
}

impl ScriptedTransport {
    async fn invoke(&self, kind: CallKind) -> Result<Reply, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.calls_tx
            .send(Call { kind, respond: tx })
            .expect("test driver dropped the call channel");
        rx.await.expect("call left unanswered by test script")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, device: &DeviceId) -> Result<LinkHandle, LinkError> {
        match self.invoke(CallKind::Connect(device.clone())).await? {
            Reply::Link(link) => Ok(link),
            other => panic!("connect scripted with {:?}", other),
        }
    }

    async fn discover_services(&self, link: LinkHandle) -> Result<ServiceCatalog, LinkError> {
        match self.invoke(CallKind::Discover(link)).await? {
            Reply::Catalog(catalog) => Ok(catalog),
            other => panic!("discover scripted with {:?}", other),
        }
    }

    async fn read_characteristic(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, LinkError> {
        match self.invoke(CallKind::Read(link, characteristic)).await? {
            Reply::Value(value) => Ok(value),
            other => panic!("read scripted with {:?}", other),
        }
    }

    async fn write_characteristic(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        payload: Vec<u8>,
        mode: WriteMode,
    ) -> Result<(), LinkError> {
        match self
            .invoke(CallKind::Write(link, characteristic, payload, mode))
            .await?
        {
            Reply::Ack => Ok(()),
            other => panic!("write scripted with {:?}", other),
        }
    }

    async fn set_notification_state(
        &self,
        link: LinkHandle,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), LinkError> {
        match self
            .invoke(CallKind::SetNotify(link, characteristic, enable))
            .await?
        {
            Reply::Ack => Ok(()),
            other => panic!("set_notification_state scripted with {:?}", other),
        }
    }

    async fn request_mtu(&self, link: LinkHandle, mtu: u16) -> Result<u16, LinkError> {
        match self.invoke(CallKind::Mtu(link, mtu)).await? {
            Reply::Mtu(agreed) => Ok(agreed),
            other => panic!("request_mtu scripted with {:?}", other),
        }
    }

    async fn disconnect(&self, link: LinkHandle) -> Result<(), LinkError> {
        match self.invoke(CallKind::Disconnect(link)).await? {
            Reply::Ack => Ok(()),
            other => panic!("disconnect scripted with {:?}", other),
        }
    }
}

// Fixed UUIDs used across the tests
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);
pub const RX_CHAR: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
pub const TX_CHAR: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// A catalog with one readable characteristic, one writable, one notifiable
pub fn demo_catalog() -> ServiceCatalog {
    ServiceCatalog::new(vec![Service {
        uuid: Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb),
        characteristics: vec![
            Characteristic {
                uuid: BATTERY_LEVEL,
                props: CharacteristicProps {
                    read: true,
                    ..Default::default()
                },
                descriptors: vec![],
            },
            Characteristic {
                uuid: RX_CHAR,
                props: CharacteristicProps {
                    write: true,
                    write_without_response: true,
                    ..Default::default()
                },
                descriptors: vec![],
            },
            Characteristic {
                uuid: TX_CHAR,
                props: CharacteristicProps {
                    notify: true,
                    ..Default::default()
                },
                descriptors: vec![gattlink_core::CCCD_UUID],
            },
        ],
    }])
}

/// Answer the next transport call, asserting its shape with `check`
pub async fn answer(
    calls: &mut mpsc::UnboundedReceiver<Call>,
    check: impl FnOnce(&CallKind) -> bool,
    reply: Result<Reply, LinkError>,
) {
    let call = calls.recv().await.expect("expected a transport call");
    assert!(check(&call.kind), "unexpected transport call {:?}", call.kind);
    call.respond.send(reply).expect("manager dropped the reply");
}

/// Walk a device through connect + discovery until it is `Ready`
pub async fn bring_ready(
    manager: &gattlink_core::LinkManager,
    calls: &mut mpsc::UnboundedReceiver<Call>,
    device: &DeviceId,
    link: LinkHandle,
) {
    manager.connect(device.clone()).await.expect("connect");
    answer(
        calls,
        |k| matches!(k, CallKind::Connect(d) if d == device),
        Ok(Reply::Link(link)),
    )
    .await;
    answer(
        calls,
        |k| matches!(k, CallKind::Discover(l) if *l == link),
        Ok(Reply::Catalog(demo_catalog())),
    )
    .await;
    // The discovery completion races with whatever the test does next over
    // the command channel, so wait until the state machine settles.
    loop {
        let state = manager
            .connection_state(device.clone())
            .await
            .expect("state query");
        if state == gattlink_core::ConnectionState::Ready {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
}

/// Receive events until one matches, discarding the rest
pub async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<gattlink_core::LinkEvent>,
    matcher: impl Fn(&gattlink_core::LinkEvent) -> bool,
) -> gattlink_core::LinkEvent {
    loop {
        let event = events.recv().await.expect("event stream closed");
        if matcher(&event) {
            return event;
        }
    }
}
