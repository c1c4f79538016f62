//! Shared helpers for the agent integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use iotagent_core::{
    AttrsUpdate, DeviceEvent, Error, EventBus, LifecycleKind, LifecycleReceiver, PlatformBus,
    PlatformEvent, Result,
};
use iotagent_mqtt::{IotAgent, OutboundMessage, PublishCompletion, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Transport that records every message it is asked to publish.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

impl Transport for RecordingTransport {
    fn publish(&self, message: OutboundMessage) -> PublishCompletion {
        self.sent.lock().push(message);
        PublishCompletion::ready(Ok(()))
    }
}

/// Bus whose initialization always fails.
pub struct FailingBus {
    inner: EventBus,
}

impl FailingBus {
    pub fn new() -> Self {
        Self {
            inner: EventBus::new(),
        }
    }
}

#[async_trait]
impl PlatformBus for FailingBus {
    async fn initialize(&self) -> Result<()> {
        Err(Error::bus("broker unreachable"))
    }

    fn subscribe(&self, kinds: &[LifecycleKind]) -> LifecycleReceiver {
        self.inner.subscribe(kinds)
    }

    fn update_attrs(&self, update: AttrsUpdate) -> Result<()> {
        self.inner.update_attrs(update)
    }

    fn request_active_device_replay(&self) -> Result<()> {
        self.inner.request_active_device_replay()
    }
}

/// Bus that comes up but cannot serve the startup replay.
pub struct ReplayFailingBus {
    pub inner: EventBus,
}

#[async_trait]
impl PlatformBus for ReplayFailingBus {
    async fn initialize(&self) -> Result<()> {
        self.inner.initialize().await
    }

    fn subscribe(&self, kinds: &[LifecycleKind]) -> LifecycleReceiver {
        self.inner.subscribe(kinds)
    }

    fn update_attrs(&self, update: AttrsUpdate) -> Result<()> {
        self.inner.update_attrs(update)
    }

    fn request_active_device_replay(&self) -> Result<()> {
        Err(Error::bus("replay topic unavailable"))
    }
}

pub struct Harness {
    pub bus: EventBus,
    pub transport: Arc<RecordingTransport>,
    pub agent: Arc<IotAgent>,
}

/// Agent on an in-process bus, already initialized.
pub async fn started_agent() -> Harness {
    let bus = EventBus::new();
    let transport = Arc::new(RecordingTransport::default());
    let agent = Arc::new(IotAgent::new(Arc::new(bus.clone()), transport.clone()));
    agent.init().await.expect("agent init");
    Harness {
        bus,
        transport,
        agent,
    }
}

/// Poll `condition` until it holds or a second has passed.
pub async fn wait_until<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Drain every attribute update currently buffered.
pub fn drain_updates<F>(rx: &mut iotagent_core::FilteredReceiver<F>) -> Vec<AttrsUpdate>
where
    F: Fn(&PlatformEvent) -> bool + Send,
{
    let mut updates = Vec::new();
    while let Some(event) = rx.try_recv() {
        if let PlatformEvent::AttrsUpdated(update) = event {
            updates.push(update);
        }
    }
    updates
}

pub fn unicast_device(id: &str) -> DeviceEvent {
    DeviceEvent::new(id).with_attrs(json!({
        "1": [{"label": "temperature", "type": "dynamic", "value_type": "float"}]
    }))
}

pub fn serial_device(id: &str, serial: &str) -> DeviceEvent {
    DeviceEvent::new(id).with_attrs(json!({
        "3": [
            {"label": "model", "type": "static", "static_value": "xyz"},
            {"label": "sn", "type": "static", "static_value": serial}
        ]
    }))
}

pub fn payload_json(message: &OutboundMessage) -> Value {
    serde_json::from_slice(&message.payload).expect("json payload")
}
