//! Platform -> device command dispatch.

use crate::cache::RoutingCache;
use crate::identity::DeviceIdentity;
use crate::transport::{OutboundMessage, PublishCompletion, SharedTransport};
use iotagent_core::DeviceEvent;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Result of a configure event.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handed to the transport.
    Published {
        topic: String,
        completion: PublishCompletion,
    },
    /// The device is not cached; nothing was published.
    UnknownDevice,
}

pub struct CommandDispatcher {
    cache: Arc<RoutingCache>,
    transport: SharedTransport,
}

impl CommandDispatcher {
    pub fn new(cache: Arc<RoutingCache>, transport: SharedTransport) -> Self {
        Self { cache, transport }
    }

    /// Publish the attributes of a configure event to the device's command
    /// topic.
    pub fn dispatch(&self, tenant: &str, event: &DeviceEvent) -> DispatchOutcome {
        let identity = DeviceIdentity::new(tenant, event.device_id());
        let Some(topic) = self.cache.lookup_by_identity(&identity) else {
            debug!("Ignoring configure event for unknown device {}", identity);
            return DispatchOutcome::UnknownDevice;
        };

        let payload = command_payload(event).to_string();
        debug!("Publishing {} on topic {}", payload, topic);
        let completion = self
            .transport
            .publish(OutboundMessage::new(topic.clone(), payload));
        DispatchOutcome::Published { topic, completion }
    }
}

/// Body sent to the device: `data.attrs`, or the rest of `data` without
/// its `id` when the event carries no attrs.
fn command_payload(event: &DeviceEvent) -> Value {
    match &event.data.attrs {
        Some(attrs) => attrs.clone(),
        None => Value::Object(event.data.extra.clone()),
    }
}
