//! Device -> platform forwarding.

use crate::cache::RoutingCache;
use crate::topic::is_system_topic;
use crate::transport::InboundPublish;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use iotagent_core::{AttrsUpdate, SharedPlatformBus, UpdateMetadata};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to an inbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Broker-internal topic or no attributable client.
    Ignored,
    /// Payload is not a JSON object.
    Malformed,
    /// No device is registered on the topic.
    Unrouted,
    /// One attribute update per registered device.
    Forwarded(usize),
}

pub struct MessageForwarder {
    cache: Arc<RoutingCache>,
    bus: SharedPlatformBus,
}

impl MessageForwarder {
    pub fn new(cache: Arc<RoutingCache>, bus: SharedPlatformBus) -> Self {
        Self { cache, bus }
    }

    /// Turn a device publish into attribute updates for every device
    /// registered on its topic.
    pub fn forward(&self, publish: &InboundPublish) -> ForwardOutcome {
        if is_system_topic(&publish.topic) || !publish.has_client() {
            return ForwardOutcome::Ignored;
        }

        let data = match parse_payload(&publish.payload) {
            Some(data) => data,
            None => {
                warn!(
                    "Payload {} on {} is not a valid JSON object. Ignoring.",
                    String::from_utf8_lossy(&publish.payload),
                    publish.topic
                );
                return ForwardOutcome::Malformed;
            }
        };

        debug!(
            "Device to platform (client: {:?} topic: {} payload: {})",
            publish.client_id(),
            publish.topic,
            String::from_utf8_lossy(&publish.payload)
        );

        let metadata = UpdateMetadata {
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp),
        };

        let Some(devices) = self.cache.lookup_by_topic(&publish.topic) else {
            debug!("No device registered on {}", publish.topic);
            return ForwardOutcome::Unrouted;
        };

        for device in &devices {
            debug!("Forwarding data on {} to {}", publish.topic, device);
            let update = AttrsUpdate {
                tenant: device.tenant().to_string(),
                device_id: device.device_id().to_string(),
                data: data.clone(),
                metadata: metadata.clone(),
            };
            if let Err(e) = self.bus.update_attrs(update) {
                warn!("Failed to forward data to {}: {}", device, e);
            }
        }
        ForwardOutcome::Forwarded(devices.len())
    }
}

fn parse_payload(payload: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice(payload).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Parse a device timestamp into epoch milliseconds.
///
/// Accepts RFC 3339, RFC 2822, a date-time without offset (taken as UTC)
/// and a bare date (UTC midnight).
pub fn parse_timestamp(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.timestamp_millis());
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(ts.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
            return Some(ts.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc().timestamp_millis())
}
