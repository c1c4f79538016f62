//! Topic derivation.
//!
//! A device is reachable on one of two topic shapes:
//!
//! ```text
//! broadcast   /_dojot/<serial number>/attrs    /_dojot/<serial number>/config
//! unicast     /<tenant>/<device id>/attrs      /<tenant>/<device id>/config
//! ```
//!
//! Devices carrying a serial-number attribute (label `SN`, any case) share
//! the broadcast topics of that serial number; every other device gets
//! private unicast topics.

use iotagent_core::DeviceData;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::warn;

/// First topic level of broadcast topics.
pub const BROADCAST_NAMESPACE: &str = "_dojot";
/// Suffix of device → platform topics.
pub const ATTRS_SUFFIX: &str = "attrs";
/// Suffix of platform → device topics.
pub const CONFIG_SUFFIX: &str = "config";
/// Attribute label selecting broadcast addressing.
pub const SERIAL_NUMBER_LABEL: &str = "SN";
/// First topic level of broker-internal topics.
pub const SYS_TOPIC_PREFIX: &str = "$SYS";

/// How a device is addressed on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Shared topic keyed on the serial number.
    Broadcast { serial_number: String },
    /// Private topic keyed on tenant and device id.
    Unicast,
}

/// Topics derived for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRoute {
    pub addressing: Addressing,
    /// Topic the device publishes telemetry on.
    pub attrs_topic: String,
    /// Topic the device receives commands on.
    pub config_topic: String,
}

impl TopicRoute {
    fn with_prefix(prefix: &str, addressing: Addressing) -> Self {
        Self {
            addressing,
            attrs_topic: format!("{prefix}/{ATTRS_SUFFIX}"),
            config_topic: format!("{prefix}/{CONFIG_SUFFIX}"),
        }
    }

    /// Broadcast topics for a serial number.
    pub fn broadcast(serial_number: impl Into<String>) -> Self {
        let serial_number = serial_number.into();
        let prefix = format!("/{BROADCAST_NAMESPACE}/{serial_number}");
        Self::with_prefix(&prefix, Addressing::Broadcast { serial_number })
    }

    /// Unicast topics for a tenant and device.
    pub fn unicast(tenant: &str, device_id: &str) -> Self {
        Self::with_prefix(&format!("/{tenant}/{device_id}"), Addressing::Unicast)
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.addressing, Addressing::Broadcast { .. })
    }
}

/// Derive the topics of a device from its lifecycle event data.
///
/// Templates are visited in ascending template-id order and attributes in
/// list order; the first `SN` attribute with a usable `static_value` wins.
/// Conflicting serial numbers found later are reported and ignored.
pub fn derive_route(tenant: &str, data: &DeviceData) -> TopicRoute {
    let scan = data
        .attrs
        .as_ref()
        .and_then(Value::as_object)
        .map(scan_serial_numbers)
        .unwrap_or_default();

    for template in &scan.unusable {
        warn!(
            "Device {}:{} has an SN attribute in template {} without a string, number or boolean static_value, ignoring it",
            tenant, data.id, template
        );
    }

    let Some(serial_number) = scan.found.first() else {
        return TopicRoute::unicast(tenant, &data.id);
    };

    if let Some(ignored) = scan.found.iter().find(|sn| *sn != serial_number) {
        warn!(
            "Device {}:{} has conflicting serial numbers, using '{}' and ignoring '{}'",
            tenant, data.id, serial_number, ignored
        );
    }
    TopicRoute::broadcast(serial_number.clone())
}

/// Whether the topic belongs to the broker itself.
pub fn is_system_topic(topic: &str) -> bool {
    topic.split('/').next() == Some(SYS_TOPIC_PREFIX)
}

/// `SN` attributes found in a template map.
#[derive(Debug, Default, PartialEq)]
struct SerialScan {
    /// Usable serial numbers, in scan order.
    found: Vec<String>,
    /// Template ids holding an `SN` attribute with no usable value.
    unusable: Vec<String>,
}

fn scan_serial_numbers(templates: &Map<String, Value>) -> SerialScan {
    let mut ordered: Vec<(&String, &Value)> = templates.iter().collect();
    ordered.sort_by(|(a, _), (b, _)| template_order(a, b));

    let mut scan = SerialScan::default();
    for (template, attrs) in ordered {
        let Some(attrs) = attrs.as_array() else {
            continue;
        };
        for attr in attrs.iter().filter(|attr| is_serial_number_label(attr)) {
            match attr.get("static_value").and_then(serial_text) {
                Some(serial) => scan.found.push(serial),
                None => scan.unusable.push(template.clone()),
            }
        }
    }
    scan
}

fn is_serial_number_label(attr: &Value) -> bool {
    attr.get("label")
        .and_then(Value::as_str)
        .is_some_and(|label| label.eq_ignore_ascii_case(SERIAL_NUMBER_LABEL))
}

fn serial_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Integer template ids sort numerically and before any other id.
fn template_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotagent_core::DeviceEvent;
    use serde_json::json;

    fn data(attrs: Value) -> DeviceData {
        DeviceEvent::new("d1").with_attrs(attrs).data
    }

    #[test]
    fn test_unicast_without_attrs() {
        let route = derive_route("t1", &DeviceEvent::new("d1").data);
        assert_eq!(route.attrs_topic, "/t1/d1/attrs");
        assert_eq!(route.config_topic, "/t1/d1/config");
        assert_eq!(route.addressing, Addressing::Unicast);
    }

    #[test]
    fn test_unicast_without_sn_attribute() {
        let route = derive_route(
            "t1",
            &data(json!({"1": [{"label": "temperature", "type": "dynamic"}]})),
        );
        assert_eq!(route, TopicRoute::unicast("t1", "d1"));
    }

    #[test]
    fn test_broadcast_label_is_case_insensitive() {
        for label in ["SN", "sn", "Sn"] {
            let route = derive_route(
                "t1",
                &data(json!({"7": [{"label": label, "static_value": "ABC123"}]})),
            );
            assert_eq!(route.attrs_topic, "/_dojot/ABC123/attrs");
            assert_eq!(route.config_topic, "/_dojot/ABC123/config");
            assert!(route.is_broadcast());
        }
    }

    #[test]
    fn test_first_serial_number_wins() {
        let route = derive_route(
            "t1",
            &data(json!({
                "10": [{"label": "sn", "static_value": "LATE"}],
                "9": [
                    {"label": "model", "static_value": "x"},
                    {"label": "SN", "static_value": "EARLY"},
                    {"label": "SN", "static_value": "EARLY-2"}
                ]
            })),
        );
        assert_eq!(
            route.addressing,
            Addressing::Broadcast {
                serial_number: "EARLY".to_string()
            }
        );
    }

    #[test]
    fn test_sn_without_static_value_is_skipped() {
        let route = derive_route("t1", &data(json!({"1": [{"label": "SN"}]})));
        assert_eq!(route, TopicRoute::unicast("t1", "d1"));

        let route = derive_route(
            "t1",
            &data(json!({"1": [{"label": "SN", "static_value": null}, {"label": "sn", "static_value": 42}]})),
        );
        assert_eq!(route.attrs_topic, "/_dojot/42/attrs");
    }

    #[test]
    fn test_unusable_sn_is_reported() {
        let templates = json!({
            "2": [{"label": "SN", "static_value": {"nested": true}}],
            "1": [{"label": "sn"}, {"label": "SN", "static_value": "OK"}]
        });
        let scan = scan_serial_numbers(templates.as_object().unwrap());
        assert_eq!(scan.found, vec!["OK".to_string()]);
        assert_eq!(scan.unusable, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_malformed_templates_fall_through() {
        let route = derive_route("t1", &data(json!({"1": "not-a-list", "2": [7, {"no": "label"}]})));
        assert_eq!(route, TopicRoute::unicast("t1", "d1"));

        let route = derive_route("t1", &data(json!(["SN"])));
        assert_eq!(route, TopicRoute::unicast("t1", "d1"));
    }

    #[test]
    fn test_template_order() {
        assert_eq!(template_order("9", "10"), Ordering::Less);
        assert_eq!(template_order("10", "abc"), Ordering::Less);
        assert_eq!(template_order("b", "a"), Ordering::Greater);
    }

    #[test]
    fn test_system_topics() {
        assert!(is_system_topic("$SYS/broker/uptime"));
        assert!(is_system_topic("$SYS"));
        assert!(!is_system_topic("/t1/d1/attrs"));
        assert!(!is_system_topic("/$SYS/x"));
    }
}
