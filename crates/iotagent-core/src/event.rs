//! Platform event types.
//!
//! The platform notifies the agent about device lifecycle changes and the
//! agent answers with attribute updates. Both directions flow through the
//! event bus as [`PlatformEvent`] values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Device lifecycle event kinds, as named on the platform bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleKind {
    #[serde(rename = "device.create")]
    Create,
    #[serde(rename = "device.update")]
    Update,
    #[serde(rename = "device.remove")]
    Remove,
    #[serde(rename = "device.configure")]
    Configure,
}

impl LifecycleKind {
    /// Every lifecycle kind, in the order handlers are registered.
    pub const ALL: [LifecycleKind; 4] = [
        LifecycleKind::Create,
        LifecycleKind::Update,
        LifecycleKind::Remove,
        LifecycleKind::Configure,
    ];

    /// Bus subject of this kind.
    pub fn subject(&self) -> &'static str {
        match self {
            LifecycleKind::Create => "device.create",
            LifecycleKind::Update => "device.update",
            LifecycleKind::Remove => "device.remove",
            LifecycleKind::Configure => "device.configure",
        }
    }
}

impl fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subject())
    }
}

/// Payload of a device lifecycle event.
///
/// For create/update/remove `data.attrs` maps template ids to attribute
/// lists; for configure it maps attribute labels to the values to send to
/// the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub data: DeviceData,
    /// Fields the agent does not interpret (event metadata, etc.).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Device section of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attrs: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceEvent {
    /// Create an event for the given device id without attributes.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            data: DeviceData {
                id: device_id.into(),
                attrs: None,
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    /// Set the `data.attrs` section.
    pub fn with_attrs(mut self, attrs: Value) -> Self {
        self.data.attrs = Some(attrs);
        self
    }

    /// Device id carried by the event.
    pub fn device_id(&self) -> &str {
        &self.data.id
    }
}

/// A lifecycle event addressed to a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub tenant: String,
    pub kind: LifecycleKind,
    pub event: DeviceEvent,
}

impl LifecycleEvent {
    pub fn new(tenant: impl Into<String>, kind: LifecycleKind, event: DeviceEvent) -> Self {
        Self {
            tenant: tenant.into(),
            kind,
            event,
        }
    }
}

/// Metadata attached to an attribute update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    /// Device-side timestamp in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Attribute update emitted upstream for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrsUpdate {
    pub tenant: String,
    pub device_id: String,
    pub data: Map<String, Value>,
    pub metadata: UpdateMetadata,
}

/// Unified event type carried by the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlatformEvent {
    /// Device lifecycle notification from the platform.
    Lifecycle(LifecycleEvent),

    /// Device telemetry forwarded to the platform.
    AttrsUpdated(AttrsUpdate),

    /// The agent asked for create events of every active device.
    ReplayRequested { timestamp: i64 },
}

impl PlatformEvent {
    /// Get the event type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            PlatformEvent::Lifecycle(_) => "Lifecycle",
            PlatformEvent::AttrsUpdated(_) => "AttrsUpdated",
            PlatformEvent::ReplayRequested { .. } => "ReplayRequested",
        }
    }

    /// Check if this is a lifecycle event.
    pub fn is_lifecycle_event(&self) -> bool {
        matches!(self, PlatformEvent::Lifecycle(_))
    }

    /// Check if this is an attribute update.
    pub fn is_attrs_update(&self) -> bool {
        matches!(self, PlatformEvent::AttrsUpdated(_))
    }
}
