//! MQTT IoT agent.
//!
//! Bridges MQTT devices and the device-management platform by keeping a
//! bidirectional map between transport topics and (tenant, device)
//! identities.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | `rumqttc` client transport |
//!
//! ## Architecture
//!
//! - **DeviceIdentity**: (tenant, device id) value type
//! - **derive_route**: broadcast/unicast topic derivation
//! - **RoutingCache**: topic -> identities and identity -> command topic
//! - **LifecycleHandler**: applies device create/update/remove/configure
//! - **PublishAuthorizer**, **MessageForwarder**, **CommandDispatcher**:
//!   the read side used by the transport and by configure events
//! - **IotAgent**: startup sequence and [`BrokerHooks`] implementation

pub mod agent;
pub mod authorizer;
pub mod cache;
pub mod dispatcher;
pub mod forwarder;
pub mod handler;
pub mod identity;
pub mod topic;
pub mod transport;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use agent::IotAgent;
pub use authorizer::PublishAuthorizer;
pub use cache::{CacheSnapshot, RoutingCache};
pub use dispatcher::{CommandDispatcher, DispatchOutcome};
pub use forwarder::{parse_timestamp, ForwardOutcome, MessageForwarder};
pub use handler::{HandleOutcome, LifecycleHandler};
pub use identity::DeviceIdentity;
pub use topic::{derive_route, is_system_topic, Addressing, TopicRoute};
pub use transport::{
    BrokerHooks, InboundPublish, OutboundMessage, PublishCompleter, PublishCompletion,
    PublishOrigin, QoS, SharedTransport, Transport,
};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttDriver, MqttTransport, MqttTransportError, DEVICE_ATTRS_FILTER};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
