//! Core types for the MQTT IoT agent.
//!
//! This crate defines what the agent exchanges with the device-management
//! platform: lifecycle and attribute-update events, the [`PlatformBus`]
//! contract with its in-process [`EventBus`] implementation, configuration
//! and the shared error type.

pub mod config;
pub mod error;
pub mod event;
pub mod eventbus;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use event::{
    AttrsUpdate, DeviceData, DeviceEvent, LifecycleEvent, LifecycleKind, PlatformEvent,
    UpdateMetadata,
};
pub use eventbus::{
    EventBus, FilteredReceiver, LifecycleReceiver, PlatformBus,
    SharedPlatformBus, DEFAULT_CHANNEL_CAPACITY,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, AgentConfig};
    pub use crate::error::{Error, Result};
    pub use crate::event::{AttrsUpdate, DeviceEvent, LifecycleEvent, LifecycleKind, PlatformEvent};
    pub use crate::eventbus::{EventBus, PlatformBus, SharedPlatformBus};
}
