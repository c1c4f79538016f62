//! Device lifecycle handling.
//!
//! | event              | cache effect                          |
//! |--------------------|---------------------------------------|
//! | `device.create`    | derive topics, add                    |
//! | `device.update`    | remove, then derive and add again     |
//! | `device.remove`    | remove                                |
//! | `device.configure` | none, the command is dispatched       |

use crate::cache::RoutingCache;
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::identity::DeviceIdentity;
use crate::topic::{derive_route, TopicRoute};
use iotagent_core::{DeviceEvent, LifecycleEvent, LifecycleKind};
use std::sync::Arc;
use tracing::debug;

/// What a lifecycle event did.
#[derive(Debug)]
pub enum HandleOutcome {
    /// The device is now routed through these topics.
    Routed(TopicRoute),
    /// The device was removed; `false` when it was not cached.
    Removed(bool),
    /// Result of a configure event.
    Dispatched(DispatchOutcome),
}

pub struct LifecycleHandler {
    cache: Arc<RoutingCache>,
    dispatcher: CommandDispatcher,
}

impl LifecycleHandler {
    pub fn new(cache: Arc<RoutingCache>, dispatcher: CommandDispatcher) -> Self {
        Self { cache, dispatcher }
    }

    pub fn handle(&self, event: &LifecycleEvent) -> HandleOutcome {
        debug!(
            "Got {} event for device {} of tenant {}",
            event.kind,
            event.event.device_id(),
            event.tenant
        );
        match event.kind {
            LifecycleKind::Create => HandleOutcome::Routed(self.on_create(&event.tenant, &event.event)),
            LifecycleKind::Update => HandleOutcome::Routed(self.on_update(&event.tenant, &event.event)),
            LifecycleKind::Remove => HandleOutcome::Removed(self.on_remove(&event.tenant, &event.event)),
            LifecycleKind::Configure => {
                HandleOutcome::Dispatched(self.on_configure(&event.tenant, &event.event))
            }
        }
    }

    pub fn on_create(&self, tenant: &str, event: &DeviceEvent) -> TopicRoute {
        let route = derive_route(tenant, &event.data);
        self.cache.add(
            route.attrs_topic.clone(),
            route.config_topic.clone(),
            DeviceIdentity::new(tenant, event.device_id()),
        );
        route
    }

    /// Full re-derivation: the serial number may have changed.
    pub fn on_update(&self, tenant: &str, event: &DeviceEvent) -> TopicRoute {
        self.cache
            .remove(&DeviceIdentity::new(tenant, event.device_id()));
        self.on_create(tenant, event)
    }

    pub fn on_remove(&self, tenant: &str, event: &DeviceEvent) -> bool {
        let identity = DeviceIdentity::new(tenant, event.device_id());
        let removed = self.cache.remove(&identity);
        if !removed {
            debug!("Remove event for uncached device {}", identity);
        }
        removed
    }

    pub fn on_configure(&self, tenant: &str, event: &DeviceEvent) -> DispatchOutcome {
        self.dispatcher.dispatch(tenant, event)
    }
}
