//! Platform event bus.
//!
//! [`PlatformBus`] is the contract the agent consumes: initialization,
//! lifecycle subscriptions, attribute updates and the startup replay
//! request. [`EventBus`] is the in-process implementation backed by a
//! tokio broadcast channel.

use crate::error::{Error, Result};
use crate::event::{AttrsUpdate, DeviceEvent, LifecycleEvent, LifecycleKind, PlatformEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Contract between the agent and the platform's event bus.
#[async_trait]
pub trait PlatformBus: Send + Sync {
    /// Bring the bus client up. Must succeed before anything else is used.
    async fn initialize(&self) -> Result<()>;

    /// Subscribe to the given lifecycle kinds.
    ///
    /// A single receiver preserves the relative order of all events it
    /// covers and never drops any of them.
    fn subscribe(&self, kinds: &[LifecycleKind]) -> LifecycleReceiver;

    /// Emit an attribute update upstream.
    fn update_attrs(&self, update: AttrsUpdate) -> Result<()>;

    /// Ask the platform to re-emit `device.create` for every active device.
    fn request_active_device_replay(&self) -> Result<()>;
}

/// Shared platform bus handle.
pub type SharedPlatformBus = Arc<dyn PlatformBus>;

/// In-process event bus.
///
/// Besides distributing events it remembers which devices are active
/// (created or updated and not removed) so that a replay request can
/// re-publish their create events, the way the platform does after an
/// agent restart.
#[derive(Clone)]
pub struct EventBus {
    /// Broadcast channel sender
    tx: broadcast::Sender<PlatformEvent>,
    /// Lifecycle subscriptions, one unbounded queue each
    lifecycle: Arc<Mutex<Vec<LifecycleSubscription>>>,
    /// Last known event of each active device, keyed by (tenant, device id)
    active: Arc<Mutex<BTreeMap<(String, String), DeviceEvent>>>,
    initialized: Arc<AtomicBool>,
    /// Event bus name for identification
    name: String,
}

impl EventBus {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with the specified capacity.
    ///
    /// The capacity determines how many events are buffered for slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            lifecycle: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(Mutex::new(BTreeMap::new())),
            initialized: Arc::new(AtomicBool::new(false)),
            name: "default".to_string(),
        }
    }

    /// Create a new event bus with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::new()
        }
    }

    /// Get the name of this event bus.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`PlatformBus::initialize`] has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Get the number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.retain(|sub| !sub.tx.is_closed());
        self.tx.receiver_count() + lifecycle.len()
    }

    /// Number of devices a replay would re-create.
    pub fn active_device_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Publish a lifecycle event on behalf of the platform.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish_lifecycle(
        &self,
        tenant: impl Into<String>,
        kind: LifecycleKind,
        event: DeviceEvent,
    ) -> bool {
        let tenant = tenant.into();
        {
            let key = (tenant.clone(), event.device_id().to_string());
            let mut active = self.active.lock();
            match kind {
                LifecycleKind::Create | LifecycleKind::Update => {
                    active.insert(key, event.clone());
                }
                LifecycleKind::Remove => {
                    active.remove(&key);
                }
                LifecycleKind::Configure => {}
            }
        }
        self.publish(PlatformEvent::Lifecycle(LifecycleEvent::new(
            tenant, kind, event,
        )))
    }

    /// Publish a raw event. Returns `true` if there was at least one subscriber.
    ///
    /// Lifecycle events are queued to every matching lifecycle subscription
    /// before they are broadcast.
    pub fn publish(&self, event: PlatformEvent) -> bool {
        let mut delivered = false;
        if let PlatformEvent::Lifecycle(lifecycle) = &event {
            let mut subs = self.lifecycle.lock();
            subs.retain(|sub| {
                if !sub.kinds.contains(&lifecycle.kind) {
                    return !sub.tx.is_closed();
                }
                let sent = sub.tx.send(lifecycle.clone()).is_ok();
                delivered |= sent;
                sent
            });
        }
        self.tx.send(event).is_ok() || delivered
    }

    /// Subscribe to attribute updates only.
    pub fn attrs_updates(&self) -> FilteredReceiver<fn(&PlatformEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), PlatformEvent::is_attrs_update)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformBus for EventBus {
    async fn initialize(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        info!("Event bus '{}' initialized", self.name);
        Ok(())
    }

    fn subscribe(&self, kinds: &[LifecycleKind]) -> LifecycleReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lifecycle.lock().push(LifecycleSubscription {
            kinds: kinds.to_vec(),
            tx,
        });
        LifecycleReceiver { rx }
    }

    fn update_attrs(&self, update: AttrsUpdate) -> Result<()> {
        debug!(
            "Attribute update for {}:{} on bus '{}'",
            update.tenant, update.device_id, self.name
        );
        // Nobody listening upstream is not a failure of the agent.
        self.publish(PlatformEvent::AttrsUpdated(update));
        Ok(())
    }

    fn request_active_device_replay(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::bus("replay requested before initialization"));
        }
        let snapshot: Vec<((String, String), DeviceEvent)> = self
            .active
            .lock()
            .iter()
            .map(|(key, event)| (key.clone(), event.clone()))
            .collect();

        info!(
            "Replaying create events for {} active devices",
            snapshot.len()
        );
        self.publish(PlatformEvent::ReplayRequested {
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
        for ((tenant, _), event) in snapshot {
            self.publish(PlatformEvent::Lifecycle(LifecycleEvent::new(
                tenant,
                LifecycleKind::Create,
                event,
            )));
        }
        Ok(())
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<F>
where
    F: Fn(&PlatformEvent) -> bool + Send,
{
    rx: broadcast::Receiver<PlatformEvent>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&PlatformEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<PlatformEvent>, filter: F) -> Self {
        Self { rx, filter }
    }

    /// Receive the next event matching the filter.
    ///
    /// Returns `None` if the event bus is closed.
    pub async fn recv(&mut self) -> Option<PlatformEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if (self.filter)(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<PlatformEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some(event);
            }
        }
        None
    }
}

struct LifecycleSubscription {
    kinds: Vec<LifecycleKind>,
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

/// Receiver for device lifecycle events of selected kinds.
///
/// Backed by an unbounded queue: a slow consumer delays events but never
/// loses them, so a replay of any size reaches the handler in full.
pub struct LifecycleReceiver {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

impl LifecycleReceiver {
    /// Receive the next lifecycle event of a subscribed kind.
    ///
    /// Returns `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }

    /// Try to receive a lifecycle event without blocking.
    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn update(device_id: &str) -> AttrsUpdate {
        AttrsUpdate {
            tenant: "t1".to_string(),
            device_id: device_id.to_string(),
            data: Map::new(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_subscription_filters_kinds() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&[LifecycleKind::Remove]);

        bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d1"));
        bus.publish_lifecycle("t1", LifecycleKind::Remove, DeviceEvent::new("d1"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, LifecycleKind::Remove);
        assert_eq!(event.event.device_id(), "d1");
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_subscription_preserves_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe(&LifecycleKind::ALL);

        bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d1"));
        bus.publish_lifecycle("t1", LifecycleKind::Update, DeviceEvent::new("d1"));
        bus.publish_lifecycle("t1", LifecycleKind::Remove, DeviceEvent::new("d1"));

        let kinds: Vec<_> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                LifecycleKind::Create,
                LifecycleKind::Update,
                LifecycleKind::Remove
            ]
        );
    }

    #[tokio::test]
    async fn test_attrs_updates_receiver() {
        let bus = EventBus::new();
        let mut updates = bus.attrs_updates();

        bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d1"));
        bus.update_attrs(update("d1")).unwrap();

        match updates.recv().await {
            Some(PlatformEvent::AttrsUpdated(u)) => assert_eq!(u.device_id, "d1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replay_requires_initialization() {
        let bus = EventBus::new();
        assert!(bus.request_active_device_replay().is_err());
        bus.initialize().await.unwrap();
        assert!(bus.is_initialized());
        assert!(bus.request_active_device_replay().is_ok());
    }

    #[tokio::test]
    async fn test_replay_republishes_active_devices() {
        let bus = EventBus::new();
        bus.initialize().await.unwrap();

        bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d1"));
        bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d2"));
        bus.publish_lifecycle("t2", LifecycleKind::Create, DeviceEvent::new("d1"));
        bus.publish_lifecycle("t1", LifecycleKind::Remove, DeviceEvent::new("d2"));
        bus.publish_lifecycle("t1", LifecycleKind::Configure, DeviceEvent::new("d9"));
        assert_eq!(bus.active_device_count(), 2);

        let mut rx = bus.subscribe(&LifecycleKind::ALL);
        bus.request_active_device_replay().unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.kind, LifecycleKind::Create);
        assert_eq!(
            (first.tenant.as_str(), first.event.device_id()),
            ("t1", "d1")
        );
        assert_eq!(
            (second.tenant.as_str(), second.event.device_id()),
            ("t2", "d1")
        );
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_replay_marker_precedes_creates() {
        let bus = EventBus::with_capacity(16);
        bus.initialize().await.unwrap();
        bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d1"));

        let mut all = FilteredReceiver::new(bus.tx.subscribe(), |_: &PlatformEvent| true);
        bus.request_active_device_replay().unwrap();

        let marker = all.recv().await.unwrap();
        assert_eq!(marker.type_name(), "ReplayRequested");
        assert!(all.recv().await.unwrap().is_lifecycle_event());
        assert!(all.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_replay_larger_than_channel_is_not_lost() {
        let bus = EventBus::with_capacity(8);
        bus.initialize().await.unwrap();
        for n in 0..100 {
            bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new(format!("d{n}")));
        }

        let mut rx = bus.subscribe(&LifecycleKind::ALL);
        bus.request_active_device_replay().unwrap();

        let mut replayed = 0;
        while let Some(event) = rx.try_recv() {
            assert_eq!(event.kind, LifecycleKind::Create);
            replayed += 1;
        }
        assert_eq!(replayed, 100);
    }

    #[test]
    fn test_dropped_lifecycle_receiver_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe(&LifecycleKind::ALL);
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert!(!bus.publish_lifecycle("t1", LifecycleKind::Create, DeviceEvent::new("d1")));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_update_attrs_without_subscribers() {
        let bus = EventBus::with_name("upstream");
        assert_eq!(bus.name(), "upstream");
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.update_attrs(update("d1")).is_ok());
    }
}
