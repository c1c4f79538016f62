//! Routing cache.
//!
//! Two indices kept behind one lock:
//! - forward: `attrs` topic -> identities publishing on it (fan-out and
//!   publish authorization)
//! - reverse: identity -> its route (command delivery)
//!
//! Both are always changed inside the same write critical section, so a
//! reader sees either the state before or after an `add`/`remove`, never a
//! mix of the two.

use crate::identity::DeviceIdentity;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteEntry {
    attrs_topic: String,
    config_topic: String,
}

#[derive(Debug, Default)]
struct Indices {
    forward: HashMap<String, Vec<DeviceIdentity>>,
    reverse: HashMap<DeviceIdentity, RouteEntry>,
}

impl Indices {
    /// Drop `identity` from the forward list of `topic`, deleting the list
    /// once empty.
    fn detach(&mut self, topic: &str, identity: &DeviceIdentity) {
        if let Some(identities) = self.forward.get_mut(topic) {
            identities.retain(|cached| cached != identity);
            if identities.is_empty() {
                self.forward.remove(topic);
            }
        }
    }
}

/// Consistent copy of both indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub topics: HashMap<String, Vec<DeviceIdentity>>,
    pub commands: HashMap<DeviceIdentity, String>,
}

/// Bidirectional topic <-> identity index.
#[derive(Debug, Default)]
pub struct RoutingCache {
    inner: RwLock<Indices>,
}

impl RoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` on `attrs_topic` and point its commands at
    /// `config_topic`.
    ///
    /// An identity that is already cached is moved: it leaves its previous
    /// forward list in the same critical section, so it never sits under
    /// two `attrs` topics and duplicate create events do not duplicate
    /// fan-out.
    pub fn add(
        &self,
        attrs_topic: impl Into<String>,
        config_topic: impl Into<String>,
        identity: DeviceIdentity,
    ) {
        let entry = RouteEntry {
            attrs_topic: attrs_topic.into(),
            config_topic: config_topic.into(),
        };

        let mut indices = self.inner.write();
        if let Some(previous) = indices.reverse.remove(&identity) {
            indices.detach(&previous.attrs_topic, &identity);
        }
        indices
            .forward
            .entry(entry.attrs_topic.clone())
            .or_default()
            .push(identity.clone());
        debug!(
            "Routed {} via {} / {}",
            identity, entry.attrs_topic, entry.config_topic
        );
        indices.reverse.insert(identity, entry);
    }

    /// Forget `identity`. Returns whether it was cached.
    ///
    /// Removing an unknown identity is a no-op.
    pub fn remove(&self, identity: &DeviceIdentity) -> bool {
        let mut indices = self.inner.write();
        match indices.reverse.remove(identity) {
            Some(entry) => {
                indices.detach(&entry.attrs_topic, identity);
                debug!("Unrouted {} from {}", identity, entry.attrs_topic);
                true
            }
            None => false,
        }
    }

    /// Identities registered on `topic`, in registration order.
    pub fn lookup_by_topic(&self, topic: &str) -> Option<Vec<DeviceIdentity>> {
        self.inner.read().forward.get(topic).cloned()
    }

    /// Command topic of `identity`.
    pub fn lookup_by_identity(&self, identity: &DeviceIdentity) -> Option<String> {
        self.inner
            .read()
            .reverse
            .get(identity)
            .map(|entry| entry.config_topic.clone())
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.inner.read().forward.contains_key(topic)
    }

    pub fn device_count(&self) -> usize {
        self.inner.read().reverse.len()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.read().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().reverse.is_empty()
    }

    /// Drop every route.
    pub fn clear(&self) {
        let mut indices = self.inner.write();
        indices.forward.clear();
        indices.reverse.clear();
    }

    /// Copy both indices under a single read lock.
    pub fn snapshot(&self) -> CacheSnapshot {
        let indices = self.inner.read();
        CacheSnapshot {
            topics: indices.forward.clone(),
            commands: indices
                .reverse
                .iter()
                .map(|(identity, entry)| (identity.clone(), entry.config_topic.clone()))
                .collect(),
        }
    }
}

impl CacheSnapshot {
    /// Check that every identity sits under exactly one topic and that both
    /// indices describe the same set of identities.
    pub fn is_consistent(&self) -> bool {
        let mut seen: HashMap<&DeviceIdentity, usize> = HashMap::new();
        for identities in self.topics.values() {
            if identities.is_empty() {
                return false;
            }
            for identity in identities {
                *seen.entry(identity).or_default() += 1;
            }
        }
        seen.len() == self.commands.len()
            && seen
                .iter()
                .all(|(identity, count)| *count == 1 && self.commands.contains_key(*identity))
    }
}
