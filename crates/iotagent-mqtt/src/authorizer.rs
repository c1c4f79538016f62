//! Publish authorization.
//!
//! Access control lives at the topic layer only: any client may connect
//! and subscribe, but a publish is accepted only on a topic some cached
//! device is registered on.

use crate::cache::RoutingCache;
use std::sync::Arc;
use tracing::debug;

pub struct PublishAuthorizer {
    cache: Arc<RoutingCache>,
}

impl PublishAuthorizer {
    pub fn new(cache: Arc<RoutingCache>) -> Self {
        Self { cache }
    }

    /// Every connection is accepted.
    pub fn authenticate(&self, _client_id: &str) -> bool {
        true
    }

    pub fn authorize_publish(&self, topic: &str) -> bool {
        let allowed = self.cache.contains_topic(topic);
        if allowed {
            debug!("Authorized to publish to topic {}", topic);
        } else {
            debug!("Not authorized to publish to topic {}", topic);
        }
        allowed
    }

    /// Subscriptions are not identity-scoped.
    pub fn authorize_subscribe(&self, _topic: &str) -> bool {
        true
    }
}
