//! Transport contracts.
//!
//! The pub/sub transport is an external collaborator. It calls into the
//! agent through [`BrokerHooks`] and the agent publishes through
//! [`Transport`].

use iotagent_core::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// MQTT quality of service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Message the agent sends towards a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    /// Fire-and-forget message: qos 0, not retained.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

/// Who handed a publish to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOrigin {
    /// A connected client. The id is unknown when the transport only
    /// observes the message (e.g. a subscriber on a remote broker).
    Client { id: Option<String> },
    /// The broker itself (internal messages, the agent's own publishes).
    Broker,
}

/// Message received from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub origin: PublishOrigin,
}

impl InboundPublish {
    /// Publish from a connected client.
    pub fn from_client(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            origin: PublishOrigin::Client {
                id: Some(client_id.into()),
            },
        }
    }

    /// Client id of the publisher, if attributable and known.
    pub fn client_id(&self) -> Option<&str> {
        match &self.origin {
            PublishOrigin::Client { id } => id.as_deref(),
            PublishOrigin::Broker => None,
        }
    }

    pub fn has_client(&self) -> bool {
        matches!(self.origin, PublishOrigin::Client { .. })
    }
}

/// Completion signal of a publish. Dropping it is fine.
#[derive(Debug)]
pub struct PublishCompletion {
    rx: oneshot::Receiver<Result<()>>,
}

/// Sending half of a [`PublishCompletion`].
#[derive(Debug)]
pub struct PublishCompleter {
    tx: oneshot::Sender<Result<()>>,
}

impl PublishCompletion {
    pub fn channel() -> (PublishCompleter, PublishCompletion) {
        let (tx, rx) = oneshot::channel();
        (PublishCompleter { tx }, PublishCompletion { rx })
    }

    /// Completion that is already resolved.
    pub fn ready(result: Result<()>) -> Self {
        let (completer, completion) = Self::channel();
        completer.complete(result);
        completion
    }
}

impl PublishCompleter {
    pub fn complete(self, result: Result<()>) {
        // The caller is allowed to have dropped the completion.
        let _ = self.tx.send(result);
    }
}

impl Future for PublishCompletion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(Error::transport("publish abandoned by transport")))
        })
    }
}

/// Outbound side of the transport.
pub trait Transport: Send + Sync {
    /// Hand a message to the transport without waiting for delivery.
    fn publish(&self, message: OutboundMessage) -> PublishCompletion;
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn Transport>;

/// Callbacks the transport runs for connections, publishes and subscribes.
pub trait BrokerHooks: Send + Sync {
    /// Connection attempt.
    fn authenticate(&self, client_id: &str) -> bool;

    /// Publish attempt; the message is only accepted when this returns `true`.
    fn authorize_publish(&self, client_id: Option<&str>, topic: &str) -> bool;

    /// Subscribe attempt.
    fn authorize_subscribe(&self, client_id: &str, topic: &str) -> bool;

    /// Accepted publish.
    fn on_published(&self, publish: InboundPublish);
}
