//! MQTT client transport.
//!
//! Attaches the agent to an existing broker: the client subscribes to the
//! device telemetry filter, runs every incoming publish through the
//! [`BrokerHooks`] gate (authorize, then forward) and publishes commands
//! without waiting for delivery.
//!
//! ## Topic filter
//!
//! Both topic shapes start with an empty level, so one filter covers them:
//!
//! ```text
//! /+/+/attrs   matches   /_dojot/<sn>/attrs   and   /<tenant>/<device>/attrs
//! ```
//!
//! Connection and subscribe hooks are not consulted here: a client on a
//! remote broker cannot see other clients connect.

use crate::transport::{
    BrokerHooks, InboundPublish, OutboundMessage, PublishCompletion, PublishOrigin, QoS, Transport,
};
use iotagent_core::AgentConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Subscription covering every device telemetry topic.
pub const DEVICE_ATTRS_FILTER: &str = "/+/+/attrs";

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT transport error type
#[derive(Debug, Error)]
pub enum MqttTransportError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] iotagent_core::Error),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

impl From<MqttTransportError> for iotagent_core::Error {
    fn from(e: MqttTransportError) -> Self {
        match e {
            MqttTransportError::Config(e) => e,
            MqttTransportError::Client(e) => iotagent_core::Error::Transport(e.to_string()),
        }
    }
}

/// Outbound half: implements [`Transport`].
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

/// Inbound half: owns the event loop until [`MqttDriver::spawn`].
pub struct MqttDriver {
    client: AsyncClient,
    eventloop: EventLoop,
    broker_addr: String,
}

impl MqttTransport {
    /// Build the client. Nothing touches the network until the driver runs.
    pub fn new(config: &AgentConfig) -> Result<(Self, MqttDriver), MqttTransportError> {
        config.validate()?;

        let mut options = MqttOptions::new(&config.client_id, &config.mqtt_host, config.mqtt_port);
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let driver = MqttDriver {
            client: client.clone(),
            eventloop,
            broker_addr: config.broker_addr(),
        };
        Ok((Self { client }, driver))
    }
}

impl Transport for MqttTransport {
    fn publish(&self, message: OutboundMessage) -> PublishCompletion {
        let result = self
            .client
            .try_publish(
                message.topic,
                to_mqtt_qos(message.qos),
                message.retain,
                message.payload,
            )
            .map_err(|e| MqttTransportError::Client(e).into());
        PublishCompletion::ready(result)
    }
}

impl MqttDriver {
    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

    /// Poll the connection on a background task until `shutdown` flips.
    pub fn spawn(
        self,
        hooks: Arc<dyn BrokerHooks>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(hooks, shutdown))
    }

    async fn run(mut self, hooks: Arc<dyn BrokerHooks>, mut shutdown: watch::Receiver<bool>) {
        info!("Connecting to MQTT broker {}", self.broker_addr);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                polled = self.eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT broker {} connection acknowledged", self.broker_addr);
                        // Clean sessions drop subscriptions on every reconnect.
                        if let Err(e) = self
                            .client
                            .try_subscribe(DEVICE_ATTRS_FILTER, rumqttc::QoS::AtMostOnce)
                        {
                            error!("Failed to subscribe to {}: {}", DEVICE_ATTRS_FILTER, e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_incoming(hooks.as_ref(), publish);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT broker {} error: {}", self.broker_addr, e);
                        tokio::select! {
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not sent: {}", e);
        }
        info!("MQTT broker {} connection closed", self.broker_addr);
    }
}

/// Gate and forward one publish seen on the broker.
fn handle_incoming(hooks: &dyn BrokerHooks, publish: rumqttc::Publish) {
    if !hooks.authorize_publish(None, &publish.topic) {
        return;
    }
    hooks.on_published(InboundPublish {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
        origin: PublishOrigin::Client { id: None },
    });
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct GateOnly {
        allowed: Vec<String>,
        seen: Mutex<Vec<InboundPublish>>,
    }

    impl BrokerHooks for GateOnly {
        fn authenticate(&self, _client_id: &str) -> bool {
            true
        }

        fn authorize_publish(&self, _client_id: Option<&str>, topic: &str) -> bool {
            self.allowed.iter().any(|t| t == topic)
        }

        fn authorize_subscribe(&self, _client_id: &str, _topic: &str) -> bool {
            true
        }

        fn on_published(&self, publish: InboundPublish) {
            self.seen.lock().push(publish);
        }
    }

    #[test]
    fn test_incoming_publish_is_gated() {
        let hooks = GateOnly {
            allowed: vec!["/t1/d1/attrs".to_string()],
            ..Default::default()
        };

        handle_incoming(
            &hooks,
            rumqttc::Publish::new("/t1/d1/attrs", rumqttc::QoS::AtMostOnce, br#"{"a":1}"#.to_vec()),
        );
        handle_incoming(
            &hooks,
            rumqttc::Publish::new("/t1/d2/attrs", rumqttc::QoS::AtMostOnce, b"{}".to_vec()),
        );

        let seen = hooks.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].topic, "/t1/d1/attrs");
        assert_eq!(seen[0].payload, br#"{"a":1}"#.to_vec());
        assert!(seen[0].has_client());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_mqtt_qos(QoS::AtMostOnce), rumqttc::QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(QoS::ExactlyOnce), rumqttc::QoS::ExactlyOnce);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = AgentConfig::default().with_port(0);
        assert!(matches!(
            MqttTransport::new(&config),
            Err(MqttTransportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reconnect_delay() {
        // Nothing listens on port 1, so every poll fails and the driver backs off.
        let config = AgentConfig::default().with_host("127.0.0.1").with_port(1);
        let (_transport, driver) = MqttTransport::new(&config).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = driver.spawn(Arc::new(GateOnly::default()), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let stopped = tokio::time::timeout(RECONNECT_DELAY / 2, task).await;
        assert!(stopped.is_ok(), "driver kept sleeping after shutdown");
    }

    #[tokio::test]
    async fn test_publish_is_queued_without_connection() {
        let (transport, driver) = MqttTransport::new(&AgentConfig::default()).unwrap();
        assert_eq!(driver.broker_addr(), "localhost:1883");

        // The request channel buffers until the event loop runs.
        let completion = transport.publish(OutboundMessage::new("/t1/d1/config", "{}"));
        assert!(completion.await.is_ok());
    }
}
