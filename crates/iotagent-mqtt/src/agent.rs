//! The IoT agent.
//!
//! Wires the routing cache between the platform bus and the transport:
//! lifecycle events write the cache from one task, transport callbacks
//! read it to authorize and forward publishes.

use crate::authorizer::PublishAuthorizer;
use crate::cache::RoutingCache;
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};
use crate::forwarder::{ForwardOutcome, MessageForwarder};
use crate::handler::{HandleOutcome, LifecycleHandler};
use crate::transport::{BrokerHooks, InboundPublish, SharedTransport};
use iotagent_core::{Error, LifecycleEvent, LifecycleKind, LifecycleReceiver, Result, SharedPlatformBus};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct IotAgent {
    cache: Arc<RoutingCache>,
    bus: SharedPlatformBus,
    handler: Arc<LifecycleHandler>,
    authorizer: PublishAuthorizer,
    forwarder: MessageForwarder,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
}

impl IotAgent {
    pub fn new(bus: SharedPlatformBus, transport: SharedTransport) -> Self {
        let cache = Arc::new(RoutingCache::new());
        let dispatcher = CommandDispatcher::new(cache.clone(), transport);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            handler: Arc::new(LifecycleHandler::new(cache.clone(), dispatcher)),
            authorizer: PublishAuthorizer::new(cache.clone()),
            forwarder: MessageForwarder::new(cache.clone(), bus.clone()),
            cache,
            bus,
            started: AtomicBool::new(false),
            shutdown_tx,
            lifecycle_task: Mutex::new(None),
        }
    }

    /// Shared routing cache.
    pub fn cache(&self) -> &Arc<RoutingCache> {
        &self.cache
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !*self.shutdown_tx.borrow()
    }

    /// Start the agent.
    ///
    /// Waits for the bus to initialize, subscribes the lifecycle handler and
    /// asks the platform to replay the create events of every active
    /// device. A bus failure is returned as is and leaves the agent
    /// stopped; callers treat it as fatal.
    pub async fn init(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::internal("agent already initialized"));
        }

        if let Err(e) = self.bus.initialize().await {
            error!("Failed to initialize the platform bus: {}", e);
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!("Initializing IoT agent MQTT");

        let receiver = self.bus.subscribe(&LifecycleKind::ALL);
        let task = tokio::spawn(run_lifecycle_loop(
            self.handler.clone(),
            receiver,
            self.shutdown_tx.subscribe(),
        ));
        *self.lifecycle_task.lock() = Some(task);

        // Devices created before the agent started.
        if let Err(e) = self.bus.request_active_device_replay() {
            error!("Failed to request the active device replay: {}", e);
            if let Some(task) = self.lifecycle_task.lock().take() {
                task.abort();
            }
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Stop the lifecycle task and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.lifecycle_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Lifecycle task ended abnormally: {}", e);
            }
        }
        info!("IoT agent MQTT stopped");
    }

    /// Run a device publish through the forwarder.
    pub fn forward(&self, publish: &InboundPublish) -> ForwardOutcome {
        self.forwarder.forward(publish)
    }
}

impl BrokerHooks for IotAgent {
    fn authenticate(&self, client_id: &str) -> bool {
        self.authorizer.authenticate(client_id)
    }

    fn authorize_publish(&self, _client_id: Option<&str>, topic: &str) -> bool {
        self.authorizer.authorize_publish(topic)
    }

    fn authorize_subscribe(&self, _client_id: &str, topic: &str) -> bool {
        self.authorizer.authorize_subscribe(topic)
    }

    fn on_published(&self, publish: InboundPublish) {
        self.forward(&publish);
    }
}

async fn run_lifecycle_loop(
    handler: Arc<LifecycleHandler>,
    mut receiver: LifecycleReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = receiver.recv() => match event {
                Some(event) => process_lifecycle_event(&handler, &event),
                None => {
                    info!("Platform bus closed, lifecycle handling stopped");
                    break;
                }
            }
        }
    }
}

fn process_lifecycle_event(handler: &LifecycleHandler, event: &LifecycleEvent) {
    if let HandleOutcome::Dispatched(DispatchOutcome::Published { topic, completion }) =
        handler.handle(event)
    {
        tokio::spawn(async move {
            match completion.await {
                Ok(()) => debug!("Published message on topic {}", topic),
                Err(e) => warn!("Publish on topic {} failed: {}", topic, e),
            }
        });
    }
}
