//! Cluster-controller runtime: wires the transports, the router and the
//! publication manager together.
//!
//! The runtime pumps [`UdsServerEvent`]s into the router, consumes
//! subscription-control traffic addressed to locally registered providers,
//! and exposes registration entry points for providers, local message
//! listeners and remote hops. Outbound publications and replies travel back
//! through the router like any other message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::error::{FailureCallback, JoynrError};
use crate::message::{ImmutableMessage, MessageType, MutableMessage};
use crate::mqtt::{MqttConnection, MqttSender};
use crate::pubsub::manager::{PublicationManager, PublicationSender, RequestCaller};
use crate::pubsub::requests::{
    SubscriptionControl, SubscriptionPublication, SubscriptionReply, SubscriptionStop,
};
use crate::routing::router::{MessageRouter, MessagingStub, StubFactory};
use crate::scheduler::DelayedScheduler;
use crate::settings::Settings;
use crate::uds::server::{UdsSenderHandle, UdsServer, UdsServerEvent};

/// In-process participant receiving routed messages.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: Arc<ImmutableMessage>);
}

/// Delivers in-process traffic by recipient participant id.
#[derive(Default)]
pub struct LocalDispatcher {
    listeners: Mutex<HashMap<String, Arc<dyn MessageListener>>>,
}

impl std::fmt::Debug for LocalDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDispatcher")
            .field("listeners", &self.listeners.lock().expect("listeners lock").len())
            .finish()
    }
}

impl LocalDispatcher {
    pub fn register(&self, participant_id: &str, listener: Arc<dyn MessageListener>) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .insert(participant_id.to_owned(), listener);
    }

    pub fn unregister(&self, participant_id: &str) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .remove(participant_id);
    }
}

impl MessagingStub for LocalDispatcher {
    fn transmit(&self, message: &Arc<ImmutableMessage>, on_failure: FailureCallback) {
        let listener = self
            .listeners
            .lock()
            .expect("listeners lock")
            .get(message.recipient())
            .cloned();
        match listener {
            Some(listener) => listener.on_message(Arc::clone(message)),
            None => on_failure(JoynrError::FatalTransport(format!(
                "no local listener for {}",
                message.recipient()
            ))),
        }
    }
}

struct UdsStub {
    handle: UdsSenderHandle,
}

impl MessagingStub for UdsStub {
    fn transmit(&self, message: &Arc<ImmutableMessage>, on_failure: FailureCallback) {
        match message.serialize() {
            Ok(raw) => self.handle.send(raw, on_failure),
            Err(error) => on_failure(error),
        }
    }
}

/// Stub factory over the runtime's live transports.
pub struct CcStubFactory {
    dispatcher: Arc<LocalDispatcher>,
    uds_senders: Mutex<HashMap<String, UdsSenderHandle>>,
    mqtt: Mutex<Option<Arc<dyn MqttConnection>>>,
}

impl std::fmt::Debug for CcStubFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CcStubFactory")
            .field(
                "uds_senders",
                &self.uds_senders.lock().expect("senders lock").len(),
            )
            .finish()
    }
}

impl CcStubFactory {
    pub fn new(dispatcher: Arc<LocalDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            uds_senders: Mutex::new(HashMap::new()),
            mqtt: Mutex::new(None),
        })
    }

    pub fn register_uds_sender(&self, client_id: &str, sender: UdsSenderHandle) {
        self.uds_senders
            .lock()
            .expect("senders lock")
            .insert(client_id.to_owned(), sender);
    }

    pub fn unregister_uds_sender(&self, client_id: &str) {
        self.uds_senders
            .lock()
            .expect("senders lock")
            .remove(client_id);
    }

    /// Attach the external MQTT connection once it is available.
    pub fn set_mqtt_connection(&self, connection: Arc<dyn MqttConnection>) {
        *self.mqtt.lock().expect("mqtt lock") = Some(connection);
    }
}

impl StubFactory for CcStubFactory {
    fn create(&self, address: &Address) -> Option<Arc<dyn MessagingStub>> {
        match address {
            Address::InProcess => {
                Some(Arc::clone(&self.dispatcher) as Arc<dyn MessagingStub>)
            }
            Address::UdsClient { id } => self
                .uds_senders
                .lock()
                .expect("senders lock")
                .get(id)
                .map(|handle| {
                    Arc::new(UdsStub {
                        handle: handle.clone(),
                    }) as Arc<dyn MessagingStub>
                }),
            Address::Mqtt { .. } | Address::MulticastTopic { .. } => {
                let connection = self.mqtt.lock().expect("mqtt lock").clone()?;
                MqttSender::for_address(connection, address, 1)
                    .map(|sender| Arc::new(sender) as Arc<dyn MessagingStub>)
            }
        }
    }
}

/// Publication sender that routes replies and publications like any other
/// outbound message.
struct RouterPublicationSender {
    router: Arc<MessageRouter>,
}

impl RouterPublicationSender {
    fn send(
        &self,
        message_type: MessageType,
        from: &str,
        to: &str,
        ttl_ms: i64,
        payload: Vec<u8>,
    ) {
        let mut builder = MutableMessage::new();
        builder
            .set_sender(from)
            .set_recipient(to)
            .set_type(message_type)
            .set_ttl_ms(ttl_ms)
            .set_payload(payload);
        match builder.immutable() {
            Ok(message) => self.router.route(message),
            Err(error) => log::error!("[Runtime] building outbound {message_type:?} failed: {error}"),
        }
    }
}

impl PublicationSender for RouterPublicationSender {
    fn send_subscription_publication(
        &self,
        from_participant_id: &str,
        to_participant_id: &str,
        ttl_ms: i64,
        publication: SubscriptionPublication,
    ) {
        match serde_json::to_vec(&publication) {
            Ok(payload) => self.send(
                MessageType::SubscriptionPublication,
                from_participant_id,
                to_participant_id,
                ttl_ms,
                payload,
            ),
            Err(error) => log::error!("[Runtime] serializing publication failed: {error}"),
        }
    }

    fn send_subscription_reply(
        &self,
        from_participant_id: &str,
        to_participant_id: &str,
        ttl_ms: i64,
        reply: SubscriptionReply,
    ) {
        match serde_json::to_vec(&reply) {
            Ok(payload) => self.send(
                MessageType::SubscriptionReply,
                from_participant_id,
                to_participant_id,
                ttl_ms,
                payload,
            ),
            Err(error) => log::error!("[Runtime] serializing reply failed: {error}"),
        }
    }
}

/// Everything a running cluster controller owns.
pub struct ClusterControllerRuntime {
    router: Arc<MessageRouter>,
    publication_manager: Arc<PublicationManager>,
    scheduler: Arc<DelayedScheduler>,
    stub_factory: Arc<CcStubFactory>,
    dispatcher: Arc<LocalDispatcher>,
    server: UdsServer,
    providers: Mutex<HashMap<String, Arc<dyn RequestCaller>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClusterControllerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterControllerRuntime")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

impl ClusterControllerRuntime {
    /// Build and start the runtime. Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the UDS server cannot be started or the
    /// persistence backend is unreadable.
    pub fn start(settings: &Settings) -> Result<Arc<Self>, JoynrError> {
        let scheduler = Arc::new(DelayedScheduler::thread_pool(
            tokio::runtime::Handle::current(),
            Duration::from_millis(settings.messaging.send_msg_retry_interval_ms),
        ));
        let dispatcher = Arc::new(LocalDispatcher::default());
        let stub_factory = CcStubFactory::new(Arc::clone(&dispatcher));
        let router = MessageRouter::new(
            Arc::clone(&stub_factory) as Arc<dyn StubFactory>,
            Arc::clone(&scheduler),
            settings.messaging.message_queue_limit,
            Duration::from_millis(settings.messaging.send_msg_retry_interval_ms),
        );
        let persistence = match crate::persistence::FileStore::open(
            settings
                .messaging
                .subscription_request_persistence_filename
                .clone(),
        ) {
            Ok(store) => Some(Arc::new(store) as Arc<dyn crate::persistence::KeyValueStore>),
            Err(error) => {
                log::warn!("[Runtime] subscription persistence unavailable: {error}");
                None
            }
        };
        let publication_manager = PublicationManager::new(
            Arc::clone(&scheduler),
            settings.messaging.ttl_uplift_ms,
            persistence,
        );

        let (server, events) = UdsServer::start(&settings.uds)?;

        let runtime = Arc::new(Self {
            router,
            publication_manager,
            scheduler,
            stub_factory,
            dispatcher,
            server,
            providers: Mutex::new(HashMap::new()),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(Self::pump_events(Arc::clone(&runtime), events));
        *runtime.pump.lock().expect("pump lock") = Some(pump);
        Ok(runtime)
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn publication_manager(&self) -> &Arc<PublicationManager> {
        &self.publication_manager
    }

    pub fn stub_factory(&self) -> &Arc<CcStubFactory> {
        &self.stub_factory
    }

    /// Register an in-process provider: its request caller feeds attribute
    /// publications, and its participant id becomes a local next hop.
    pub fn register_provider(
        self: &Arc<Self>,
        participant_id: &str,
        caller: Arc<dyn RequestCaller>,
    ) {
        self.providers
            .lock()
            .expect("providers lock")
            .insert(participant_id.to_owned(), caller);
        self.router
            .add_next_hop(participant_id, Address::InProcess, false);
    }

    /// Remove a provider and cascade its subscriptions away.
    pub fn unregister_provider(&self, participant_id: &str) {
        self.providers
            .lock()
            .expect("providers lock")
            .remove(participant_id);
        self.publication_manager
            .remove_all_subscriptions(participant_id);
        self.router.remove_next_hop(participant_id);
    }

    /// Register an in-process message listener (e.g. a proxy endpoint).
    pub fn register_message_listener(
        self: &Arc<Self>,
        participant_id: &str,
        listener: Arc<dyn MessageListener>,
    ) {
        self.dispatcher.register(participant_id, listener);
        self.router
            .add_next_hop(participant_id, Address::InProcess, false);
    }

    /// Stop the transports, the publication manager and the schedulers.
    pub async fn shutdown(&self) {
        self.server.shutdown().await;
        if let Some(pump) = self.pump.lock().expect("pump lock").take() {
            pump.abort();
            let _ = pump.await;
        }
        self.publication_manager.shutdown();
        self.scheduler.shutdown();
    }

    async fn pump_events(
        runtime: Arc<Self>,
        mut events: UnboundedReceiver<UdsServerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                UdsServerEvent::Connected {
                    address,
                    sender,
                    username,
                } => {
                    if let Address::UdsClient { id } = &address {
                        log::info!("[Runtime] client {id} connected (user {username})");
                        runtime.stub_factory.register_uds_sender(id, sender);
                        // The client itself is addressable under its own id.
                        runtime.router.add_next_hop(id, address.clone(), false);
                    }
                }
                UdsServerEvent::Disconnected { address } => {
                    if let Address::UdsClient { id } = &address {
                        log::info!("[Runtime] client {id} disconnected");
                        runtime.stub_factory.unregister_uds_sender(id);
                        runtime.router.remove_next_hop(id);
                    }
                }
                UdsServerEvent::Received { message, .. } => {
                    match ImmutableMessage::deserialize(&message) {
                        Ok(message) => runtime.on_message(Arc::new(message)),
                        Err(error) => {
                            log::error!("[Runtime] dropping unparseable message: {error}");
                        }
                    }
                }
            }
        }
    }

    /// Inbound message dispatch: subscription control addressed to a local
    /// provider is consumed here, everything else goes through the router.
    fn on_message(self: &Arc<Self>, message: Arc<ImmutableMessage>) {
        match message.message_type() {
            MessageType::SubscriptionRequest => {
                let caller = self
                    .providers
                    .lock()
                    .expect("providers lock")
                    .get(message.recipient())
                    .cloned();
                if let Some(caller) = caller {
                    self.handle_subscription_request(&message, caller);
                    return;
                }
                self.router.route(message);
            }
            MessageType::SubscriptionStop => {
                let is_local = self
                    .providers
                    .lock()
                    .expect("providers lock")
                    .contains_key(message.recipient());
                if is_local {
                    match serde_json::from_slice::<SubscriptionStop>(&message.payload()) {
                        Ok(stop) => {
                            self.publication_manager
                                .stop_subscription(&stop.subscription_id);
                        }
                        Err(error) => {
                            log::error!("[Runtime] bad subscription stop payload: {error}");
                        }
                    }
                    return;
                }
                self.router.route(message);
            }
            _ => self.router.route(message),
        }
    }

    fn handle_subscription_request(
        self: &Arc<Self>,
        message: &Arc<ImmutableMessage>,
        caller: Arc<dyn RequestCaller>,
    ) {
        let control = match serde_json::from_slice::<SubscriptionControl>(&message.payload()) {
            Ok(control) => control,
            Err(error) => {
                log::error!("[Runtime] bad subscription request payload: {error}");
                return;
            }
        };
        let sender = Arc::new(RouterPublicationSender {
            router: Arc::clone(&self.router),
        }) as Arc<dyn PublicationSender>;
        let proxy = message.sender();
        let provider = message.recipient();

        match control {
            SubscriptionControl::Attribute(request) => {
                self.publication_manager.add_attribute_subscription(
                    proxy, provider, caller, request, sender,
                );
            }
            SubscriptionControl::Broadcast(request) => {
                self.publication_manager
                    .add_broadcast_subscription(proxy, provider, request, sender);
            }
            SubscriptionControl::Multicast(request) => {
                self.router.add_multicast_receiver(
                    provider,
                    &request.subscribe_to_name,
                    request.partitions.clone(),
                    proxy,
                );
                self.publication_manager
                    .add_multicast_subscription(proxy, provider, request, sender);
            }
        }
    }
}
