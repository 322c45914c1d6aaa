//! Client facade
//!
//! [`WeftClient`] wires the pieces together: the transport feeds a reader
//! task that decodes frames and hands them to the correlator (replies) or
//! the callback router (events and requests); the connection supervisor owns
//! the transport lifecycle; the service registry keeps registrations alive.
//! The client is cheap to clone and safe to share across tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::codec;
use crate::config::WeftConfig;
use crate::connection::{ConnectCallback, ConnectionState, ConnectionSupervisor};
use crate::correlator::RequestCorrelator;
use crate::error::{Result, WeftError};
use crate::message::{ErrorResponse, Event, Message, Reply, Request, Response};
use crate::pool::{current_task_in_pool, WorkerPool};
use crate::router::{
    CallbackCategory, CallbackId, CallbackRouter, EventCallback, RequestCallback,
    ResponseCallback,
};
use crate::services::{
    Registrar, ServiceRegistration, ServiceRegistry, REGISTER_TIMEOUT,
    SERVICE_REGISTRY_REGISTER_TOPIC, SERVICE_REGISTRY_UNREGISTER_TOPIC, UNREGISTER_TIMEOUT,
};
use crate::subscriptions::Subscriptions;
use crate::transport::{Transport, TransportEvent};

/// Topic prefix replies to this client's requests are addressed to.
const CLIENT_REPLY_TOPIC_PREFIX: &str = "/weft/client/";

/// Resilient fabric client: pub/sub, request/response, service hosting.
#[derive(Clone)]
pub struct WeftClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<WeftConfig>,
    pool: Arc<WorkerPool>,
    subscriptions: Arc<Subscriptions>,
    router: Arc<CallbackRouter>,
    correlator: Arc<RequestCorrelator>,
    requester: Arc<Requester>,
    supervisor: Arc<ConnectionSupervisor>,
    services: Arc<ServiceRegistry>,
    /// Request-callback registrations made on behalf of hosted services,
    /// keyed by service id so unregistration can undo them.
    service_callbacks: Mutex<HashMap<String, Vec<(String, CallbackId)>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl WeftClient {
    /// Build a client over `transport`. Nothing touches the network until
    /// [`connect`](Self::connect).
    pub fn new(config: WeftConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let reply_to_topic = format!("{CLIENT_REPLY_TOPIC_PREFIX}{}", config.client_id);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        transport.set_event_sink(event_tx);

        let pool = Arc::new(WorkerPool::new(
            config.incoming_message_queue_size,
            config.incoming_message_thread_pool_size,
        ));
        let subscriptions = Arc::new(Subscriptions::new(transport.clone()));
        let router = Arc::new(CallbackRouter::new(pool.clone(), subscriptions.clone()));
        let correlator = Arc::new(RequestCorrelator::new());
        let requester = Arc::new(Requester {
            transport: transport.clone(),
            correlator: correlator.clone(),
            client_id: config.client_id.clone(),
            reply_to_topic: reply_to_topic.clone(),
        });
        let services = Arc::new(ServiceRegistry::new(Arc::new(ServiceRegistrar {
            requester: requester.clone(),
            transport: transport.clone(),
        })));
        let supervisor = Arc::new(ConnectionSupervisor::new(config.clone(), transport));
        supervisor.add_connect_callback(Arc::new(ReconnectTasks {
            subscriptions: subscriptions.clone(),
            services: services.clone(),
            reply_to_topic,
        }));

        let reader = tokio::spawn(reader_loop(
            event_rx,
            router.clone(),
            correlator.clone(),
            supervisor.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                subscriptions,
                router,
                correlator,
                requester,
                supervisor,
                services,
                service_callbacks: Mutex::new(HashMap::new()),
                reader: Mutex::new(Some(reader)),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &WeftConfig {
        &self.inner.config
    }

    // ---- connection lifecycle ----

    /// Connect to the fastest reachable broker, retrying per the configured
    /// budget. Blocks until connected or the budget is spent.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_live()?;
        self.inner.supervisor.connect().await
    }

    /// Disconnect from the fabric. Registered callbacks, subscriptions, and
    /// services survive and are replayed on the next connect.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_live()?;
        self.inner.supervisor.disconnect().await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }

    /// Watch connection state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.supervisor.state_receiver()
    }

    /// The broker currently connected to, if any.
    pub fn current_broker(&self) -> Option<Broker> {
        self.inner.supervisor.current_broker()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    // ---- messaging ----

    /// Publish an event to its destination topic.
    pub async fn send_event(&self, event: Event) -> Result<()> {
        self.ensure_live()?;
        self.inner.requester.publish(Message::Event(event)).await
    }

    /// Publish a request without tracking its reply. Replies still arrive on
    /// the stamped reply topic and reach any registered response callbacks.
    pub async fn send_request(&self, request: Request) -> Result<()> {
        self.ensure_live()?;
        self.inner
            .requester
            .async_request(request, None)
            .await
            .map(|_| ())
    }

    /// Send a response back to a requester.
    pub async fn send_response(&self, response: Response) -> Result<()> {
        self.ensure_live()?;
        self.inner
            .requester
            .publish(Message::Response(response))
            .await
    }

    /// Send an error response back to a requester.
    pub async fn send_error_response(&self, response: ErrorResponse) -> Result<()> {
        self.ensure_live()?;
        self.inner.requester.publish(Message::Error(response)).await
    }

    /// Send a request and wait for its reply, up to the configured default
    /// request timeout.
    ///
    /// Must not be called from inside a message callback; the reply is
    /// delivered through the same pool the callback occupies, so waiting
    /// there can deadlock. Use [`async_request`](Self::async_request) from
    /// callbacks instead.
    pub async fn sync_request(&self, request: Request) -> Result<Reply> {
        let timeout = self.inner.config.default_request_timeout;
        self.sync_request_with_timeout(request, timeout).await
    }

    /// Send a request and wait up to `timeout` for its reply.
    pub async fn sync_request_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply> {
        self.ensure_live()?;
        self.inner.requester.sync_request(request, timeout).await
    }

    /// Send a request without waiting. When `callback` is given, it runs on
    /// the worker pool when the reply arrives. Returns the request's message
    /// id.
    pub async fn async_request(
        &self,
        request: Request,
        callback: Option<Arc<dyn ResponseCallback>>,
    ) -> Result<String> {
        self.ensure_live()?;
        self.inner.requester.async_request(request, callback).await
    }

    // ---- callbacks ----

    /// Register an event callback and subscribe to `topic` (which may end in
    /// the `#` wildcard).
    pub async fn add_event_callback(
        &self,
        topic: &str,
        callback: Arc<dyn EventCallback>,
    ) -> Result<CallbackId> {
        self.ensure_live()?;
        self.inner.router.add_event_callback(topic, callback, true).await
    }

    /// Register an event callback without subscribing, for topics another
    /// registration already covers.
    pub async fn add_event_callback_no_subscribe(
        &self,
        topic: &str,
        callback: Arc<dyn EventCallback>,
    ) -> Result<CallbackId> {
        self.ensure_live()?;
        self.inner.router.add_event_callback(topic, callback, false).await
    }

    /// Register a request callback. Does not subscribe; hosting a service
    /// through [`register_service_sync`](Self::register_service_sync) is the
    /// usual way request topics get subscribed.
    pub async fn add_request_callback(
        &self,
        topic: &str,
        callback: Arc<dyn RequestCallback>,
    ) -> Result<CallbackId> {
        self.ensure_live()?;
        self.inner.router.add_request_callback(topic, callback, false).await
    }

    /// Register a response callback for replies addressed to `topic`. Does
    /// not subscribe; the client's own reply topic is always subscribed.
    pub async fn add_response_callback(
        &self,
        topic: &str,
        callback: Arc<dyn ResponseCallback>,
    ) -> Result<CallbackId> {
        self.ensure_live()?;
        self.inner.router.add_response_callback(topic, callback, false).await
    }

    pub async fn remove_event_callback(&self, topic: &str, id: CallbackId) -> Result<()> {
        self.inner.router.remove(CallbackCategory::Event, topic, id).await
    }

    pub async fn remove_request_callback(&self, topic: &str, id: CallbackId) -> Result<()> {
        self.inner.router.remove(CallbackCategory::Request, topic, id).await
    }

    pub async fn remove_response_callback(&self, topic: &str, id: CallbackId) -> Result<()> {
        self.inner.router.remove(CallbackCategory::Response, topic, id).await
    }

    // ---- subscriptions ----

    /// Subscribe to a topic. Tracked locally while disconnected and applied
    /// on (re)connect.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.ensure_live()?;
        self.inner.subscriptions.subscribe(topic).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.ensure_live()?;
        self.inner.subscriptions.unsubscribe(topic).await
    }

    /// Topics currently wanted, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.snapshot()
    }

    // ---- services ----

    /// Host a service: register its request callbacks (subscribing to each
    /// request topic) and advertise it to the fabric registry, waiting for
    /// the acknowledgement. The registration is renewed before its TTL
    /// lapses and replayed after reconnects.
    pub async fn register_service_sync(&self, registration: ServiceRegistration) -> Result<()> {
        self.ensure_live()?;
        let registration = Arc::new(registration);
        self.install_service_callbacks(&registration).await?;
        self.inner.services.register_sync(registration).await
    }

    /// Host a service without waiting for the registry's acknowledgement;
    /// the renewal worker sends it when the connection allows.
    pub async fn register_service_async(&self, registration: ServiceRegistration) -> Result<()> {
        self.ensure_live()?;
        let registration = Arc::new(registration);
        self.install_service_callbacks(&registration).await?;
        self.inner.services.register_async(registration);
        Ok(())
    }

    /// Stop hosting a service and tell the registry, waiting for the
    /// acknowledgement.
    pub async fn unregister_service_sync(&self, service_id: &str) -> Result<()> {
        self.ensure_live()?;
        self.remove_service_callbacks(service_id).await;
        self.inner.services.unregister_sync(service_id).await
    }

    /// Stop hosting a service; the registry is told in the background.
    pub async fn unregister_service_async(&self, service_id: &str) -> Result<()> {
        self.ensure_live()?;
        self.remove_service_callbacks(service_id).await;
        self.inner.services.unregister_async(service_id)
    }

    pub fn registered_services(&self) -> Vec<Arc<ServiceRegistration>> {
        self.inner.services.registered_services()
    }

    // ---- teardown ----

    /// Tear the client down: unregister services, drop subscriptions,
    /// disconnect, and stop the worker pool. Idempotent; every call after
    /// the first is a no-op, and all other operations fail afterwards.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("destroying client");
        self.inner.services.destroy().await;
        self.inner.subscriptions.unsubscribe_all().await;
        self.inner.supervisor.shutdown().await;
        self.inner.correlator.clear();
        self.inner.pool.destroy().await;
        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(WeftError::Shutdown);
        }
        Ok(())
    }

    async fn install_service_callbacks(
        &self,
        registration: &Arc<ServiceRegistration>,
    ) -> Result<()> {
        let mut installed = Vec::new();
        for (topic, callback) in registration.callback_entries() {
            let id = self
                .inner
                .router
                .add_request_callback(topic, callback.clone(), true)
                .await?;
            installed.push((topic.clone(), id));
        }
        self.inner
            .service_callbacks
            .lock()
            .insert(registration.service_id().to_string(), installed);
        Ok(())
    }

    async fn remove_service_callbacks(&self, service_id: &str) {
        let installed = self.inner.service_callbacks.lock().remove(service_id);
        for (topic, id) in installed.into_iter().flatten() {
            if let Err(e) = self
                .inner
                .router
                .remove(CallbackCategory::Request, &topic, id)
                .await
            {
                warn!(topic, error = %e, "failed to remove service request callback");
            }
        }
    }
}

/// Stamps, encodes, and publishes outbound messages, and runs the
/// request/reply protocol against the correlator.
struct Requester {
    transport: Arc<dyn Transport>,
    correlator: Arc<RequestCorrelator>,
    client_id: String,
    reply_to_topic: String,
}

impl Requester {
    async fn publish(&self, mut message: Message) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(WeftError::NotConnected);
        }
        {
            let header = message.header_mut();
            if header.source_client_id.is_empty() {
                header.source_client_id = self.client_id.clone();
            }
        }
        let raw = codec::encode(&message)?;
        self.transport
            .publish(&message.header().destination_topic, raw)
            .await
    }

    async fn sync_request(&self, mut request: Request, timeout: Duration) -> Result<Reply> {
        if current_task_in_pool() {
            return Err(WeftError::Usage(
                "sync_request invoked from a message callback would deadlock the \
                 callback pool; use async_request instead"
                    .to_string(),
            ));
        }
        if request.reply_to_topic.is_empty() {
            request.reply_to_topic = self.reply_to_topic.clone();
        }
        let request_id = request.header.message_id.clone();
        // Register before publishing so the reply cannot beat the waiter.
        let rx = self.correlator.register_waiter(&request_id);
        if let Err(e) = self.publish(Message::Request(request)).await {
            self.correlator.unregister(&request_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.correlator.unregister(&request_id);
                Err(WeftError::Shutdown)
            }
            Err(_) => {
                self.correlator.unregister(&request_id);
                Err(WeftError::Timeout(format!(
                    "no reply within {timeout:?} for request {request_id}"
                )))
            }
        }
    }

    async fn async_request(
        &self,
        mut request: Request,
        callback: Option<Arc<dyn ResponseCallback>>,
    ) -> Result<String> {
        if request.reply_to_topic.is_empty() {
            request.reply_to_topic = self.reply_to_topic.clone();
        }
        let request_id = request.header.message_id.clone();
        if let Some(callback) = callback {
            self.correlator.register_callback(&request_id, callback);
        }
        if let Err(e) = self.publish(Message::Request(request)).await {
            self.correlator.unregister(&request_id);
            return Err(e);
        }
        Ok(request_id)
    }
}

/// Replays client state after every (re)connect: the reply-topic
/// subscription, the wanted-topic set, and service registrations.
struct ReconnectTasks {
    subscriptions: Arc<Subscriptions>,
    services: Arc<ServiceRegistry>,
    reply_to_topic: String,
}

#[async_trait]
impl ConnectCallback for ReconnectTasks {
    async fn on_connect(&self) {
        if let Err(e) = self.subscriptions.subscribe(&self.reply_to_topic).await {
            warn!(error = %e, "reply topic subscription failed");
        }
        self.subscriptions.resubscribe_all().await;
        self.services.on_connected();
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPayload<'a> {
    service_type: &'a str,
    meta_data: &'a HashMap<String, String>,
    request_channels: Vec<String>,
    ttl_mins: u64,
    service_guid: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnregisterPayload<'a> {
    service_guid: &'a str,
}

/// Talks to the fabric's service registry over request/response.
struct ServiceRegistrar {
    requester: Arc<Requester>,
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl Registrar for ServiceRegistrar {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let payload = serde_json::to_vec(&RegisterPayload {
            service_type: registration.service_type(),
            meta_data: registration.metadata_map(),
            request_channels: registration.topics(),
            ttl_mins: registration.ttl_minutes(),
            service_guid: registration.service_id(),
        })?;
        let mut request = Request::new(SERVICE_REGISTRY_REGISTER_TOPIC);
        request.header.payload = Bytes::from(payload);
        if !registration.tenant_guids().is_empty() {
            request.header.destination_tenant_guids = registration.tenant_guids().to_vec();
        }
        let reply = self.requester.sync_request(request, REGISTER_TIMEOUT).await?;
        into_registry_result(reply)
    }

    async fn unregister(&self, service_id: &str) -> Result<()> {
        let payload = serde_json::to_vec(&UnregisterPayload {
            service_guid: service_id,
        })?;
        let mut request = Request::new(SERVICE_REGISTRY_UNREGISTER_TOPIC);
        request.header.payload = Bytes::from(payload);
        let reply = self
            .requester
            .sync_request(request, UNREGISTER_TIMEOUT)
            .await?;
        into_registry_result(reply)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

fn into_registry_result(reply: Reply) -> Result<()> {
    match reply.into_result() {
        Ok(_) => Ok(()),
        Err(e) => Err(WeftError::ServiceRegistration {
            code: e.error_code,
            message: e.error_message,
        }),
    }
}

/// Decode inbound frames and fan them out. Replies go through the
/// correlator; correlated async callbacks and all category registrations run
/// on the worker pool, never on this task.
async fn reader_loop(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    router: Arc<CallbackRouter>,
    correlator: Arc<RequestCorrelator>,
    supervisor: Arc<ConnectionSupervisor>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message { topic, payload } => {
                let mut message = match codec::decode(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(topic, error = %e, "dropping undecodable frame");
                        continue;
                    }
                };
                // The wire format does not carry the topic; the transport
                // does.
                message.header_mut().destination_topic = topic;
                match message {
                    Message::Event(event) => router.dispatch_event(event).await,
                    Message::Request(request) => router.dispatch_request(request).await,
                    Message::Response(response) => {
                        deliver_reply(&router, &correlator, Reply::Response(response)).await
                    }
                    Message::Error(error) => {
                        deliver_reply(&router, &correlator, Reply::Error(error)).await
                    }
                }
            }
            TransportEvent::Dropped { reason } => supervisor.notify_dropped(reason),
        }
    }
}

async fn deliver_reply(
    router: &CallbackRouter,
    correlator: &RequestCorrelator,
    reply: Reply,
) {
    if let Some((callback, reply)) = correlator.deliver(reply.clone()) {
        router.dispatch_correlated(callback, reply).await;
    }
    router.dispatch_reply(reply).await;
}
