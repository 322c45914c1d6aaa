//! End-to-end tests over the in-process fabric.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use weft_client::{
    decode, encode, Broker, ConnectionState, ErrorResponse, Event, MemoryFabric, Message, Reply,
    Request, RequestCallback, Response, ResponseCallback, ServiceRegistration, Transport,
    TransportEvent, WeftClient, WeftConfig, WeftError, SERVICE_REGISTRY_REGISTER_TOPIC,
    SERVICE_REGISTRY_UNREGISTER_TOPIC,
};

fn test_config() -> WeftConfig {
    // Port 1 is closed, so the pre-connect latency probe fails fast.
    WeftConfig::new(vec![Broker::parse("127.0.0.1:1").unwrap()])
        .unwrap()
        .reconnect_delay(Duration::from_millis(1), Duration::from_millis(10))
        .connect_probe_timeout(Duration::from_millis(50))
        .default_request_timeout(Duration::from_secs(5))
}

fn client_on(fabric: &MemoryFabric) -> WeftClient {
    // try_init so the tests can race to install the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    WeftClient::new(test_config(), Arc::new(fabric.transport()))
}

/// Stands in for the fabric's service registry: acknowledges every
/// (un)registration request and records the JSON payloads.
fn spawn_registry_stub(fabric: &MemoryFabric) -> Arc<parking_lot::Mutex<Vec<serde_json::Value>>> {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let transport = fabric.transport();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.set_event_sink(tx);
    let seen_clone = seen.clone();
    tokio::spawn(async move {
        transport.connect("localhost", 8883).await.unwrap();
        transport
            .subscribe(&[
                SERVICE_REGISTRY_REGISTER_TOPIC.to_string(),
                SERVICE_REGISTRY_UNREGISTER_TOPIC.to_string(),
            ])
            .await
            .unwrap();
        while let Some(event) = rx.recv().await {
            if let TransportEvent::Message { payload, .. } = event {
                if let Ok(Message::Request(request)) = decode(&payload) {
                    seen_clone
                        .lock()
                        .push(serde_json::from_slice(&request.header.payload).unwrap());
                    let response = Response::for_request(&request);
                    let raw = encode(&Message::Response(response)).unwrap();
                    transport.publish(&request.reply_to_topic, raw).await.unwrap();
                }
            }
        }
    });
    seen
}

struct EchoService {
    client: WeftClient,
}

#[async_trait]
impl RequestCallback for EchoService {
    async fn on_request(&self, request: Request) {
        let mut response = Response::for_request(&request);
        response.header.payload = request.header.payload.clone();
        self.client.send_response(response).await.unwrap();
    }
}

struct FailingService {
    client: WeftClient,
}

#[async_trait]
impl RequestCallback for FailingService {
    async fn on_request(&self, request: Request) {
        let error = ErrorResponse::for_request(&request, 503, "service unavailable");
        self.client.send_error_response(error).await.unwrap();
    }
}

#[tokio::test]
async fn test_connect_disconnect_lifecycle() {
    let fabric = MemoryFabric::new();
    let client = client_on(&fabric);

    assert_eq!(client.connection_state(), ConnectionState::NotConnected);
    client.connect().await.unwrap();
    assert!(client.is_connected());
    assert!(client.current_broker().is_some());

    client.disconnect().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::NotConnected);
    client.destroy().await;
}

#[tokio::test]
async fn test_event_delivery_with_wildcard() {
    let fabric = MemoryFabric::new();
    let subscriber = client_on(&fabric);
    let publisher = client_on(&fabric);
    subscriber.connect().await.unwrap();
    publisher.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .add_event_callback(
            "/demo/sensor/#",
            Arc::new(move |event: Event| {
                let _ = tx.send(event.header.destination_topic.clone());
            }),
        )
        .await
        .unwrap();

    let mut event = Event::new("/demo/sensor/42/reading");
    event.header.payload = Bytes::from_static(b"21.5");
    publisher.send_event(event).await.unwrap();

    let topic = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "/demo/sensor/42/reading");

    // An event outside the pattern is not delivered.
    publisher
        .send_event(Event::new("/other/topic"))
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    subscriber.destroy().await;
    publisher.destroy().await;
}

#[tokio::test]
async fn test_sync_request_round_trip() {
    let fabric = MemoryFabric::new();
    let host = client_on(&fabric);
    let requester = client_on(&fabric);
    host.connect().await.unwrap();
    requester.connect().await.unwrap();

    let registration = ServiceRegistration::new("/demo/echo").add_topic(
        "/demo/echo/run",
        Arc::new(EchoService {
            client: host.clone(),
        }),
    );
    host.register_service_async(registration).await.unwrap();

    let mut request = Request::new("/demo/echo/run");
    request.header.payload = Bytes::from_static(b"ping");
    let reply = requester.sync_request(request).await.unwrap();

    let response = reply.into_result().unwrap();
    assert_eq!(&response.header.payload[..], b"ping");

    host.destroy().await;
    requester.destroy().await;
}

#[tokio::test]
async fn test_error_reply_surfaces_code_and_message() {
    let fabric = MemoryFabric::new();
    let host = client_on(&fabric);
    let requester = client_on(&fabric);
    host.connect().await.unwrap();
    requester.connect().await.unwrap();

    let registration = ServiceRegistration::new("/demo/failing").add_topic(
        "/demo/failing/run",
        Arc::new(FailingService {
            client: host.clone(),
        }),
    );
    host.register_service_async(registration).await.unwrap();

    let reply = requester
        .sync_request(Request::new("/demo/failing/run"))
        .await
        .unwrap();
    let error = reply.into_result().unwrap_err();
    assert_eq!(error.error_code, 503);
    assert_eq!(error.error_message, "service unavailable");

    host.destroy().await;
    requester.destroy().await;
}

#[tokio::test]
async fn test_sync_request_timeout() {
    let fabric = MemoryFabric::new();
    let client = client_on(&fabric);
    client.connect().await.unwrap();

    let err = client
        .sync_request_with_timeout(
            Request::new("/demo/nobody/home"),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Timeout(_)));

    // The client is still usable afterwards.
    client.send_event(Event::new("/demo/still/alive")).await.unwrap();
    client.destroy().await;
}

#[tokio::test]
async fn test_async_request_with_callback() {
    let fabric = MemoryFabric::new();
    let host = client_on(&fabric);
    let requester = client_on(&fabric);
    host.connect().await.unwrap();
    requester.connect().await.unwrap();

    let registration = ServiceRegistration::new("/demo/echo").add_topic(
        "/demo/echo/run",
        Arc::new(EchoService {
            client: host.clone(),
        }),
    );
    host.register_service_async(registration).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: Arc<dyn ResponseCallback> = Arc::new(move |reply: Reply| {
        let _ = tx.send(reply.request_message_id().to_string());
    });

    let mut request = Request::new("/demo/echo/run");
    request.header.payload = Bytes::from_static(b"async");
    let request_id = requester
        .async_request(request, Some(callback))
        .await
        .unwrap();

    let correlated = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(correlated, request_id);

    host.destroy().await;
    requester.destroy().await;
}

#[tokio::test]
async fn test_send_request_reply_reaches_response_callback() {
    let fabric = MemoryFabric::new();
    let host = client_on(&fabric);
    let requester = client_on(&fabric);
    host.connect().await.unwrap();
    requester.connect().await.unwrap();

    let registration = ServiceRegistration::new("/demo/echo").add_topic(
        "/demo/echo/run",
        Arc::new(EchoService {
            client: host.clone(),
        }),
    );
    host.register_service_async(registration).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: Arc<dyn ResponseCallback> = Arc::new(move |reply: Reply| {
        let _ = tx.send(reply.request_message_id().to_string());
    });
    requester
        .add_response_callback("#", callback)
        .await
        .unwrap();

    // Fire-and-forget: no correlation is registered, so the reply is only
    // visible through the response callback.
    let request = Request::new("/demo/echo/run");
    let request_id = request.header.message_id.clone();
    requester.send_request(request).await.unwrap();

    let seen = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, request_id);

    host.destroy().await;
    requester.destroy().await;
}

#[tokio::test]
async fn test_sync_request_from_callback_is_rejected() {
    let fabric = MemoryFabric::new();
    let client = client_on(&fabric);
    client.connect().await.unwrap();

    struct Reentrant {
        client: WeftClient,
        outcome: mpsc::UnboundedSender<weft_client::Result<Reply>>,
    }

    #[async_trait]
    impl weft_client::EventCallback for Reentrant {
        async fn on_event(&self, _event: Event) {
            let result = self
                .client
                .sync_request_with_timeout(
                    Request::new("/demo/inner"),
                    Duration::from_millis(100),
                )
                .await;
            let _ = self.outcome.send(result);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .add_event_callback(
            "/demo/outer",
            Arc::new(Reentrant {
                client: client.clone(),
                outcome: tx,
            }),
        )
        .await
        .unwrap();

    client.send_event(Event::new("/demo/outer")).await.unwrap();
    let result = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(WeftError::Usage(_))));

    client.destroy().await;
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions_and_delivery() {
    let fabric = MemoryFabric::new();
    let subscriber = client_on(&fabric);
    let publisher = client_on(&fabric);
    subscriber.connect().await.unwrap();
    publisher.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    subscriber
        .add_event_callback(
            "/demo/durable",
            Arc::new(move |event: Event| {
                let _ = tx.send(event.header.destination_topic.clone());
            }),
        )
        .await
        .unwrap();

    // Sever everything; both clients reconnect in the background.
    fabric.drop_all("fabric restarted");
    let mut sub_state = subscriber.state_receiver();
    timeout(
        Duration::from_secs(5),
        sub_state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();
    let mut pub_state = publisher.state_receiver();
    timeout(
        Duration::from_secs(5),
        pub_state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(fabric
        .subscribed_topics()
        .contains(&"/demo/durable".to_string()));

    publisher.send_event(Event::new("/demo/durable")).await.unwrap();
    let topic = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic, "/demo/durable");

    subscriber.destroy().await;
    publisher.destroy().await;
}

#[tokio::test]
async fn test_service_registration_against_registry() {
    let fabric = MemoryFabric::new();
    let seen = spawn_registry_stub(&fabric);
    let client = client_on(&fabric);
    client.connect().await.unwrap();

    let registration = ServiceRegistration::new("/mycompany/echo")
        .ttl(Duration::from_secs(600))
        .metadata("region", "eu-west")
        .add_topic(
            "/mycompany/echo/run",
            Arc::new(EchoService {
                client: client.clone(),
            }),
        );
    let service_id = registration.service_id().to_string();
    client.register_service_sync(registration).await.unwrap();

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["serviceGuid"], service_id.as_str());
        assert_eq!(seen[0]["serviceType"], "/mycompany/echo");
        assert_eq!(seen[0]["ttlMins"], 10);
        assert_eq!(seen[0]["metaData"]["region"], "eu-west");
        assert_eq!(seen[0]["requestChannels"][0], "/mycompany/echo/run");
    }
    assert_eq!(client.registered_services().len(), 1);
    // Hosting subscribes the request topic.
    assert!(fabric
        .subscribed_topics()
        .contains(&"/mycompany/echo/run".to_string()));

    client.unregister_service_sync(&service_id).await.unwrap();
    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1]["serviceGuid"], service_id.as_str());
    }
    assert!(client.registered_services().is_empty());

    client.destroy().await;
}

#[tokio::test]
async fn test_reconnect_reregisters_services() {
    let fabric = MemoryFabric::new();
    let seen = spawn_registry_stub(&fabric);
    let client = client_on(&fabric);
    client.connect().await.unwrap();

    let registration = ServiceRegistration::new("/mycompany/echo").add_topic(
        "/mycompany/echo/run",
        Arc::new(EchoService {
            client: client.clone(),
        }),
    );
    client.register_service_sync(registration).await.unwrap();
    assert_eq!(seen.lock().len(), 1);

    // Registrations survive an explicit disconnect and are replayed by the
    // renewal worker on the next connect.
    client.disconnect().await.unwrap();
    assert_eq!(client.registered_services().len(), 1);
    client.connect().await.unwrap();
    timeout(Duration::from_secs(5), async {
        loop {
            if seen.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    client.destroy().await;
}

#[tokio::test]
async fn test_send_while_disconnected_fails() {
    let fabric = MemoryFabric::new();
    let client = client_on(&fabric);

    let err = client
        .send_event(Event::new("/demo/topic"))
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::NotConnected));

    let err = client
        .sync_request(Request::new("/demo/topic"))
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::NotConnected));

    client.destroy().await;
}

#[tokio::test]
async fn test_subscriptions_tracked_offline_and_applied_on_connect() {
    let fabric = MemoryFabric::new();
    let client = client_on(&fabric);

    client.subscribe("/demo/early").await.unwrap();
    assert_eq!(client.subscriptions(), vec!["/demo/early".to_string()]);
    assert!(fabric.subscribed_topics().is_empty());

    client.connect().await.unwrap();
    assert!(fabric
        .subscribed_topics()
        .contains(&"/demo/early".to_string()));

    client.unsubscribe("/demo/early").await.unwrap();
    assert!(!fabric
        .subscribed_topics()
        .contains(&"/demo/early".to_string()));

    client.destroy().await;
}

#[tokio::test]
async fn test_destroy_rejects_further_use() {
    let fabric = MemoryFabric::new();
    let client = client_on(&fabric);
    client.connect().await.unwrap();
    client.subscribe("/demo/topic").await.unwrap();

    client.destroy().await;
    assert!(fabric.subscribed_topics().is_empty());

    assert!(matches!(
        client.send_event(Event::new("/demo/topic")).await,
        Err(WeftError::Shutdown)
    ));
    assert!(matches!(client.connect().await, Err(WeftError::Shutdown)));

    // Destroy is idempotent.
    client.destroy().await;
}
