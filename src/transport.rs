//! Transport seam and in-process test fabric
//!
//! The low-level pub/sub transport (TLS, protocol framing, keep-alive) lives
//! behind the [`Transport`] trait. Inbound traffic and connection drops are
//! delivered as [`TransportEvent`]s on a sink the client installs before
//! connecting.
//!
//! [`MemoryFabric`] is an in-process loopback fabric that honors topic
//! subscriptions (including `#` wildcards), records published frames, and can
//! script connect failures and forced drops. Integration tests run entirely
//! against it; embedding consumers can use it as a test double.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, WeftError};
use crate::router::topic_matches;

/// Event delivered by the transport's reader.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An inbound frame arrived on a subscribed topic.
    Message { topic: String, payload: Bytes },
    /// The connection dropped unexpectedly.
    Dropped { reason: String },
}

/// Low-level pub/sub transport the client drives.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Install the sink inbound events are delivered to. Called once by the
    /// client before the first connect.
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>);

    async fn connect(&self, host: &str, port: u16) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[derive(Default)]
struct FabricState {
    endpoints: Vec<Arc<EndpointState>>,
    published: Vec<(String, Bytes)>,
    fail_connects: usize,
    fail_subscription_ops: usize,
}

#[derive(Default)]
struct EndpointState {
    inner: Mutex<EndpointInner>,
}

#[derive(Default)]
struct EndpointInner {
    connected: bool,
    sink: Option<mpsc::UnboundedSender<TransportEvent>>,
    subscriptions: HashSet<String>,
}

/// In-process fabric shared by one or more [`MemoryTransport`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryFabric {
    state: Arc<Mutex<FabricState>>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport endpoint attached to this fabric.
    pub fn transport(&self) -> MemoryTransport {
        let endpoint = Arc::new(EndpointState::default());
        self.state.lock().endpoints.push(endpoint.clone());
        MemoryTransport {
            fabric: self.state.clone(),
            endpoint,
        }
    }

    /// Snapshot of every frame published through this fabric.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.state.lock().published.clone()
    }

    /// Topics any connected endpoint is currently subscribed to.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut topics: Vec<String> = state
            .endpoints
            .iter()
            .flat_map(|e| e.inner.lock().subscriptions.iter().cloned().collect::<Vec<_>>())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Make the next `n` transport connects fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Make the next `n` subscribe/unsubscribe calls fail.
    pub fn fail_next_subscription_ops(&self, n: usize) {
        self.state.lock().fail_subscription_ops = n;
    }

    /// Inject an inbound frame to every subscriber of `topic`.
    pub fn deliver(&self, topic: &str, payload: Bytes) {
        deliver_to_subscribers(&self.state, topic, payload);
    }

    /// Sever every connected endpoint, emitting a `Dropped` event.
    pub fn drop_all(&self, reason: &str) {
        let endpoints = self.state.lock().endpoints.clone();
        for endpoint in endpoints {
            let mut inner = endpoint.inner.lock();
            if inner.connected {
                inner.connected = false;
                if let Some(sink) = &inner.sink {
                    let _ = sink.send(TransportEvent::Dropped {
                        reason: reason.to_string(),
                    });
                }
            }
        }
    }
}

fn deliver_to_subscribers(state: &Arc<Mutex<FabricState>>, topic: &str, payload: Bytes) {
    let endpoints = state.lock().endpoints.clone();
    for endpoint in endpoints {
        let inner = endpoint.inner.lock();
        if !inner.connected {
            continue;
        }
        let wants = inner
            .subscriptions
            .iter()
            .any(|pattern| topic_matches(pattern, topic));
        if wants {
            if let Some(sink) = &inner.sink {
                let _ = sink.send(TransportEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }
}

/// One client endpoint on a [`MemoryFabric`].
pub struct MemoryTransport {
    fabric: Arc<Mutex<FabricState>>,
    endpoint: Arc<EndpointState>,
}

impl MemoryTransport {
    fn take_scripted_subscription_failure(&self) -> Result<()> {
        let mut fabric = self.fabric.lock();
        if fabric.fail_subscription_ops > 0 {
            fabric.fail_subscription_ops -= 1;
            return Err(WeftError::Transport(
                "scripted subscription failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<TransportEvent>) {
        self.endpoint.inner.lock().sink = Some(sink);
    }

    async fn connect(&self, _host: &str, _port: u16) -> Result<()> {
        {
            let mut fabric = self.fabric.lock();
            if fabric.fail_connects > 0 {
                fabric.fail_connects -= 1;
                return Err(WeftError::Transport(
                    "scripted connect failure".to_string(),
                ));
            }
        }
        self.endpoint.inner.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.endpoint.inner.lock().connected = false;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(WeftError::NotConnected);
        }
        self.fabric
            .lock()
            .published
            .push((topic.to_string(), payload.clone()));
        deliver_to_subscribers(&self.fabric, topic, payload);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        if !self.is_connected() {
            return Err(WeftError::NotConnected);
        }
        self.take_scripted_subscription_failure()?;
        let mut inner = self.endpoint.inner.lock();
        for topic in topics {
            inner.subscriptions.insert(topic.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        if !self.is_connected() {
            return Err(WeftError::NotConnected);
        }
        self.take_scripted_subscription_failure()?;
        let mut inner = self.endpoint.inner.lock();
        for topic in topics {
            inner.subscriptions.remove(topic);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.endpoint.inner.lock().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let fabric = MemoryFabric::new();
        let transport = fabric.transport();
        let err = transport
            .publish("t", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::NotConnected));
    }

    #[tokio::test]
    async fn test_loopback_delivery_honors_subscriptions() {
        let fabric = MemoryFabric::new();
        let transport = fabric.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sink(tx);
        transport.connect("localhost", 8883).await.unwrap();
        transport
            .subscribe(&["alpha/#".to_string()])
            .await
            .unwrap();

        transport
            .publish("alpha/one", Bytes::from_static(b"hit"))
            .await
            .unwrap();
        transport
            .publish("beta/one", Bytes::from_static(b"miss"))
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            TransportEvent::Message { topic, payload } => {
                assert_eq!(topic, "alpha/one");
                assert_eq!(payload, Bytes::from_static(b"hit"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(fabric.published().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let fabric = MemoryFabric::new();
        let transport = fabric.transport();
        fabric.fail_next_connects(1);

        assert!(transport.connect("localhost", 8883).await.is_err());
        assert!(!transport.is_connected());
        assert!(transport.connect("localhost", 8883).await.is_ok());
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_drop_all_emits_dropped_event() {
        let fabric = MemoryFabric::new();
        let transport = fabric.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_event_sink(tx);
        transport.connect("localhost", 8883).await.unwrap();

        fabric.drop_all("broker restarted");
        assert!(!transport.is_connected());
        match rx.try_recv().unwrap() {
            TransportEvent::Dropped { reason } => assert_eq!(reason, "broker restarted"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_two_endpoints_share_the_fabric() {
        let fabric = MemoryFabric::new();
        let publisher = fabric.transport();
        let subscriber = fabric.transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber.set_event_sink(tx);

        publisher.connect("localhost", 8883).await.unwrap();
        subscriber.connect("localhost", 8883).await.unwrap();
        subscriber.subscribe(&["t".to_string()]).await.unwrap();

        publisher
            .publish("t", Bytes::from_static(b"cross"))
            .await
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransportEvent::Message { .. }
        ));
    }
}
