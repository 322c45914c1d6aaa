//! Weft Fabric Client
//!
//! A resilient client for the Weft pub/sub fabric, providing event
//! publishing, request/response with reply correlation, callback routing
//! onto a bounded worker pool, broker racing with automatic reconnection,
//! and TTL-renewed service registration.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use weft_client::{Broker, Event, Request, WeftClient, WeftConfig};
//!
//! # async fn demo(transport: Arc<dyn weft_client::Transport>) -> weft_client::Result<()> {
//! let config = WeftConfig::new(vec![Broker::parse("broker.example:8883")?])?;
//! let client = WeftClient::new(config, transport);
//!
//! client.connect().await?;
//!
//! // Subscribe to events; `#` is a trailing wildcard.
//! client
//!     .add_event_callback("/mycompany/sensor/#", Arc::new(|event: weft_client::Event| {
//!         println!("event on {}", event.header.destination_topic);
//!     }))
//!     .await?;
//!
//! // Publish an event.
//! let mut event = Event::new("/mycompany/sensor/42");
//! event.header.payload = b"reading".to_vec().into();
//! client.send_event(event).await?;
//!
//! // Request/response with correlation.
//! let request = Request::new("/mycompany/myservice/lookup");
//! let reply = client.sync_request(request).await?;
//! let response = reply.into_result().map_err(|e| {
//!     weft_client::WeftError::Protocol(e.error_message)
//! })?;
//! println!("{} bytes", response.header.payload.len());
//!
//! client.destroy().await;
//! # Ok(())
//! # }
//! ```

mod broker;
mod client;
mod codec;
mod config;
mod connection;
mod correlator;
mod error;
mod message;
mod pool;
mod router;
mod services;
mod subscriptions;
mod transport;

pub use broker::{Broker, DEFAULT_BROKER_PORT};
pub use client::WeftClient;
pub use codec::{decode, encode};
pub use config::WeftConfig;
pub use connection::{ConnectCallback, ConnectionState};
pub use error::{Result, WeftError};
pub use message::{
    ErrorResponse, Event, Header, Message, MessageType, Reply, Request, Response,
    DEFAULT_MESSAGE_VERSION,
};
pub use router::{
    CallbackId, EventCallback, RequestCallback, ResponseCallback, TOPIC_WILDCARD,
};
pub use services::{
    ServiceRegistration, SERVICE_REGISTRY_REGISTER_TOPIC, SERVICE_REGISTRY_UNREGISTER_TOPIC,
};
pub use transport::{MemoryFabric, MemoryTransport, Transport, TransportEvent};
