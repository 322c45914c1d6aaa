//! Topic-indexed callback registration and dispatch
//!
//! Callbacks are registered per message category (event, request, response)
//! under an exact topic or a wildcard pattern ending in `#`. Dispatch never
//! runs a callback inline on the thread that received the network message;
//! every matching callback becomes an independent task on the bounded worker
//! pool, so a slow or reentrant subscriber cannot stall message reception.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::message::{Event, Reply, Request};
use crate::pool::WorkerPool;
use crate::subscriptions::Subscriptions;

/// Wildcard marker: a pattern ending in `#` matches every topic that starts
/// with the pattern's prefix.
pub const TOPIC_WILDCARD: char = '#';

/// True when `pattern` covers `topic`, either exactly or via a trailing `#`.
pub(crate) fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(TOPIC_WILDCARD) {
        return topic.starts_with(prefix);
    }
    false
}

/// Callback invoked for each event delivered on a matching topic.
#[async_trait::async_trait]
pub trait EventCallback: Send + Sync {
    async fn on_event(&self, event: Event);
}

/// Callback invoked for each service request delivered on a matching topic.
#[async_trait::async_trait]
pub trait RequestCallback: Send + Sync {
    async fn on_request(&self, request: Request);
}

/// Callback invoked for each reply delivered on a matching topic, or for an
/// async request's correlated reply.
#[async_trait::async_trait]
pub trait ResponseCallback: Send + Sync {
    async fn on_response(&self, reply: Reply);
}

// Bare closures adapt to the callback interfaces.
#[async_trait::async_trait]
impl<F> EventCallback for F
where
    F: Fn(Event) + Send + Sync,
{
    async fn on_event(&self, event: Event) {
        self(event)
    }
}

#[async_trait::async_trait]
impl<F> RequestCallback for F
where
    F: Fn(Request) + Send + Sync,
{
    async fn on_request(&self, request: Request) {
        self(request)
    }
}

#[async_trait::async_trait]
impl<F> ResponseCallback for F
where
    F: Fn(Reply) + Send + Sync,
{
    async fn on_response(&self, reply: Reply) {
        self(reply)
    }
}

/// Message category a registration listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackCategory {
    Event,
    Request,
    Response,
}

enum Callback {
    Event(Arc<dyn EventCallback>),
    Request(Arc<dyn RequestCallback>),
    Response(Arc<dyn ResponseCallback>),
}

impl Callback {
    fn category(&self) -> CallbackCategory {
        match self {
            Callback::Event(_) => CallbackCategory::Event,
            Callback::Request(_) => CallbackCategory::Request,
            Callback::Response(_) => CallbackCategory::Response,
        }
    }
}

/// Handle returned from registration, used to remove the callback later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(Uuid);

struct Registration {
    id: CallbackId,
    callback: Callback,
    subscribe: bool,
}

/// Registration table plus dispatch onto the worker pool.
pub(crate) struct CallbackRouter {
    table: Mutex<HashMap<CallbackCategory, HashMap<String, Vec<Registration>>>>,
    pool: Arc<WorkerPool>,
    subscriptions: Arc<Subscriptions>,
}

impl CallbackRouter {
    pub(crate) fn new(pool: Arc<WorkerPool>, subscriptions: Arc<Subscriptions>) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            pool,
            subscriptions,
        }
    }

    pub(crate) async fn add_event_callback(
        &self,
        topic: &str,
        callback: Arc<dyn EventCallback>,
        subscribe: bool,
    ) -> Result<CallbackId> {
        self.add(topic, Callback::Event(callback), subscribe).await
    }

    pub(crate) async fn add_request_callback(
        &self,
        topic: &str,
        callback: Arc<dyn RequestCallback>,
        subscribe: bool,
    ) -> Result<CallbackId> {
        self.add(topic, Callback::Request(callback), subscribe).await
    }

    pub(crate) async fn add_response_callback(
        &self,
        topic: &str,
        callback: Arc<dyn ResponseCallback>,
        subscribe: bool,
    ) -> Result<CallbackId> {
        self.add(topic, Callback::Response(callback), subscribe).await
    }

    async fn add(&self, topic: &str, callback: Callback, subscribe: bool) -> Result<CallbackId> {
        let id = CallbackId(Uuid::new_v4());
        let category = callback.category();
        {
            let mut table = self.table.lock();
            table
                .entry(category)
                .or_default()
                .entry(topic.to_string())
                .or_default()
                .push(Registration {
                    id,
                    callback,
                    subscribe,
                });
        }
        if subscribe {
            self.subscriptions.subscribe(topic).await?;
        }
        Ok(id)
    }

    /// Remove a registration. The transport unsubscribe only happens when no
    /// surviving registration under the topic still wants a subscription.
    pub(crate) async fn remove(
        &self,
        category: CallbackCategory,
        topic: &str,
        id: CallbackId,
    ) -> Result<()> {
        let unsubscribe = {
            let mut table = self.table.lock();
            let mut removed = false;
            if let Some(by_topic) = table.get_mut(&category) {
                if let Some(registrations) = by_topic.get_mut(topic) {
                    let before = registrations.len();
                    registrations.retain(|r| r.id != id);
                    removed = registrations.len() != before;
                    if registrations.is_empty() {
                        by_topic.remove(topic);
                    }
                }
            }
            removed && !Self::topic_wanted(&table, topic)
        };
        if unsubscribe {
            self.subscriptions.unsubscribe(topic).await?;
        }
        Ok(())
    }

    fn topic_wanted(
        table: &HashMap<CallbackCategory, HashMap<String, Vec<Registration>>>,
        topic: &str,
    ) -> bool {
        table.values().any(|by_topic| {
            by_topic
                .get(topic)
                .is_some_and(|registrations| registrations.iter().any(|r| r.subscribe))
        })
    }

    /// Topics any registration wants subscribed.
    #[cfg(test)]
    fn subscribed_topics(&self) -> Vec<String> {
        let table = self.table.lock();
        let mut topics: Vec<String> = table
            .values()
            .flat_map(|by_topic| {
                by_topic.iter().filter_map(|(topic, registrations)| {
                    registrations
                        .iter()
                        .any(|r| r.subscribe)
                        .then(|| topic.clone())
                })
            })
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub(crate) async fn dispatch_event(&self, event: Event) {
        let callbacks = self.matching_event_callbacks(&event.header.destination_topic);
        if callbacks.is_empty() {
            debug!(
                topic = %event.header.destination_topic,
                message_id = %event.header.message_id,
                "no event callbacks registered for topic"
            );
            return;
        }
        for callback in callbacks {
            let event = event.clone();
            let _ = self
                .pool
                .add_task(async move { callback.on_event(event).await })
                .await;
        }
    }

    pub(crate) async fn dispatch_request(&self, request: Request) {
        let callbacks = self.matching_request_callbacks(&request.header.destination_topic);
        if callbacks.is_empty() {
            debug!(
                topic = %request.header.destination_topic,
                message_id = %request.header.message_id,
                "no request callbacks registered for topic"
            );
            return;
        }
        for callback in callbacks {
            let request = request.clone();
            let _ = self
                .pool
                .add_task(async move { callback.on_request(request).await })
                .await;
        }
    }

    /// Dispatch a reply to response-category registrations. Correlated
    /// delivery to waiters happens in the correlator; this covers explicit
    /// topic registrations.
    pub(crate) async fn dispatch_reply(&self, reply: Reply) {
        let callbacks = self.matching_response_callbacks(&reply.header().destination_topic);
        for callback in callbacks {
            let reply = reply.clone();
            let _ = self
                .pool
                .add_task(async move { callback.on_response(reply).await })
                .await;
        }
    }

    /// Run one correlator async-request callback on the pool.
    pub(crate) async fn dispatch_correlated(
        &self,
        callback: Arc<dyn ResponseCallback>,
        reply: Reply,
    ) {
        let _ = self
            .pool
            .add_task(async move { callback.on_response(reply).await })
            .await;
    }

    fn matching_event_callbacks(&self, topic: &str) -> Vec<Arc<dyn EventCallback>> {
        self.matching(CallbackCategory::Event, topic, |cb| match cb {
            Callback::Event(c) => Some(c.clone()),
            _ => None,
        })
    }

    fn matching_request_callbacks(&self, topic: &str) -> Vec<Arc<dyn RequestCallback>> {
        self.matching(CallbackCategory::Request, topic, |cb| match cb {
            Callback::Request(c) => Some(c.clone()),
            _ => None,
        })
    }

    fn matching_response_callbacks(&self, topic: &str) -> Vec<Arc<dyn ResponseCallback>> {
        self.matching(CallbackCategory::Response, topic, |cb| match cb {
            Callback::Response(c) => Some(c.clone()),
            _ => None,
        })
    }

    fn matching<T>(
        &self,
        category: CallbackCategory,
        topic: &str,
        select: impl Fn(&Callback) -> Option<T>,
    ) -> Vec<T> {
        let table = self.table.lock();
        let Some(by_topic) = table.get(&category) else {
            return Vec::new();
        };
        by_topic
            .iter()
            .filter(|(pattern, _)| topic_matches(pattern, topic))
            .flat_map(|(_, registrations)| {
                registrations.iter().filter_map(|r| select(&r.callback))
            })
            .collect()
    }
}
