//! Shared subscription bookkeeping
//!
//! The wanted-topic set is authoritative on the client side; transport
//! subscribe calls are best-effort while connected and replayed in full on
//! every reconnect. The fabric forgets subscriptions across a disconnect, so
//! the set must survive locally.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::Transport;

pub(crate) struct Subscriptions {
    transport: Arc<dyn Transport>,
    topics: Mutex<HashSet<String>>,
}

impl Subscriptions {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            topics: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        topics.sort();
        topics
    }

    /// Add `topic` to the wanted set and subscribe it on the live transport.
    /// The topic stays in the set even when the transport call fails, so the
    /// next reconnect replay retries it; the error still reaches the caller.
    pub(crate) async fn subscribe(&self, topic: &str) -> Result<()> {
        self.topics.lock().insert(topic.to_string());
        if self.transport.is_connected() {
            debug!(topic, "subscribing");
            self.transport.subscribe(&[topic.to_string()]).await?;
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let removed = self.topics.lock().remove(topic);
        if removed && self.transport.is_connected() {
            debug!(topic, "unsubscribing");
            self.transport.unsubscribe(&[topic.to_string()]).await?;
        }
        Ok(())
    }

    /// Replay the whole wanted set after a (re)connect.
    pub(crate) async fn resubscribe_all(&self) {
        let topics = self.snapshot();
        if topics.is_empty() {
            return;
        }
        debug!(count = topics.len(), "resubscribing topics");
        if let Err(e) = self.transport.subscribe(&topics).await {
            warn!(error = %e, "resubscribe failed");
        }
    }

    /// Drop every subscription, used at shutdown.
    pub(crate) async fn unsubscribe_all(&self) {
        let topics: Vec<String> = self.topics.lock().drain().collect();
        if topics.is_empty() {
            return;
        }
        if self.transport.is_connected() {
            if let Err(e) = self.transport.unsubscribe(&topics).await {
                warn!(error = %e, "unsubscribe-all failed");
            }
        }
    }
}
