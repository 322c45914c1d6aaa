//! Request/response correlation
//!
//! Tracks in-flight request ids and resolves arriving replies to exactly one
//! registered party: a synchronous waiter (a `oneshot` the caller blocks on)
//! or an asynchronous callback. A reply for an id nobody registered yet is
//! stashed and handed over if a waiter for that id shows up later; the stash
//! is bounded, with the oldest entries evicted first, so replies nobody ever
//! claims cannot accumulate over the life of a connection.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message::Reply;
use crate::router::ResponseCallback;

enum Pending {
    Waiter(oneshot::Sender<Reply>),
    Callback(Arc<dyn ResponseCallback>),
}

/// Unclaimed replies kept around for a late waiter before eviction starts.
const STASH_LIMIT: usize = 1024;

#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    stashed: HashMap<String, Reply>,
    // Insertion order of `stashed` keys; ids removed early are skipped when
    // they surface during eviction.
    stash_order: VecDeque<String>,
}

impl State {
    fn stash(&mut self, request_id: String, reply: Reply) {
        if self.stashed.insert(request_id.clone(), reply).is_none() {
            self.stash_order.push_back(request_id);
        }
        while self.stashed.len() > STASH_LIMIT {
            match self.stash_order.pop_front() {
                Some(oldest) => {
                    self.stashed.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct RequestCorrelator {
    state: Mutex<State>,
}

impl RequestCorrelator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous waiter for `request_id`. If the reply already
    /// arrived and was stashed, the receiver resolves immediately.
    pub(crate) fn register_waiter(&self, request_id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if let Some(reply) = state.stashed.remove(request_id) {
            let _ = tx.send(reply);
            return rx;
        }
        state.pending.insert(request_id.to_string(), Pending::Waiter(tx));
        rx
    }

    /// Register an async callback for `request_id`.
    pub(crate) fn register_callback(&self, request_id: &str, callback: Arc<dyn ResponseCallback>) {
        self.state
            .lock()
            .pending
            .insert(request_id.to_string(), Pending::Callback(callback));
    }

    /// Remove all state for `request_id` (success, timeout, and publish
    /// failure all funnel through here so nothing leaks).
    pub(crate) fn unregister(&self, request_id: &str) {
        let mut state = self.state.lock();
        state.pending.remove(request_id);
        state.stashed.remove(request_id);
    }

    /// Resolve an arriving reply. Returns a callback (and the reply it owes)
    /// for the caller to run on the worker pool; waiters are completed
    /// directly. Unclaimed replies are stashed.
    #[must_use]
    pub(crate) fn deliver(&self, reply: Reply) -> Option<(Arc<dyn ResponseCallback>, Reply)> {
        let request_id = reply.request_message_id().to_string();
        let mut state = self.state.lock();
        match state.pending.remove(&request_id) {
            Some(Pending::Waiter(tx)) => {
                // A racing timeout may have dropped the receiver; stash the
                // reply like any other unclaimed delivery.
                if let Err(reply) = tx.send(reply) {
                    state.stash(request_id, reply);
                }
                None
            }
            Some(Pending::Callback(callback)) => Some((callback, reply)),
            None => {
                debug!(request_id = %request_id, "reply with no registered waiter, stashing");
                state.stash(request_id, reply);
                None
            }
        }
    }

    /// Fail every pending waiter, used at shutdown. Callbacks are simply
    /// dropped; their owners observe the shutdown separately.
    pub(crate) fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.stashed.clear();
        state.stash_order.clear();
    }

    #[cfg(test)]
    fn has_state_for(&self, request_id: &str) -> bool {
        let state = self.state.lock();
        state.pending.contains_key(request_id) || state.stashed.contains_key(request_id)
    }
}
