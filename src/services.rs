//! Service registration
//!
//! Services advertise themselves to the fabric's registry with a TTL. A
//! background worker renews every registration before its TTL lapses and
//! re-registers everything after a reconnect. The registry talks to the
//! fabric through the [`Registrar`] trait so it stays decoupled from the
//! client facade that actually sends the RPCs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WeftError};
use crate::router::RequestCallback;

/// Topic the fabric registry listens on for registrations.
pub const SERVICE_REGISTRY_REGISTER_TOPIC: &str = "/weft/service/registry/register";
/// Topic the fabric registry listens on for unregistrations.
pub const SERVICE_REGISTRY_UNREGISTER_TOPIC: &str = "/weft/service/registry/unregister";

/// Timeout for the registration RPC.
pub(crate) const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for the unregistration RPC.
pub(crate) const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait before retrying a failed renewal.
const RENEWAL_RETRY: Duration = Duration::from_secs(60);

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// A service advertised to the fabric: its type, the request topics it
/// serves, and the callbacks handling them.
pub struct ServiceRegistration {
    service_type: String,
    service_id: String,
    metadata: HashMap<String, String>,
    ttl: Duration,
    callbacks: Vec<(String, Arc<dyn RequestCallback>)>,
    destination_tenant_guids: Vec<String>,
}

impl ServiceRegistration {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            service_id: Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
            ttl: DEFAULT_TTL,
            callbacks: Vec::new(),
            destination_tenant_guids: Vec::new(),
        }
    }

    /// Serve requests on `topic` with `callback`.
    pub fn add_topic(mut self, topic: impl Into<String>, callback: Arc<dyn RequestCallback>) -> Self {
        self.callbacks.push((topic.into(), callback));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Registration lifetime; renewed automatically before it lapses.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Tenants the registration is visible to. Empty means unrestricted.
    pub fn destination_tenant_guids(mut self, guids: Vec<String>) -> Self {
        self.destination_tenant_guids = guids;
        self
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn topics(&self) -> Vec<String> {
        self.callbacks.iter().map(|(t, _)| t.clone()).collect()
    }

    pub(crate) fn callback_entries(&self) -> &[(String, Arc<dyn RequestCallback>)] {
        &self.callbacks
    }

    pub(crate) fn metadata_map(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub(crate) fn ttl_minutes(&self) -> u64 {
        (self.ttl.as_secs() / 60).max(1)
    }

    pub(crate) fn ttl_duration(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn tenant_guids(&self) -> &[String] {
        &self.destination_tenant_guids
    }
}

/// Sends registration traffic to the fabric on the registry's behalf.
#[async_trait]
pub(crate) trait Registrar: Send + Sync + 'static {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()>;
    async fn unregister(&self, service_id: &str) -> Result<()>;
    fn is_connected(&self) -> bool;
}

struct ServiceEntry {
    registration: Arc<ServiceRegistration>,
    /// When the next renewal is owed. `None` means owed now.
    next_due: Option<Instant>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, ServiceEntry>,
}

pub(crate) struct ServiceRegistry {
    registrar: Arc<dyn Registrar>,
    state: Arc<Mutex<RegistryState>>,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub(crate) fn new(registrar: Arc<dyn Registrar>) -> Self {
        let state = Arc::new(Mutex::new(RegistryState::default()));
        let notify = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = RenewalWorker {
            registrar: registrar.clone(),
            state: state.clone(),
            notify: notify.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            registrar,
            state,
            notify,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Add a registration and send it to the fabric, waiting for the
    /// registry's acknowledgement. On failure the registration stays
    /// tracked; the renewal worker retries it.
    pub(crate) async fn register_sync(
        &self,
        registration: Arc<ServiceRegistration>,
    ) -> Result<()> {
        let service_id = registration.service_id().to_string();
        self.insert(registration.clone());
        let result = self.registrar.register(&registration).await;
        match &result {
            Ok(()) => self.mark_registered(&service_id, registration.ttl_duration()),
            Err(e) => warn!(service_id, error = %e, "service registration failed"),
        }
        self.notify.notify_one();
        result
    }

    /// Add a registration; the renewal worker sends it when possible.
    pub(crate) fn register_async(&self, registration: Arc<ServiceRegistration>) {
        self.insert(registration);
        self.notify.notify_one();
    }

    /// Remove a registration and tell the fabric, waiting for the
    /// acknowledgement.
    pub(crate) async fn unregister_sync(&self, service_id: &str) -> Result<()> {
        if self.remove(service_id).is_none() {
            return Err(WeftError::Usage(format!(
                "service is not registered: {service_id}"
            )));
        }
        self.registrar.unregister(service_id).await
    }

    /// Remove a registration; the fabric is told in the background.
    pub(crate) fn unregister_async(&self, service_id: &str) -> Result<()> {
        if self.remove(service_id).is_none() {
            return Err(WeftError::Usage(format!(
                "service is not registered: {service_id}"
            )));
        }
        let registrar = self.registrar.clone();
        let service_id = service_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = registrar.unregister(&service_id).await {
                warn!(service_id, error = %e, "service unregistration failed");
            }
        });
        Ok(())
    }

    pub(crate) fn registered_services(&self) -> Vec<Arc<ServiceRegistration>> {
        self.state
            .lock()
            .entries
            .values()
            .map(|e| e.registration.clone())
            .collect()
    }

    /// Mark every registration owed so the worker re-registers them.
    /// Called from the connect callback.
    pub(crate) fn on_connected(&self) {
        {
            let mut state = self.state.lock();
            for entry in state.entries.values_mut() {
                entry.next_due = None;
            }
        }
        self.notify.notify_one();
    }

    /// Stop the renewal worker and unregister everything still tracked.
    pub(crate) async fn destroy(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let entries: Vec<String> = {
            let mut state = self.state.lock();
            state.entries.drain().map(|(id, _)| id).collect()
        };
        for service_id in entries {
            if let Err(e) = self.registrar.unregister(&service_id).await {
                warn!(service_id, error = %e, "service unregistration during shutdown failed");
            }
        }
    }

    fn insert(&self, registration: Arc<ServiceRegistration>) {
        let service_id = registration.service_id().to_string();
        info!(service_id, service_type = registration.service_type(), "service added");
        self.state.lock().entries.insert(
            service_id,
            ServiceEntry {
                registration,
                next_due: None,
            },
        );
    }

    fn remove(&self, service_id: &str) -> Option<Arc<ServiceRegistration>> {
        let removed = self.state.lock().entries.remove(service_id);
        if removed.is_some() {
            info!(service_id, "service removed");
            self.notify.notify_one();
        }
        removed.map(|e| e.registration)
    }

    fn mark_registered(&self, service_id: &str, ttl: Duration) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(service_id) {
            entry.next_due = Some(Instant::now() + ttl);
        }
    }
}

struct RenewalWorker {
    registrar: Arc<dyn Registrar>,
    state: Arc<Mutex<RegistryState>>,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
}

impl RenewalWorker {
    async fn run(self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if !self.registrar.is_connected() {
                self.notify.notified().await;
                continue;
            }
            match self.time_until_next_due() {
                Some(wait) if wait.is_zero() => self.renew_due().await,
                Some(wait) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    fn time_until_next_due(&self) -> Option<Duration> {
        let state = self.state.lock();
        let now = Instant::now();
        state
            .entries
            .values()
            .map(|e| match e.next_due {
                Some(due) => due.saturating_duration_since(now),
                None => Duration::ZERO,
            })
            .min()
    }

    async fn renew_due(&self) {
        let now = Instant::now();
        let due: Vec<Arc<ServiceRegistration>> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| e.next_due.map_or(true, |d| d <= now))
                .map(|e| e.registration.clone())
                .collect()
        };
        for registration in due {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let service_id = registration.service_id();
            match self.registrar.register(&registration).await {
                Ok(()) => {
                    debug!(service_id, "service registration renewed");
                    self.set_next_due(service_id, Instant::now() + registration.ttl_duration());
                }
                Err(e) => {
                    warn!(service_id, error = %e, "service renewal failed");
                    self.set_next_due(service_id, Instant::now() + RENEWAL_RETRY);
                }
            }
        }
    }

    fn set_next_due(&self, service_id: &str, due: Instant) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(service_id) {
            entry.next_due = Some(due);
        }
    }
}
