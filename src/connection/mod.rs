//! Connection supervision
//!
//! A dedicated worker task owns the transport's connection lifecycle. User
//! calls (`connect`, `disconnect`, `shutdown`) and transport drop
//! notifications are funneled to the worker over a command channel; the
//! worker publishes the current [`ConnectionState`] through a watch channel.
//!
//! The shared `ConnectionRequest` slot lets callers reject conflicting
//! requests immediately (a disconnect while a connect is in flight, and
//! vice versa) instead of queueing behind them, and lets a shutdown preempt
//! a retry pass that is mid-backoff.

mod racing;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::WeftConfig;
use crate::error::{Result, WeftError};
use crate::transport::Transport;

/// Where the client currently stands with the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    NotConnected,
    /// Connected to a broker.
    Connected,
    /// Connection lost; the supervisor is retrying in the background.
    Reconnecting,
    /// A disconnect attempt failed; the transport's state is indeterminate.
    Unknown,
    /// The client has been shut down. Terminal.
    Shutdown,
}

/// Invoked by the supervisor each time a broker connection is established,
/// including reconnects.
#[async_trait]
pub trait ConnectCallback: Send + Sync {
    async fn on_connect(&self);
}

#[async_trait]
impl<F> ConnectCallback for F
where
    F: Fn() + Send + Sync,
{
    async fn on_connect(&self) {
        self()
    }
}

/// The pending user intent, visible to callers for conflict rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionRequest {
    None,
    Connect,
    Disconnect,
    Shutdown,
}

enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<Result<()>>),
    Dropped(String),
}

pub(crate) struct ConnectionSupervisor {
    cmd_tx: mpsc::UnboundedSender<Command>,
    request: Arc<Mutex<ConnectionRequest>>,
    state_rx: watch::Receiver<ConnectionState>,
    current_broker: Arc<Mutex<Option<Broker>>>,
    callbacks: Arc<Mutex<Vec<Arc<dyn ConnectCallback>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(config: Arc<WeftConfig>, transport: Arc<dyn Transport>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotConnected);
        let request = Arc::new(Mutex::new(ConnectionRequest::None));
        let current_broker = Arc::new(Mutex::new(None));
        let callbacks: Arc<Mutex<Vec<Arc<dyn ConnectCallback>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let retry_delay = config.reconnect_delay;
        let worker = Worker {
            config,
            transport,
            cmd_rx,
            state_tx,
            request: request.clone(),
            current_broker: current_broker.clone(),
            callbacks: callbacks.clone(),
            retry_delay,
            connect_tries_remaining: None,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            cmd_tx,
            request,
            state_rx,
            current_broker,
            callbacks,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register a callback to run after every successful connection.
    pub(crate) fn add_connect_callback(&self, callback: Arc<dyn ConnectCallback>) {
        self.callbacks.lock().push(callback);
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The broker the client is currently connected to, if any.
    pub(crate) fn current_broker(&self) -> Option<Broker> {
        self.current_broker.lock().clone()
    }

    /// Ask the worker to connect and wait for the outcome.
    pub(crate) async fn connect(&self) -> Result<()> {
        match *self.request.lock() {
            ConnectionRequest::Shutdown => return Err(WeftError::Shutdown),
            ConnectionRequest::Disconnect => {
                return Err(WeftError::Transport(
                    "cannot connect while a disconnect is in progress".to_string(),
                ))
            }
            _ => {}
        }
        if self.state() == ConnectionState::Shutdown {
            return Err(WeftError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(tx))
            .map_err(|_| WeftError::Shutdown)?;
        rx.await.map_err(|_| WeftError::Shutdown)?
    }

    /// Ask the worker to disconnect and wait for the outcome.
    pub(crate) async fn disconnect(&self) -> Result<()> {
        match *self.request.lock() {
            ConnectionRequest::Shutdown => return Err(WeftError::Shutdown),
            ConnectionRequest::Connect => {
                return Err(WeftError::Transport(
                    "cannot disconnect while a connect is in progress".to_string(),
                ))
            }
            _ => {}
        }
        if self.state() == ConnectionState::Shutdown {
            return Err(WeftError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Disconnect(tx))
            .map_err(|_| WeftError::Shutdown)?;
        rx.await.map_err(|_| WeftError::Shutdown)?
    }

    /// Tell the worker the transport connection dropped unexpectedly.
    pub(crate) fn notify_dropped(&self, reason: String) {
        let _ = self.cmd_tx.send(Command::Dropped(reason));
    }

    /// Shut the worker down, disconnecting first if needed. Idempotent.
    ///
    /// Writing the shutdown request directly preempts any backoff sleep or
    /// connect pass the worker is in the middle of.
    pub(crate) async fn shutdown(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else { return };
        *self.request.lock() = ConnectionRequest::Shutdown;
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let _ = handle.await;
    }
}

struct Worker {
    config: Arc<WeftConfig>,
    transport: Arc<dyn Transport>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    request: Arc<Mutex<ConnectionRequest>>,
    current_broker: Arc<Mutex<Option<Broker>>>,
    callbacks: Arc<Mutex<Vec<Arc<dyn ConnectCallback>>>>,
    retry_delay: Duration,
    /// Retry budget for the current explicit connect. `None` outside an
    /// explicit connect, or when the budget is infinite.
    connect_tries_remaining: Option<u32>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    disconnect_waiters: Vec<oneshot::Sender<Result<()>>>,
    shutdown_waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let request = *self.request.lock();
            let state = *self.state_tx.borrow();
            match request {
                ConnectionRequest::Shutdown => {
                    self.finalize().await;
                    return;
                }
                ConnectionRequest::Disconnect => self.do_disconnect().await,
                ConnectionRequest::Connect => self.connect_cycle().await,
                ConnectionRequest::None => {
                    if state == ConnectionState::Reconnecting {
                        self.connect_cycle().await;
                    } else {
                        match self.cmd_rx.recv().await {
                            Some(cmd) => self.apply(cmd),
                            None => {
                                // Supervisor dropped; tear down.
                                *self.request.lock() = ConnectionRequest::Shutdown;
                            }
                        }
                    }
                }
            }
        }
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(tx) => {
                let mut request = self.request.lock();
                match *request {
                    ConnectionRequest::Shutdown => {
                        let _ = tx.send(Err(WeftError::Shutdown));
                    }
                    ConnectionRequest::Disconnect => {
                        let _ = tx.send(Err(WeftError::Transport(
                            "cannot connect while a disconnect is in progress".to_string(),
                        )));
                    }
                    _ => {
                        if *request != ConnectionRequest::Connect {
                            *request = ConnectionRequest::Connect;
                            self.connect_tries_remaining = self.config.connect_retries;
                        }
                        self.connect_waiters.push(tx);
                    }
                }
            }
            Command::Disconnect(tx) => {
                let mut request = self.request.lock();
                match *request {
                    ConnectionRequest::Shutdown => {
                        let _ = tx.send(Err(WeftError::Shutdown));
                    }
                    ConnectionRequest::Connect => {
                        let _ = tx.send(Err(WeftError::Transport(
                            "cannot disconnect while a connect is in progress".to_string(),
                        )));
                    }
                    _ => {
                        *request = ConnectionRequest::Disconnect;
                        self.disconnect_waiters.push(tx);
                    }
                }
            }
            Command::Shutdown(tx) => {
                *self.request.lock() = ConnectionRequest::Shutdown;
                self.shutdown_waiters.push(tx);
            }
            Command::Dropped(reason) => self.handle_dropped(reason),
        }
    }

    fn handle_dropped(&mut self, reason: String) {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return;
        }
        *self.current_broker.lock() = None;
        let request = *self.request.lock();
        if matches!(
            request,
            ConnectionRequest::Disconnect | ConnectionRequest::Shutdown
        ) {
            // Deliberate teardown already in progress.
            return;
        }
        if self.config.reconnect_when_disconnected {
            error!(reason, "connection dropped, reconnecting");
            self.retry_delay = self.config.reconnect_delay;
            self.set_state(ConnectionState::Reconnecting);
        } else {
            error!(reason, "connection dropped");
            self.set_state(ConnectionState::NotConnected);
        }
    }

    async fn connect_cycle(&mut self) {
        if self.transport.is_connected() {
            self.finish_connect_ok(false).await;
            return;
        }
        match self.connect_pass().await {
            Ok(()) => self.finish_connect_ok(true).await,
            Err(e) => self.handle_failed_pass(e).await,
        }
    }

    /// One attempt over all candidate brokers, fastest-probe first.
    async fn connect_pass(&mut self) -> Result<()> {
        let candidates = racing::brokers_by_connect_time(
            &self.config.brokers,
            self.config.connect_probe_timeout,
        )
        .await;
        let mut last_err = WeftError::Transport("no brokers configured".to_string());
        for candidate in candidates {
            let request = *self.request.lock();
            if matches!(
                request,
                ConnectionRequest::Shutdown | ConnectionRequest::Disconnect
            ) {
                return Err(WeftError::Transport("connect aborted".to_string()));
            }
            debug!(
                host = %candidate.host,
                port = candidate.port,
                latency = ?candidate.latency,
                "attempting broker connection"
            );
            match self.transport.connect(&candidate.host, candidate.port).await {
                Ok(()) => {
                    info!(host = %candidate.host, port = candidate.port, "connected to broker");
                    *self.current_broker.lock() = Some(candidate.broker);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        host = %candidate.host,
                        port = candidate.port,
                        error = %e,
                        "broker connection failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn finish_connect_ok(&mut self, newly_connected: bool) {
        self.retry_delay = self.config.reconnect_delay;
        self.connect_tries_remaining = None;
        {
            let mut request = self.request.lock();
            if *request == ConnectionRequest::Connect {
                *request = ConnectionRequest::None;
            }
        }
        // Callbacks run before the state flips to Connected and before
        // waiters are released, so anyone observing Connected can rely on
        // resubscription and service re-registration having completed.
        if newly_connected {
            self.invoke_connect_callbacks().await;
        }
        self.set_state(ConnectionState::Connected);
        for tx in self.connect_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    async fn handle_failed_pass(&mut self, err: WeftError) {
        {
            let request = *self.request.lock();
            if matches!(
                request,
                ConnectionRequest::Shutdown | ConnectionRequest::Disconnect
            ) {
                self.fail_connect_waiters(&err);
                return;
            }
        }
        let reconnecting = *self.state_tx.borrow() == ConnectionState::Reconnecting;
        let explicit = *self.request.lock() == ConnectionRequest::Connect;
        if explicit && !reconnecting {
            if let Some(n) = self.connect_tries_remaining.as_mut() {
                if *n == 0 {
                    error!(error = %err, "connect failed, retry budget exhausted");
                    self.set_state(ConnectionState::NotConnected);
                    let mut request = self.request.lock();
                    if *request == ConnectionRequest::Connect {
                        *request = ConnectionRequest::None;
                    }
                    drop(request);
                    self.fail_connect_waiters(&err);
                    return;
                }
                *n -= 1;
            }
        }
        warn!(error = %err, "connect attempt failed, backing off");
        self.backoff_sleep().await;
    }

    async fn backoff_sleep(&mut self) {
        let (sleep_for, next_delay) = compute_backoff(
            self.retry_delay,
            self.config.reconnect_delay_max,
            self.config.reconnect_delay_random,
            self.config.reconnect_back_off_multiplier,
            rand::random::<f64>(),
        );
        self.retry_delay = next_delay;
        warn!(delay = ?sleep_for, "waiting before next connect attempt");
        tokio::select! {
            cmd = self.cmd_rx.recv() => match cmd {
                Some(cmd) => self.apply(cmd),
                None => *self.request.lock() = ConnectionRequest::Shutdown,
            },
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    async fn do_disconnect(&mut self) {
        let result = self.transport.disconnect().await;
        *self.current_broker.lock() = None;
        match &result {
            Ok(()) => self.set_state(ConnectionState::NotConnected),
            Err(e) => {
                error!(error = %e, "disconnect failed, connection state unknown");
                self.set_state(ConnectionState::Unknown);
            }
        }
        {
            let mut request = self.request.lock();
            if *request == ConnectionRequest::Disconnect {
                *request = ConnectionRequest::None;
            }
        }
        for tx in self.disconnect_waiters.drain(..) {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(clone_for_waiter(e)),
            });
        }
    }

    async fn finalize(&mut self) {
        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect().await {
                warn!(error = %e, "disconnect during shutdown failed");
            }
        }
        *self.current_broker.lock() = None;
        self.set_state(ConnectionState::Shutdown);
        for tx in self.connect_waiters.drain(..) {
            let _ = tx.send(Err(WeftError::Shutdown));
        }
        for tx in self.disconnect_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Connect(tx) | Command::Disconnect(tx) => {
                    let _ = tx.send(Err(WeftError::Shutdown));
                }
                Command::Shutdown(tx) => self.shutdown_waiters.push(tx),
                Command::Dropped(_) => {}
            }
        }
        for tx in self.shutdown_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    fn fail_connect_waiters(&mut self, err: &WeftError) {
        for tx in self.connect_waiters.drain(..) {
            let _ = tx.send(Err(clone_for_waiter(err)));
        }
    }

    async fn invoke_connect_callbacks(&self) {
        let callbacks: Vec<Arc<dyn ConnectCallback>> = self.callbacks.lock().clone();
        for cb in callbacks {
            if AssertUnwindSafe(cb.on_connect()).catch_unwind().await.is_err() {
                error!("connect callback panicked");
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            info!(?prev, ?state, "connection state changed");
        }
    }
}

/// `WeftError` is not `Clone`; waiters sharing one outcome get a faithful
/// copy of the variants they can act on and a stringified transport error
/// otherwise.
fn clone_for_waiter(err: &WeftError) -> WeftError {
    match err {
        WeftError::Shutdown => WeftError::Shutdown,
        WeftError::NotConnected => WeftError::NotConnected,
        WeftError::Timeout(s) => WeftError::Timeout(s.clone()),
        other => WeftError::Transport(other.to_string()),
    }
}

/// Compute (sleep duration, next base delay) for one backoff step.
///
/// The base delay is clamped to `max` before jitter, so the sleep never
/// exceeds `max * (1 + jitter_fraction)`. `r` is a uniform sample in [0, 1).
fn compute_backoff(
    delay: Duration,
    max: Duration,
    jitter_fraction: f64,
    multiplier: f64,
    r: f64,
) -> (Duration, Duration) {
    let base = if delay > max { max } else { delay };
    let jitter = Duration::from_secs_f64(base.as_secs_f64() * jitter_fraction * r);
    let next = Duration::from_secs_f64(base.as_secs_f64() * multiplier);
    (base + jitter, next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryFabric;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    struct CountingCallback(Arc<AtomicUsize>);

    #[async_trait]
    impl ConnectCallback for CountingCallback {
        async fn on_connect(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingCallback;

    #[async_trait]
    impl ConnectCallback for PanickingCallback {
        async fn on_connect(&self) {
            panic!("boom");
        }
    }

    fn test_config() -> WeftConfig {
        // Port 1 is closed, so latency probes fail fast.
        WeftConfig::new(vec![Broker::parse("127.0.0.1:1").unwrap()])
            .unwrap()
            .reconnect_delay(Duration::from_millis(1), Duration::from_millis(5))
            .connect_probe_timeout(Duration::from_millis(50))
    }

    fn supervisor(fabric: &MemoryFabric, config: WeftConfig) -> ConnectionSupervisor {
        ConnectionSupervisor::new(Arc::new(config), Arc::new(fabric.transport()))
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let fabric = MemoryFabric::new();
        let sup = supervisor(&fabric, test_config());

        sup.connect().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert!(sup.current_broker().is_some());

        sup.disconnect().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::NotConnected);
        assert!(sup.current_broker().is_none());

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let fabric = MemoryFabric::new();
        let sup = supervisor(&fabric, test_config());
        sup.connect().await.unwrap();
        sup.connect().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_retry_budget_exhausted() {
        let fabric = MemoryFabric::new();
        fabric.fail_next_connects(10);
        let sup = supervisor(&fabric, test_config().connect_retries(Some(1)));

        let err = sup.connect().await.unwrap_err();
        assert!(matches!(err, WeftError::Transport(_)));
        assert_eq!(sup.state(), ConnectionState::NotConnected);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_retries_until_success() {
        let fabric = MemoryFabric::new();
        fabric.fail_next_connects(2);
        let sup = supervisor(&fabric, test_config().connect_retries(Some(5)));

        sup.connect().await.unwrap();
        assert_eq!(sup.state(), ConnectionState::Connected);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_later_calls() {
        let fabric = MemoryFabric::new();
        let transport = Arc::new(fabric.transport());
        let sup = ConnectionSupervisor::new(Arc::new(test_config()), transport.clone());
        sup.connect().await.unwrap();

        sup.shutdown().await;
        assert_eq!(sup.state(), ConnectionState::Shutdown);
        assert!(!transport.is_connected());
        assert!(matches!(sup.connect().await, Err(WeftError::Shutdown)));
        assert!(matches!(sup.disconnect().await, Err(WeftError::Shutdown)));
        // Second shutdown is a no-op.
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_triggers_reconnect_and_replays_callbacks() {
        let fabric = MemoryFabric::new();
        let sup = supervisor(&fabric, test_config());
        let count = Arc::new(AtomicUsize::new(0));
        sup.add_connect_callback(Arc::new(CountingCallback(count.clone())));

        sup.connect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        fabric.drop_all("broker went away");
        sup.notify_dropped("broker went away".to_string());

        // The watch channel still holds the pre-drop Connected value, so
        // waiting on it can satisfy before the worker sees the drop. The
        // replayed callback is the real observable.
        let replayed = async {
            while count.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(5), replayed).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let fabric = MemoryFabric::new();
        let sup = supervisor(&fabric, test_config().no_reconnect());
        sup.connect().await.unwrap();

        fabric.drop_all("broker went away");
        sup.notify_dropped("broker went away".to_string());

        let mut rx = sup.state_receiver();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == ConnectionState::NotConnected),
        )
        .await
        .unwrap()
        .unwrap();
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_connect_callback_does_not_fail_connect() {
        let fabric = MemoryFabric::new();
        let sup = supervisor(&fabric, test_config());
        let count = Arc::new(AtomicUsize::new(0));
        sup.add_connect_callback(Arc::new(PanickingCallback));
        sup.add_connect_callback(Arc::new(CountingCallback(count.clone())));

        sup.connect().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_rejected_while_connect_in_flight() {
        let fabric = MemoryFabric::new();
        fabric.fail_next_connects(usize::MAX);
        let config = test_config()
            .reconnect_delay(Duration::from_secs(30), Duration::from_secs(30))
            .connect_retries(None);
        let sup = Arc::new(supervisor(&fabric, config));

        let sup2 = sup.clone();
        let connect_task = tokio::spawn(async move { sup2.connect().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = sup.disconnect().await.unwrap_err();
        assert!(matches!(err, WeftError::Transport(_)));

        sup.shutdown().await;
        let connect_result = connect_task.await.unwrap();
        assert!(connect_result.is_err());
    }

    #[test]
    fn test_backoff_growth_and_clamp() {
        let max = Duration::from_secs(60);
        let mut delay = Duration::from_secs(1);
        let mut last_sleep = Duration::ZERO;
        for _ in 0..10 {
            let (sleep_for, next) = compute_backoff(delay, max, 0.0, 2.0, 0.0);
            assert!(sleep_for >= last_sleep);
            assert!(sleep_for <= max);
            last_sleep = sleep_for;
            delay = next;
        }
        // Settles at the cap.
        let (sleep_for, _) = compute_backoff(delay, max, 0.0, 2.0, 0.0);
        assert_eq!(sleep_for, max);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let delay = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        let (low, _) = compute_backoff(delay, max, 0.25, 2.0, 0.0);
        let (high, _) = compute_backoff(delay, max, 0.25, 2.0, 0.999);
        assert_eq!(low, delay);
        assert!(high > delay);
        assert!(high < delay + Duration::from_secs_f64(10.0 * 0.25));
    }
}
