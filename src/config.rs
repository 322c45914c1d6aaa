//! Configuration for the weft client

use std::time::Duration;

use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{Result, WeftError};

/// Configuration for connecting to a weft fabric
#[derive(Debug, Clone)]
pub struct WeftConfig {
    /// Brokers to race when connecting; at least one is required
    pub brokers: Vec<Broker>,

    /// Identity this client presents to the fabric
    pub client_id: String,

    /// Whether to automatically reconnect when the connection drops
    pub reconnect_when_disconnected: bool,

    /// Initial delay before retrying a failed connect
    pub reconnect_delay: Duration,

    /// Upper bound on the retry delay before jitter
    pub reconnect_delay_max: Duration,

    /// Multiplier applied to the delay after each failed pass
    pub reconnect_back_off_multiplier: f64,

    /// Jitter fraction added on top of the delay (0.0 to 1.0)
    pub reconnect_delay_random: f64,

    /// Retry budget for an explicit connect call; `None` retries forever
    pub connect_retries: Option<u32>,

    /// Timeout for each broker latency probe during racing
    pub connect_probe_timeout: Duration,

    /// Depth of the inbound callback task queue
    pub incoming_message_queue_size: usize,

    /// Number of callback pool workers
    pub incoming_message_thread_pool_size: usize,

    /// Default timeout for `sync_request` when none is given
    pub default_request_timeout: Duration,
}

impl WeftConfig {
    /// Create a configuration for the given brokers with defaults matching
    /// the fabric's reference client.
    pub fn new(brokers: Vec<Broker>) -> Result<Self> {
        if brokers.is_empty() {
            return Err(WeftError::Usage(
                "no brokers in configuration so cannot connect".to_string(),
            ));
        }
        Ok(Self {
            brokers,
            client_id: Uuid::new_v4().to_string(),
            reconnect_when_disconnected: true,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_back_off_multiplier: 2.0,
            reconnect_delay_random: 0.25,
            connect_retries: None,
            connect_probe_timeout: Duration::from_secs(1),
            incoming_message_queue_size: 1000,
            incoming_message_thread_pool_size: 1,
            default_request_timeout: Duration::from_secs(60 * 60),
        })
    }

    /// Set an explicit client id instead of the generated one
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Disable automatic reconnection on dropped connections
    pub fn no_reconnect(mut self) -> Self {
        self.reconnect_when_disconnected = false;
        self
    }

    /// Set the retry delay range
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.reconnect_delay_max = max;
        self
    }

    /// Set the backoff multiplier and jitter fraction
    pub fn backoff(mut self, multiplier: f64, jitter: f64) -> Self {
        self.reconnect_back_off_multiplier = multiplier;
        self.reconnect_delay_random = jitter;
        self
    }

    /// Bound the number of connect retries (`None` = retry forever)
    pub fn connect_retries(mut self, retries: Option<u32>) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Set the broker latency probe timeout
    pub fn connect_probe_timeout(mut self, timeout: Duration) -> Self {
        self.connect_probe_timeout = timeout;
        self
    }

    /// Size the callback queue and worker pool
    pub fn incoming_queue(mut self, queue_size: usize, workers: usize) -> Self {
        self.incoming_message_queue_size = queue_size;
        self.incoming_message_thread_pool_size = workers;
        self
    }

    /// Set the default `sync_request` timeout
    pub fn default_request_timeout(mut self, timeout: Duration) -> Self {
        self.default_request_timeout = timeout;
        self
    }
}
