//! Broker descriptors
//!
//! A broker is a fabric endpoint reachable at one or more hosts on a single
//! port. Descriptors are immutable once constructed; validation happens at
//! construction so the connection supervisor never sees a malformed broker.

use crate::error::{Result, WeftError};

/// Default broker port when a descriptor does not name one.
pub const DEFAULT_BROKER_PORT: u16 = 8883;

/// A fabric endpoint reachable at one or more host:port pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    id: Option<String>,
    hosts: Vec<String>,
    port: u16,
}

impl Broker {
    /// Build a broker from explicit hosts and port.
    pub fn new(
        hosts: Vec<String>,
        id: Option<String>,
        port: u16,
    ) -> Result<Self> {
        if hosts.is_empty() || hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(WeftError::Protocol(
                "broker must have at least one non-empty host".to_string(),
            ));
        }
        if port == 0 {
            return Err(WeftError::Protocol(
                "broker port must be in 1-65535".to_string(),
            ));
        }
        Ok(Self { id, hosts, port })
    }

    /// Parse a `host` or `host:port` descriptor string.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(WeftError::Protocol(
                "empty broker descriptor".to_string(),
            ));
        }
        match descriptor.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port.parse().map_err(|_| {
                    WeftError::Protocol(format!("invalid broker port: {port}"))
                })?;
                Broker::new(vec![host.to_string()], None, port)
            }
            None => Broker::new(vec![descriptor.to_string()], None, DEFAULT_BROKER_PORT),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
