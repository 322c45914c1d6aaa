//! Broker latency racing
//!
//! Before connecting, every (host, port) candidate across all configured
//! brokers is probed with a short TCP connect to measure reachability and
//! latency. Candidates are then attempted in ascending latency order, with
//! unreachable hosts sorted last (they still get a chance, after everything
//! that answered).

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::broker::Broker;

/// One probe-able (host, port) pair and the broker it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub host: String,
    pub port: u16,
    pub broker: Broker,
    pub latency: Option<Duration>,
}

/// Probe every candidate concurrently and return them fastest-first.
pub(crate) async fn brokers_by_connect_time(
    brokers: &[Broker],
    probe_timeout: Duration,
) -> Vec<Candidate> {
    let probes = brokers.iter().flat_map(|broker| {
        broker.hosts().iter().map(move |host| {
            let host = host.clone();
            let port = broker.port();
            let broker = broker.clone();
            async move {
                let latency = probe(&host, port, probe_timeout).await;
                Candidate {
                    host,
                    port,
                    broker,
                    latency,
                }
            }
        })
    });

    let mut candidates = futures::future::join_all(probes).await;
    sort_by_latency(&mut candidates);
    candidates
}

async fn probe(host: &str, port: u16, probe_timeout: Duration) -> Option<Duration> {
    let start = Instant::now();
    match timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => {
            let elapsed = start.elapsed();
            debug!(host, port, ?elapsed, "broker probe succeeded");
            Some(elapsed)
        }
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "broker probe failed");
            None
        }
        Err(_) => {
            debug!(host, port, "broker probe timed out");
            None
        }
    }
}

/// Ascending latency; unreachable (`None`) candidates sort last.
pub(crate) fn sort_by_latency(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| match (a.latency, b.latency) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(a), Some(b)) => a.cmp(&b),
    });
}
