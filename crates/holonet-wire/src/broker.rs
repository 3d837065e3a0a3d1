//! Connection broker: turns registry entries into live links.
//!
//! Two paths:
//!
//! - [`ConnectionBroker::connect`] dials once with a timeout. It is only used
//!   during startup, where waiting is allowed and failure is fatal.
//! - [`ConnectionBroker::connect_later`] queues a runtime attempt. Attempts
//!   run as background tasks; [`ConnectionBroker::process`] collects their
//!   results each tick and reschedules failures with capped exponential
//!   backoff, so a tick never waits on a dial.

use crate::link::PeerLink;
use crate::message::Frame;
use crate::transport::{spawn_link_io, WireError};
use holonet_types::config::ReconnectConfig;
use holonet_types::envelope::{Envelope, PeerRole};
use holonet_types::registry::RegistryEntry;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

/// Backoff for runtime reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// 0.0 = no jitter, 1.0 = up to double the delay (still capped).
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(config.min_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`,
    /// clamped to `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let min_ms = self.min_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let base = min_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        let capped = base.min(max_ms);

        if self.jitter <= 0.0 {
            return Duration::from_millis(capped);
        }
        let frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let with_jitter = (capped as f64) * (1.0 + frac * self.jitter);
        Duration::from_millis((with_jitter as u64).min(max_ms))
    }
}

struct PendingConnect {
    entry: RegistryEntry,
    link: PeerLink,
    /// Failed attempts so far.
    failures: u32,
    due: Instant,
    in_flight: bool,
}

struct DialResult {
    peer: String,
    outcome: Result<TcpStream, String>,
}

/// Dials peers found in the registry.
pub struct ConnectionBroker {
    node_name: String,
    max_frame_size: u32,
    connect_timeout: Duration,
    policy: ReconnectPolicy,
    pending: Vec<PendingConnect>,
    results_tx: UnboundedSender<DialResult>,
    results_rx: UnboundedReceiver<DialResult>,
}

impl ConnectionBroker {
    pub fn new(
        node_name: impl Into<String>,
        max_frame_size: u32,
        connect_timeout: Duration,
        policy: ReconnectPolicy,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            node_name: node_name.into(),
            max_frame_size,
            connect_timeout,
            policy,
            pending: Vec::new(),
            results_tx,
            results_rx,
        }
    }

    /// Dial `entry` and wait up to `timeout`. Startup only.
    ///
    /// The returned link is Established and already carries a hello frame.
    pub async fn connect(
        &self,
        entry: &RegistryEntry,
        role: PeerRole,
        timeout: Duration,
    ) -> Result<PeerLink, WireError> {
        let mut link = PeerLink::connecting(entry.node_name.clone(), role);
        info!(peer = %entry.node_name, endpoint = %entry.endpoint(), "Broker: connecting");

        let stream = dial(entry, timeout).await.map_err(|reason| {
            link.close(&reason);
            WireError::ConnectionFailed {
                peer: entry.node_name.clone(),
                endpoint: entry.endpoint(),
                reason,
            }
        })?;

        self.finish(&mut link, stream);
        info!(peer = %entry.node_name, link = %link.id(), "Broker: connected");
        Ok(link)
    }

    /// Queue a runtime connection attempt. It starts on the next `process`.
    pub fn connect_later(&mut self, entry: RegistryEntry, role: PeerRole) {
        if self.pending.iter().any(|p| p.entry.node_name == entry.node_name) {
            return;
        }
        info!(peer = %entry.node_name, "Broker: reconnect scheduled");
        let link = PeerLink::connecting(entry.node_name.clone(), role);
        self.pending.push(PendingConnect {
            entry,
            link,
            failures: 0,
            due: Instant::now(),
            in_flight: false,
        });
    }

    /// Peers with an attempt queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Start due attempts and collect finished ones. Never waits.
    ///
    /// Returns links that became Established this tick.
    pub fn process(&mut self, now: Instant) -> Vec<PeerLink> {
        let mut ready = Vec::new();

        while let Ok(result) = self.results_rx.try_recv() {
            let Some(index) = self
                .pending
                .iter()
                .position(|p| p.in_flight && p.entry.node_name == result.peer)
            else {
                continue;
            };
            match result.outcome {
                Ok(stream) => {
                    let mut pending = self.pending.remove(index);
                    self.finish(&mut pending.link, stream);
                    info!(
                        peer = %pending.entry.node_name,
                        link = %pending.link.id(),
                        attempts = pending.failures + 1,
                        "Broker: reconnected"
                    );
                    ready.push(pending.link);
                }
                Err(reason) => {
                    let pending = &mut self.pending[index];
                    let delay = self.policy.backoff(pending.failures);
                    pending.failures += 1;
                    pending.in_flight = false;
                    pending.due = now + delay;
                    pending.link.close(&reason);
                    pending.link = PeerLink::connecting(pending.entry.node_name.clone(), pending.link.role());
                    warn!(
                        peer = %pending.entry.node_name,
                        failures = pending.failures,
                        retry_in_ms = delay.as_millis() as u64,
                        %reason,
                        "Broker: connection attempt failed"
                    );
                }
            }
        }

        for pending in self.pending.iter_mut() {
            if pending.in_flight || pending.due > now {
                continue;
            }
            pending.in_flight = true;
            let entry = pending.entry.clone();
            let timeout = self.connect_timeout;
            let results = self.results_tx.clone();
            tokio::spawn(async move {
                let outcome = dial(&entry, timeout).await;
                let _ = results.send(DialResult {
                    peer: entry.node_name,
                    outcome,
                });
            });
        }

        ready
    }

    fn finish(&self, link: &mut PeerLink, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %link.peer(), error = %e, "Broker: set_nodelay failed");
        }
        link.establish(spawn_link_io(stream, self.max_frame_size));
        let hello = Frame::hello(&self.node_name);
        // A freshly established link accepts sends.
        let _ = link.enqueue(Envelope::new(hello.opcode, hello.payload, link.id()));
    }
}

async fn dial(entry: &RegistryEntry, timeout: Duration) -> Result<TcpStream, String> {
    let endpoint = (entry.address.as_str(), entry.port);
    match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", timeout.as_millis())),
    }
}
