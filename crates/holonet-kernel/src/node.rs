//! The node: assembles all subsystems and drives the tick loop.
//!
//! Boot is all or nothing: every step before the Online write must succeed,
//! and any failure returns before Online is written. A row left behind by a
//! failed boot keeps status Loading.

use crate::dispatcher::Dispatcher;
use crate::error::{KernelError, KernelResult};
use crate::heartbeat::{Clock, HeartbeatTimer, MonotonicClock};
use crate::module::Registration;
use crate::supervisor::Supervisor;
use holonet_registry::RegistryClient;
use holonet_types::config::NodeConfig;
use holonet_types::envelope::PeerRole;
use holonet_types::error::HolonetError;
use holonet_types::registry::{NodeStatus, RegistryEntry};
use holonet_wire::{ConnectionBroker, ReconnectPolicy, Transport, WireError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Initializing => write!(f, "initializing"),
            NodeState::Running => write!(f, "running"),
            NodeState::Draining => write!(f, "draining"),
            NodeState::Terminated => write!(f, "terminated"),
        }
    }
}

/// One running node.
///
/// Fields holding subsystems are declared newest first, so dropping a node
/// tears them down in reverse construction order.
pub struct Node {
    dispatcher: Dispatcher,
    broker: ConnectionBroker,
    transport: Transport,
    registry: RegistryClient,
    /// Upstream entry from the startup lookup; reused for reconnects.
    upstream: RegistryEntry,
    heartbeat: HeartbeatTimer,
    clock: Arc<dyn Clock>,
    supervisor: Arc<Supervisor>,
    config: NodeConfig,
    state: NodeState,
    ticks: u64,
}

impl Node {
    /// Boot a node on the monotonic clock.
    pub async fn boot(
        config: NodeConfig,
        registrations: Vec<Registration>,
        supervisor: Arc<Supervisor>,
    ) -> KernelResult<Self> {
        Self::boot_with_clock(config, registrations, supervisor, Arc::new(MonotonicClock::new()))
            .await
    }

    /// Boot a node with an explicit clock for the heartbeat.
    pub async fn boot_with_clock(
        config: NodeConfig,
        registrations: Vec<Registration>,
        supervisor: Arc<Supervisor>,
        clock: Arc<dyn Clock>,
    ) -> KernelResult<Self> {
        config.validate()?;
        let name = config.node_name.clone();
        info!(node = %name, state = %NodeState::Initializing, "Booting node");

        let mut registry = RegistryClient::open(&config.database.path)?;

        let transport = Transport::bind(
            &config.network.bind_address,
            config.network.bind_port,
            config.network.max_frame_size,
        )
        .await?;
        let advertise = config
            .network
            .advertise_address
            .clone()
            .unwrap_or_else(|| config.network.bind_address.clone());
        registry.register_self(&name, &advertise, transport.local_addr().port())?;

        let upstream = registry.lookup_peer(&config.upstream_peer)?;
        let broker = ConnectionBroker::new(
            name.clone(),
            config.network.max_frame_size,
            config.network.connect_timeout(),
            ReconnectPolicy::from(&config.reconnect),
        );
        let link = broker
            .connect(&upstream, PeerRole::Upstream, config.network.connect_timeout())
            .await
            .map_err(|e| match e {
                WireError::ConnectionFailed {
                    peer,
                    endpoint,
                    reason,
                } => KernelError::Holonet(HolonetError::ConnectionFailed {
                    peer,
                    reason: format!("{endpoint}: {reason}"),
                }),
                other => KernelError::Wire(other),
            })?;

        let mut dispatcher = Dispatcher::new(registry.query_handle(), config.network.frames_per_link);
        dispatcher.adopt(link)?;
        for registration in registrations {
            dispatcher.register_handler(registration.range, registration.module)?;
        }
        dispatcher.start_handlers()?;

        if let Err(e) = registry.set_status(&name, NodeStatus::Online) {
            dispatcher.release_handlers();
            return Err(e.into());
        }

        let heartbeat = HeartbeatTimer::new(config.tick.heartbeat_interval(), clock.now());
        info!(
            node = %name,
            listen = %transport.local_addr(),
            upstream = %upstream.node_name,
            modules = dispatcher.module_count(),
            "Node online"
        );

        Ok(Self {
            dispatcher,
            broker,
            transport,
            registry,
            upstream,
            heartbeat,
            clock,
            supervisor,
            config,
            state: NodeState::Running,
            ticks: 0,
        })
    }

    /// Run ticks until shutdown is requested, then drain.
    pub async fn run(mut self) -> KernelResult<()> {
        let mut ticker = tokio::time::interval(self.config.tick.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.supervisor.is_shutting_down() {
            self.tick();
            ticker.tick().await;
        }
        self.drain()
    }

    /// One loop iteration. Never waits.
    pub fn tick(&mut self) {
        self.transport.process(self.dispatcher.links_mut());
        for link in self.broker.process(Instant::now()) {
            let peer = link.peer().to_string();
            if let Err(e) = self.dispatcher.adopt(link) {
                warn!(peer = %peer, error = %e, "Dropping reconnected link");
            }
        }

        for closed in self.dispatcher.process() {
            if closed.role == PeerRole::Upstream && closed.peer == self.upstream.node_name {
                warn!(peer = %closed.peer, reason = %closed.reason, "Upstream link lost");
                self.broker
                    .connect_later(self.upstream.clone(), PeerRole::Upstream);
            } else {
                debug!(peer = %closed.peer, role = %closed.role, reason = %closed.reason, "Link reaped");
            }
        }

        let completions = self.registry.pump();
        if !completions.is_empty() {
            self.dispatcher.deliver_completions(completions);
        }

        if self.heartbeat.poll(self.clock.now()) {
            info!(
                node = %self.config.node_name,
                ticks = self.ticks,
                links = self.dispatcher.links().len(),
                dispatched = self.dispatcher.dispatched(),
                reconnecting = self.broker.pending(),
                "Heartbeat"
            );
        }

        self.dispatcher.process_modules();
        self.ticks += 1;
    }

    /// Publish Offline and release everything in reverse order.
    ///
    /// Offline is written before any handler is released. A failed Offline
    /// write is returned after teardown completes.
    pub fn drain(mut self) -> KernelResult<()> {
        self.state = NodeState::Draining;
        info!(node = %self.config.node_name, state = %self.state, "Draining node");

        let offline = self
            .registry
            .set_status(&self.config.node_name, NodeStatus::Offline);
        if let Err(e) = &offline {
            error!(node = %self.config.node_name, error = %e, "Failed to publish Offline");
        }

        self.dispatcher.release_handlers();
        self.dispatcher.links_mut().close_all("node shutting down");
        // Flush close-time reports; the handlers are gone so nothing is routed.
        let _ = self.dispatcher.process();

        let ticks = self.ticks;
        let name = self.config.node_name.clone();
        drop(self);
        info!(node = %name, ticks, state = %NodeState::Terminated, "Node terminated");
        offline.map_err(KernelError::from)
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Ticks completed.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Heartbeat beats fired.
    pub fn beats(&self) -> u64 {
        self.heartbeat.beats()
    }

    /// Runtime reconnects queued or in flight.
    pub fn reconnecting(&self) -> usize {
        self.broker.pending()
    }
}
