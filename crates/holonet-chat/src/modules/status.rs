//! Node status queries.

use holonet_kernel::{HandlerModule, ModuleContext};
use holonet_types::envelope::{Envelope, PeerRole};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

pub const OP_STATUS_REQUEST: u32 = 1;
pub const OP_STATUS_REPLY: u32 = 2;

/// Payload of a status reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node: String,
    pub uptime_secs: u64,
    pub links: usize,
    pub upstream_connected: bool,
    pub requests_served: u64,
}

/// Answers status requests on the link they arrived on.
pub struct StatusModule {
    node_name: String,
    started: Instant,
    served: u64,
}

impl StatusModule {
    pub fn new(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            started: Instant::now(),
            served: 0,
        }
    }

    fn report(&self, ctx: &ModuleContext<'_>) -> StatusReport {
        StatusReport {
            node: self.node_name.clone(),
            uptime_secs: self.started.elapsed().as_secs(),
            links: ctx.link_count(),
            upstream_connected: ctx.upstream().is_some(),
            requests_served: self.served,
        }
    }
}

impl HandlerModule for StatusModule {
    fn name(&self) -> &str {
        "status"
    }

    fn start(&mut self, ctx: &mut ModuleContext<'_>) -> Result<(), String> {
        self.started = Instant::now();
        if ctx.links_with_role(PeerRole::Upstream).is_empty() {
            warn!("Status module starting without an upstream link");
        }
        Ok(())
    }

    fn handle(&mut self, envelope: &Envelope, ctx: &mut ModuleContext<'_>) {
        if envelope.opcode != OP_STATUS_REQUEST {
            debug!(opcode = envelope.opcode, "Status: ignoring opcode");
            return;
        }
        self.served += 1;
        let payload = match serde_json::to_vec(&self.report(ctx)) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Status: failed to encode report");
                return;
            }
        };
        if let Err(e) = ctx.send(Envelope::new(OP_STATUS_REPLY, payload, envelope.link)) {
            debug!(error = %e, "Status: requester left before the reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holonet_kernel::ModuleId;
    use holonet_registry::QueryHandle;
    use holonet_wire::{LinkIo, LinkTable, PeerLink};

    #[test]
    fn test_request_answered_on_arrival_link() {
        let mut links = LinkTable::new();
        let (up_io, _up) = LinkIo::pair();
        links
            .insert(PeerLink::established("connection", PeerRole::Upstream, up_io))
            .unwrap();
        let (io, mut remote) = LinkIo::pair();
        let zone = links
            .insert(PeerLink::established("zone", PeerRole::Inbound, io))
            .unwrap();
        let queries = QueryHandle::detached();
        let mut module = StatusModule::new("chat");

        {
            let mut ctx = ModuleContext::new(ModuleId(0), &mut links, &queries);
            module.handle(&Envelope::new(OP_STATUS_REQUEST, &b""[..], zone), &mut ctx);
            module.handle(&Envelope::new(9, &b""[..], zone), &mut ctx);
        }
        links.pump_all();

        let sent = remote.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, OP_STATUS_REPLY);
        let report: StatusReport = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(report.node, "chat");
        assert_eq!(report.links, 2);
        assert!(report.upstream_connected);
        assert_eq!(report.requests_served, 1);
    }
}
