//! Relay between downstream links and the upstream link.
//!
//! Traffic from any inbound or peer link is forwarded upstream unchanged.
//! Traffic from upstream is fanned out to every live downstream link.
//! Upstream-bound envelopes that could not be delivered are held and resent
//! once an upstream link is available, up to [`MAX_ATTEMPTS`] sends each.
//! Downstream-bound envelopes are not retried; the peer is gone.

use holonet_kernel::{HandlerModule, ModuleContext};
use holonet_types::envelope::{Envelope, LinkId, PeerRole};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Sends attempted per upstream-bound envelope before it is dropped.
pub const MAX_ATTEMPTS: u32 = 3;

/// Upstream-bound envelopes held while no upstream link is available.
pub const MAX_HELD: usize = 1024;

struct Held {
    envelope: Envelope,
    attempts: u32,
}

struct Retry {
    envelope: Envelope,
    attempts: u32,
}

#[derive(Default)]
pub struct RelayModule {
    /// Waiting to be resent upstream.
    held: VecDeque<Held>,
    /// Every upstream link this module has sent on.
    upstream_links: HashSet<LinkId>,
    /// Resent envelopes and the attempts spent on them. First sends are not
    /// recorded; an envelope with no entry has used one attempt.
    retried: VecDeque<Retry>,
    forwarded: u64,
    dropped: u64,
}

impl RelayModule {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn held(&self) -> usize {
        self.held.len()
    }

    #[cfg(test)]
    fn forwarded(&self) -> u64 {
        self.forwarded
    }

    #[cfg(test)]
    fn dropped(&self) -> u64 {
        self.dropped
    }

    #[cfg(test)]
    fn retried(&self) -> usize {
        self.retried.len()
    }

    fn hold(&mut self, envelope: Envelope, attempts: u32) {
        if attempts >= MAX_ATTEMPTS {
            warn!(opcode = envelope.opcode, attempts, "Relay: giving up on envelope");
            self.dropped += 1;
            return;
        }
        if self.held.len() >= MAX_HELD {
            if let Some(oldest) = self.held.pop_front() {
                warn!(opcode = oldest.envelope.opcode, "Relay: hold queue full, dropping oldest");
                self.dropped += 1;
            }
        }
        self.held.push_back(Held { envelope, attempts });
    }

    /// Send toward upstream, or hold if there is none.
    fn send_upstream(&mut self, envelope: Envelope, attempts: u32, ctx: &mut ModuleContext<'_>) {
        let Some(upstream) = ctx.upstream() else {
            self.hold(envelope, attempts);
            return;
        };
        let outgoing = envelope.readdress(upstream);
        match ctx.send(outgoing.clone()) {
            Ok(()) => {
                self.upstream_links.insert(upstream);
                if attempts > 0 {
                    self.record_retry(outgoing, attempts + 1);
                }
                self.forwarded += 1;
            }
            Err(e) => {
                debug!(error = %e, "Relay: upstream send refused");
                self.hold(envelope, attempts + 1);
            }
        }
    }

    fn record_retry(&mut self, envelope: Envelope, attempts: u32) {
        if self.retried.len() >= MAX_HELD {
            self.retried.pop_front();
        }
        self.retried.push_back(Retry { envelope, attempts });
    }

    /// Attempts spent on an envelope that came back undelivered.
    fn attempts_for(&mut self, envelope: &Envelope) -> u32 {
        match self.retried.iter().position(|r| r.envelope == *envelope) {
            Some(index) => self.retried.remove(index).map_or(1, |r| r.attempts),
            None => 1,
        }
    }
}

impl HandlerModule for RelayModule {
    fn name(&self) -> &str {
        "relay"
    }

    fn process(&mut self, ctx: &mut ModuleContext<'_>) {
        let Some(upstream) = ctx.upstream() else {
            return;
        };
        // Retries queued on links that are gone have already been reported.
        self.retried.retain(|r| r.envelope.link == upstream);

        if self.held.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.held);
        info!(count = held.len(), "Relay: resending held envelopes");
        for Held { envelope, attempts } in held {
            self.send_upstream(envelope, attempts, ctx);
        }
    }

    fn handle(&mut self, envelope: &Envelope, ctx: &mut ModuleContext<'_>) {
        match ctx.role_of(envelope.link) {
            Some(PeerRole::Upstream) => {
                for link in ctx
                    .links_with_role(PeerRole::Inbound)
                    .into_iter()
                    .chain(ctx.links_with_role(PeerRole::Peer))
                {
                    if ctx.send(envelope.readdress(link)).is_ok() {
                        self.forwarded += 1;
                    }
                }
            }
            Some(_) => self.send_upstream(envelope.clone(), 0, ctx),
            None => debug!(link = %envelope.link, "Relay: envelope from unknown link"),
        }
    }

    fn delivery_failed(&mut self, envelope: Envelope, _ctx: &mut ModuleContext<'_>) {
        if !self.upstream_links.contains(&envelope.link) {
            debug!(opcode = envelope.opcode, link = %envelope.link, "Relay: downstream delivery failed");
            self.dropped += 1;
            return;
        }
        let attempts = self.attempts_for(&envelope);
        self.hold(envelope, attempts);
    }

    fn shutdown(&mut self) {
        info!(
            forwarded = self.forwarded,
            dropped = self.dropped,
            held = self.held.len(),
            retried = self.retried.len(),
            "Relay: stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holonet_kernel::ModuleId;
    use holonet_registry::QueryHandle;
    use holonet_wire::{LinkIo, LinkTable, PeerLink, RemoteEnd};

    fn attach(links: &mut LinkTable, peer: &str, role: PeerRole) -> (LinkId, RemoteEnd) {
        let (io, remote) = LinkIo::pair();
        let id = links.insert(PeerLink::established(peer, role, io)).unwrap();
        (id, remote)
    }

    fn run<F: FnOnce(&mut ModuleContext<'_>)>(links: &mut LinkTable, f: F) {
        let queries = QueryHandle::detached();
        let mut ctx = ModuleContext::new(ModuleId(2), links, &queries);
        f(&mut ctx);
    }

    #[test]
    fn test_downstream_traffic_goes_upstream() {
        let mut links = LinkTable::new();
        let (_up, mut up_remote) = attach(&mut links, "connection", PeerRole::Upstream);
        let (zone, _zone_remote) = attach(&mut links, "zone", PeerRole::Inbound);
        let mut relay = RelayModule::new();

        run(&mut links, |ctx| {
            relay.handle(&Envelope::new(100, &b"say"[..], zone), ctx)
        });
        links.pump_all();

        let sent = up_remote.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, 100);
        assert_eq!(relay.forwarded(), 1);
    }

    #[test]
    fn test_upstream_traffic_fans_out() {
        let mut links = LinkTable::new();
        let (up, mut up_remote) = attach(&mut links, "connection", PeerRole::Upstream);
        let (_a, mut a_remote) = attach(&mut links, "zone-a", PeerRole::Inbound);
        let (_b, mut b_remote) = attach(&mut links, "zone-b", PeerRole::Peer);
        let mut relay = RelayModule::new();

        run(&mut links, |ctx| {
            relay.handle(&Envelope::new(200, &b"news"[..], up), ctx)
        });
        links.pump_all();

        assert_eq!(a_remote.drain_sent().len(), 1);
        assert_eq!(b_remote.drain_sent().len(), 1);
        assert!(up_remote.drain_sent().is_empty());
    }

    #[test]
    fn test_held_until_upstream_returns() {
        let mut links = LinkTable::new();
        let (zone, _zone_remote) = attach(&mut links, "zone", PeerRole::Inbound);
        let mut relay = RelayModule::new();

        run(&mut links, |ctx| {
            relay.handle(&Envelope::new(100, &b"a"[..], zone), ctx);
            relay.process(ctx);
        });
        assert_eq!(relay.held(), 1);

        let (_up, mut up_remote) = attach(&mut links, "connection", PeerRole::Upstream);
        run(&mut links, |ctx| relay.process(ctx));
        links.pump_all();
        assert_eq!(relay.held(), 0);
        assert_eq!(up_remote.drain_sent().len(), 1);
    }

    #[test]
    fn test_undelivered_upstream_envelope_retried_then_dropped() {
        let mut links = LinkTable::new();
        let (zone, _zone_remote) = attach(&mut links, "zone", PeerRole::Inbound);
        let mut relay = RelayModule::new();

        let (mut up, _) = attach(&mut links, "connection-0", PeerRole::Upstream);
        run(&mut links, |ctx| {
            relay.handle(&Envelope::new(300, &b"x"[..], zone), ctx)
        });

        for round in 1..=MAX_ATTEMPTS {
            // The upstream drops with the envelope still queued.
            let link = links.get_mut(up).unwrap();
            link.close("reset");
            let undelivered = link.take_undelivered();
            assert_eq!(undelivered.len(), 1, "round {round}");
            links.reap_closed();
            run(&mut links, |ctx| {
                for envelope in undelivered {
                    relay.delivery_failed(envelope, ctx);
                }
            });

            if round < MAX_ATTEMPTS {
                assert_eq!(relay.held(), 1);
                let (next, _) = attach(&mut links, &format!("connection-{round}"), PeerRole::Upstream);
                up = next;
                run(&mut links, |ctx| relay.process(ctx));
                assert_eq!(relay.held(), 0);
            }
        }
        assert_eq!(relay.held(), 0);
        assert_eq!(relay.dropped(), 1);
    }

    #[test]
    fn test_downstream_failure_not_retried() {
        let mut links = LinkTable::new();
        let (zone, _zone_remote) = attach(&mut links, "zone", PeerRole::Inbound);
        let mut relay = RelayModule::new();
        run(&mut links, |ctx| {
            relay.delivery_failed(Envelope::new(400, &b""[..], zone), ctx)
        });
        assert_eq!(relay.held(), 0);
        assert_eq!(relay.dropped(), 1);
    }

    #[test]
    fn test_healthy_upstream_keeps_no_retry_state() {
        let mut links = LinkTable::new();
        let (_up, mut up_remote) = attach(&mut links, "connection", PeerRole::Upstream);
        let (zone, _zone_remote) = attach(&mut links, "zone", PeerRole::Inbound);
        let mut relay = RelayModule::new();

        for i in 0..10_000u32 {
            run(&mut links, |ctx| {
                relay.handle(&Envelope::new(100 + i % 7, i.to_be_bytes().to_vec(), zone), ctx);
                relay.process(ctx);
            });
            links.pump_all();
        }

        assert_eq!(relay.forwarded(), 10_000);
        assert_eq!(relay.retried(), 0);
        assert_eq!(up_remote.drain_sent().len(), 10_000);
    }

    #[test]
    fn test_retry_state_is_capped() {
        let mut links = LinkTable::new();
        let (zone, _zone_remote) = attach(&mut links, "zone", PeerRole::Inbound);
        let mut relay = RelayModule::new();

        let fail_upstream = |links: &mut LinkTable, relay: &mut RelayModule, up: LinkId| {
            let link = links.get_mut(up).unwrap();
            link.close("reset");
            let undelivered = link.take_undelivered();
            links.reap_closed();
            run(links, |ctx| {
                for envelope in undelivered {
                    relay.delivery_failed(envelope, ctx);
                }
            });
        };

        let (first, _first_remote) = attach(&mut links, "connection-0", PeerRole::Upstream);
        run(&mut links, |ctx| {
            for i in 0..(MAX_HELD as u32 * 2) {
                relay.handle(&Envelope::new(100, i.to_be_bytes().to_vec(), zone), ctx);
            }
        });
        assert_eq!(relay.retried(), 0);
        fail_upstream(&mut links, &mut relay, first);
        assert_eq!(relay.held(), MAX_HELD);

        // Resends are tracked, never more than the hold queue.
        let (second, _second_remote) = attach(&mut links, "connection-1", PeerRole::Upstream);
        run(&mut links, |ctx| relay.process(ctx));
        assert_eq!(relay.held(), 0);
        assert_eq!(relay.retried(), MAX_HELD);

        // Failed resends are matched by content and released.
        fail_upstream(&mut links, &mut relay, second);
        assert_eq!(relay.retried(), 0);
        assert_eq!(relay.held(), MAX_HELD);
    }
}
