//! Handler modules: pluggable units that own an opcode range.
//!
//! A module gets two entry points from the tick loop: periodic work once
//! per tick, and a callback for each envelope whose opcode falls in its
//! range. Neither may block. Work that would wait (database reads) is
//! submitted through the [`ModuleContext`] and comes back later as a
//! completion.

use holonet_registry::{QueryCompletion, QueryHandle, QueryToken, SqlValue};
use holonet_types::envelope::{Envelope, LinkId, OpcodeRange, PeerRole};
use holonet_types::error::HolonetResult;
use holonet_wire::LinkTable;
use tracing::warn;

/// Position of a module in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub usize);

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// A module together with the opcodes it will own.
pub struct Registration {
    pub range: OpcodeRange,
    pub module: Box<dyn HandlerModule>,
}

impl Registration {
    pub fn new(range: OpcodeRange, module: impl HandlerModule + 'static) -> Self {
        Self {
            range,
            module: Box::new(module),
        }
    }
}

/// The contract every handler module implements.
pub trait HandlerModule {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Called once after registration, before the node reports Online.
    /// An error aborts startup.
    fn start(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<(), String> {
        Ok(())
    }

    /// Periodic work, once per tick.
    fn process(&mut self, _ctx: &mut ModuleContext<'_>) {}

    /// An envelope with an opcode in this module's range.
    fn handle(&mut self, envelope: &Envelope, ctx: &mut ModuleContext<'_>);

    /// An envelope with an opcode in this module's range could not be sent.
    fn delivery_failed(&mut self, envelope: Envelope, _ctx: &mut ModuleContext<'_>) {
        warn!(
            module = self.name(),
            opcode = envelope.opcode,
            link = %envelope.link,
            "Envelope dropped: delivery failed"
        );
    }

    /// A query this module submitted has finished.
    fn query_completed(&mut self, _completion: QueryCompletion, _ctx: &mut ModuleContext<'_>) {}

    /// Called during draining, in reverse registration order.
    fn shutdown(&mut self) {}
}

/// What a module may touch while it runs.
pub struct ModuleContext<'a> {
    module: ModuleId,
    links: &'a mut LinkTable,
    queries: &'a QueryHandle,
}

impl<'a> ModuleContext<'a> {
    pub fn new(module: ModuleId, links: &'a mut LinkTable, queries: &'a QueryHandle) -> Self {
        Self {
            module,
            links,
            queries,
        }
    }

    pub fn module_id(&self) -> ModuleId {
        self.module
    }

    /// Queue an envelope on the link it names.
    pub fn send(&mut self, envelope: Envelope) -> HolonetResult<()> {
        self.links.enqueue(envelope)
    }

    /// The live upstream link, if connected.
    pub fn upstream(&self) -> Option<LinkId> {
        self.links.by_role(PeerRole::Upstream).map(|l| l.id())
    }

    /// The live link for a named peer.
    pub fn link_for(&self, peer: &str) -> Option<LinkId> {
        self.links.by_peer(peer).map(|l| l.id())
    }

    /// Role tag of a link, while the link exists.
    pub fn role_of(&self, link: LinkId) -> Option<PeerRole> {
        self.links.get(link).map(|l| l.role())
    }

    /// Live links with a given role, in table order.
    pub fn links_with_role(&self, role: PeerRole) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|l| !l.is_closed() && l.role() == role)
            .map(|l| l.id())
            .collect()
    }

    /// Number of links the node currently owns.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Submit an asynchronous query. The result arrives via `query_completed`.
    pub fn query(&self, sql: &str, params: Vec<SqlValue>) -> HolonetResult<QueryToken> {
        self.queries.submit(self.module.0, sql, params)
    }
}
