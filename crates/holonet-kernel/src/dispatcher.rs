//! Message dispatcher: routes envelopes between links and handler modules.
//!
//! The dispatcher owns every link and every registered module. Opcode
//! ranges are registered before the loop starts and never change after
//! [`Dispatcher::start_handlers`]. Each tick, [`Dispatcher::process`] walks
//! the links round-robin and dispatches a bounded number of buffered
//! envelopes from each, preserving arrival order per link.

use crate::error::{KernelError, KernelResult};
use crate::module::{HandlerModule, ModuleContext, ModuleId};
use holonet_registry::{QueryCompletion, QueryHandle};
use holonet_types::envelope::{Envelope, LinkId, OpcodeRange, OP_HELLO};
use holonet_types::error::{HolonetError, HolonetResult};
use holonet_wire::{ClosedLink, LinkTable, PeerLink, WireError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Route {
    range: OpcodeRange,
    module: ModuleId,
}

/// Routes envelopes by opcode to the module that owns it.
pub struct Dispatcher {
    modules: Vec<Box<dyn HandlerModule>>,
    /// Sorted by range start; ranges never overlap.
    routes: Vec<Route>,
    links: LinkTable,
    queries: QueryHandle,
    frames_per_link: usize,
    /// Link position the next round-robin pass starts from.
    cursor: usize,
    sealed: bool,
    dispatched: u64,
}

impl Dispatcher {
    pub fn new(queries: QueryHandle, frames_per_link: usize) -> Self {
        Self {
            modules: Vec::new(),
            routes: Vec::new(),
            links: LinkTable::new(),
            queries,
            frames_per_link: frames_per_link.max(1),
            cursor: 0,
            sealed: false,
            dispatched: 0,
        }
    }

    /// Claim `range` for `handler`. Startup only.
    pub fn register_handler(
        &mut self,
        range: OpcodeRange,
        handler: Box<dyn HandlerModule>,
    ) -> HolonetResult<ModuleId> {
        if self.sealed {
            return Err(HolonetError::Configuration(format!(
                "cannot register '{}' after startup",
                handler.name()
            )));
        }
        if range.contains(OP_HELLO) {
            return Err(HolonetError::Configuration(format!(
                "'{}' claims {range}, which includes reserved opcode {OP_HELLO:#06x}",
                handler.name()
            )));
        }
        if let Some(clash) = self.routes.iter().find(|r| r.range.overlaps(&range)) {
            return Err(HolonetError::Configuration(format!(
                "'{}' claims {range}, overlapping '{}' at {}",
                handler.name(),
                self.modules[clash.module.0].name(),
                clash.range
            )));
        }

        let module = ModuleId(self.modules.len());
        info!(module = handler.name(), %range, "Handler registered");
        self.modules.push(handler);
        let at = self
            .routes
            .partition_point(|r| r.range.first() < range.first());
        self.routes.insert(at, Route { range, module });
        Ok(module)
    }

    /// Start every module in registration order and close registration.
    ///
    /// If a module fails, the ones already started are shut down in reverse
    /// order before the error is returned.
    pub fn start_handlers(&mut self) -> KernelResult<()> {
        for index in 0..self.modules.len() {
            let Self {
                modules,
                links,
                queries,
                ..
            } = self;
            let mut ctx = ModuleContext::new(ModuleId(index), links, queries);
            if let Err(reason) = modules[index].start(&mut ctx) {
                let module = modules[index].name().to_string();
                for started in modules[..index].iter_mut().rev() {
                    started.shutdown();
                }
                return Err(KernelError::ModuleStart { module, reason });
            }
        }
        self.sealed = true;
        Ok(())
    }

    /// Take ownership of an established link.
    pub fn adopt(&mut self, link: PeerLink) -> Result<LinkId, WireError> {
        self.links.insert(link)
    }

    fn route(&self, opcode: u32) -> Option<ModuleId> {
        let at = self.routes.partition_point(|r| r.range.last() < opcode);
        self.routes
            .get(at)
            .filter(|r| r.range.contains(opcode))
            .map(|r| r.module)
    }

    /// Hand an envelope to the module owning its opcode.
    ///
    /// An unowned opcode is logged and discarded and changes nothing.
    pub fn dispatch(&mut self, envelope: Envelope) -> HolonetResult<()> {
        let Some(module) = self.route(envelope.opcode) else {
            debug!(
                opcode = envelope.opcode,
                link = %envelope.link,
                "Discarding envelope with unknown opcode"
            );
            return Err(HolonetError::UnknownOpcode(envelope.opcode));
        };
        let Self {
            modules,
            links,
            queries,
            ..
        } = self;
        let mut ctx = ModuleContext::new(module, links, queries);
        modules[module.0].handle(&envelope, &mut ctx);
        self.dispatched += 1;
        Ok(())
    }

    /// Queue an envelope on its link. Missing or Closed links fail at once.
    pub fn send(&mut self, envelope: Envelope) -> HolonetResult<()> {
        let result = self.links.enqueue(envelope);
        if let Err(e) = &result {
            warn!(error = %e, "Send failed");
        }
        result
    }

    /// Dispatch buffered envelopes and reap closed links.
    ///
    /// Each link yields at most `frames_per_link` envelopes per call. The
    /// starting link rotates every call. Returns links removed this tick;
    /// their unsent envelopes have already been reported to their modules.
    pub fn process(&mut self) -> Vec<ClosedLink> {
        let count = self.links.len();
        if count > 0 {
            let start = self.cursor % count;
            for step in 0..count {
                let index = (start + step) % count;
                for _ in 0..self.frames_per_link {
                    let Some(envelope) = self.links.at_mut(index).and_then(|l| l.pop_inbound())
                    else {
                        break;
                    };
                    // Unknown opcodes are already logged.
                    let _ = self.dispatch(envelope);
                }
            }
            self.cursor = self.cursor.wrapping_add(1);
        }

        let mut closed = self.links.reap_closed();
        for link in &mut closed {
            for envelope in link.undelivered.drain(..) {
                self.report_undelivered(envelope);
            }
        }
        closed
    }

    fn report_undelivered(&mut self, envelope: Envelope) {
        let Some(module) = self.route(envelope.opcode) else {
            debug!(opcode = envelope.opcode, link = %envelope.link, "Undelivered control frame dropped");
            return;
        };
        let Self {
            modules,
            links,
            queries,
            ..
        } = self;
        let mut ctx = ModuleContext::new(module, links, queries);
        modules[module.0].delivery_failed(envelope, &mut ctx);
    }

    /// Route finished queries back to the modules that issued them.
    pub fn deliver_completions(&mut self, completions: Vec<QueryCompletion>) {
        for completion in completions {
            let module = ModuleId(completion.owner);
            let Self {
                modules,
                links,
                queries,
                ..
            } = self;
            let Some(handler) = modules.get_mut(module.0) else {
                warn!(owner = completion.owner, token = completion.token.0, "Query completion for unknown module");
                continue;
            };
            let mut ctx = ModuleContext::new(module, links, queries);
            handler.query_completed(completion, &mut ctx);
        }
    }

    /// Run every module's periodic work, in registration order.
    pub fn process_modules(&mut self) {
        let Self {
            modules,
            links,
            queries,
            ..
        } = self;
        for (index, module) in modules.iter_mut().enumerate() {
            let mut ctx = ModuleContext::new(ModuleId(index), links, queries);
            module.process(&mut ctx);
        }
    }

    /// Shut down and drop every module, newest first.
    pub fn release_handlers(&mut self) {
        self.routes.clear();
        while let Some(mut module) = self.modules.pop() {
            info!(module = module.name(), "Releasing handler");
            module.shutdown();
        }
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut LinkTable {
        &mut self.links
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Envelopes handed to a module so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Registered ranges in opcode order.
    pub fn ranges(&self) -> Vec<(OpcodeRange, ModuleId)> {
        self.routes.iter().map(|r| (r.range, r.module)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holonet_types::envelope::PeerRole;
    use holonet_wire::{LinkIo, RemoteEnd};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Records every callback into a shared log.
    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl HandlerModule for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn handle(&mut self, envelope: &Envelope, _ctx: &mut ModuleContext<'_>) {
            self.log.borrow_mut().push(format!(
                "{}:{}:{}",
                self.name,
                envelope.opcode,
                String::from_utf8_lossy(&envelope.payload)
            ));
        }

        fn delivery_failed(&mut self, envelope: Envelope, _ctx: &mut ModuleContext<'_>) {
            self.log
                .borrow_mut()
                .push(format!("{}:failed:{}", self.name, envelope.opcode));
        }

        fn shutdown(&mut self) {
            self.log.borrow_mut().push(format!("{}:shutdown", self.name));
        }
    }

    /// Replies on the arrival link with opcode + 1.
    struct Echo;

    impl HandlerModule for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn handle(&mut self, envelope: &Envelope, ctx: &mut ModuleContext<'_>) {
            let reply = Envelope::new(envelope.opcode + 1, envelope.payload.clone(), envelope.link);
            let _ = ctx.send(reply);
        }
    }

    fn range(first: u32, last: u32) -> OpcodeRange {
        OpcodeRange::new(first, last).unwrap()
    }

    fn recorder(name: &'static str, log: &Log) -> Box<dyn HandlerModule> {
        Box::new(Recorder {
            name,
            log: Rc::clone(log),
        })
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(QueryHandle::detached(), 2)
    }

    fn attach(d: &mut Dispatcher, peer: &str) -> (LinkId, RemoteEnd) {
        let (io, remote) = LinkIo::pair();
        let id = d
            .adopt(PeerLink::established(peer, PeerRole::Inbound, io))
            .unwrap();
        (id, remote)
    }

    #[test]
    fn test_opcode_routes_to_owning_range_only() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 100), recorder("first", &log))
            .unwrap();
        d.register_handler(range(101, 200), recorder("second", &log))
            .unwrap();
        d.start_handlers().unwrap();

        d.dispatch(Envelope::new(150, &b"x"[..], LinkId::new()))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["second:150:x".to_string()]);
    }

    #[test]
    fn test_range_edges() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(101, 200), recorder("second", &log))
            .unwrap();
        d.register_handler(range(1, 100), recorder("first", &log))
            .unwrap();

        for op in [1, 100, 101, 200] {
            d.dispatch(Envelope::new(op, &b""[..], LinkId::new()))
                .unwrap();
        }
        assert!(matches!(
            d.dispatch(Envelope::new(201, &b""[..], LinkId::new())),
            Err(HolonetError::UnknownOpcode(201))
        ));
        assert_eq!(
            *log.borrow(),
            vec!["first:1:", "first:100:", "second:101:", "second:200:"]
        );
    }

    #[test]
    fn test_overlapping_range_rejected() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 100), recorder("first", &log))
            .unwrap();
        let err = d
            .register_handler(range(50, 150), recorder("second", &log))
            .unwrap_err();
        assert!(matches!(err, HolonetError::Configuration(ref m) if m.contains("overlapping")));
        assert_eq!(d.module_count(), 1);
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let log = Log::default();
        let mut d = dispatcher();
        assert!(d
            .register_handler(range(0, 10), recorder("bad", &log))
            .is_err());
    }

    #[test]
    fn test_registration_closed_after_start() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 10), recorder("first", &log))
            .unwrap();
        d.start_handlers().unwrap();
        assert!(matches!(
            d.register_handler(range(20, 30), recorder("late", &log)),
            Err(HolonetError::Configuration(_))
        ));
    }

    #[test]
    fn test_unknown_opcode_leaves_state_unchanged() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 100), recorder("first", &log))
            .unwrap();
        let (link, _remote) = attach(&mut d, "zone");
        d.dispatch(Envelope::new(5, &b""[..], link)).unwrap();

        let ranges = d.ranges();
        let dispatched = d.dispatched();
        let links = d.links().len();
        let cursor = d.cursor;

        let result = d.dispatch(Envelope::new(4000, &b"junk"[..], link));
        assert!(matches!(result, Err(HolonetError::UnknownOpcode(4000))));
        assert_eq!(d.ranges(), ranges);
        assert_eq!(d.dispatched(), dispatched);
        assert_eq!(d.links().len(), links);
        assert_eq!(d.cursor, cursor);
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn test_per_link_order_preserved() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 100), recorder("m", &log))
            .unwrap();
        let (_link, remote) = attach(&mut d, "zone");
        for i in 0..7u8 {
            remote.deliver(1, vec![b'a' + i]);
        }
        d.links_mut().pump_all();

        // Two frames per tick; four ticks drain seven frames.
        for _ in 0..4 {
            d.process();
        }
        assert_eq!(
            *log.borrow(),
            vec!["m:1:a", "m:1:b", "m:1:c", "m:1:d", "m:1:e", "m:1:f", "m:1:g"]
        );
    }

    #[test]
    fn test_busy_link_does_not_starve_others() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 100), recorder("m", &log))
            .unwrap();
        let (_busy, busy_remote) = attach(&mut d, "busy");
        let (_quiet, quiet_remote) = attach(&mut d, "quiet");
        for _ in 0..50 {
            busy_remote.deliver(1, &b"b"[..]);
        }
        quiet_remote.deliver(2, &b"q"[..]);
        d.links_mut().pump_all();

        d.process();
        let handled = log.borrow().clone();
        assert_eq!(handled.len(), 3);
        assert!(handled.contains(&"m:2:q".to_string()));
    }

    #[test]
    fn test_send_on_closed_link_fails() {
        let mut d = dispatcher();
        let (link, _remote) = attach(&mut d, "zone");
        d.links_mut().get_mut(link).unwrap().close("test");

        for opcode in [0, 1, 500, u32::MAX] {
            let err = d
                .send(Envelope::new(opcode, &b"payload"[..], link))
                .unwrap_err();
            assert!(matches!(err, HolonetError::DeliveryFailed { .. }));
        }
        assert!(matches!(
            d.send(Envelope::new(1, &b""[..], LinkId::new())),
            Err(HolonetError::DeliveryFailed { .. })
        ));
    }

    #[test]
    fn test_queued_sends_reported_when_link_drops() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 100), recorder("m", &log))
            .unwrap();
        let (link, remote) = attach(&mut d, "zone");
        d.send(Envelope::new(7, &b"x"[..], link)).unwrap();
        d.send(Envelope::new(8, &b"y"[..], link)).unwrap();
        remote.disconnect("reset");
        d.links_mut().pump_all();

        let closed = d.process();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].reason, "reset");
        assert_eq!(*log.borrow(), vec!["m:failed:7", "m:failed:8"]);
        assert!(d.links().is_empty());
    }

    #[test]
    fn test_handler_reply_goes_out_on_arrival_link() {
        let mut d = dispatcher();
        d.register_handler(range(10, 19), Box::new(Echo)).unwrap();
        let (_link, mut remote) = attach(&mut d, "zone");
        remote.deliver(10, &b"hi"[..]);
        d.links_mut().pump_all();
        d.process();
        d.links_mut().pump_all();

        let sent = remote.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].opcode, 11);
        assert_eq!(&sent[0].payload[..], b"hi");
    }

    #[test]
    fn test_release_in_reverse_order() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 10), recorder("a", &log)).unwrap();
        d.register_handler(range(11, 20), recorder("b", &log)).unwrap();
        d.register_handler(range(21, 30), recorder("c", &log)).unwrap();
        d.release_handlers();
        assert_eq!(*log.borrow(), vec!["c:shutdown", "b:shutdown", "a:shutdown"]);
        assert_eq!(d.module_count(), 0);
    }

    struct Refuses;

    impl HandlerModule for Refuses {
        fn name(&self) -> &str {
            "refuses"
        }

        fn start(&mut self, _ctx: &mut ModuleContext<'_>) -> Result<(), String> {
            Err("not today".into())
        }

        fn handle(&mut self, _envelope: &Envelope, _ctx: &mut ModuleContext<'_>) {}
    }

    #[test]
    fn test_failed_start_unwinds_started_modules() {
        let log = Log::default();
        let mut d = dispatcher();
        d.register_handler(range(1, 10), recorder("a", &log)).unwrap();
        d.register_handler(range(11, 20), recorder("b", &log)).unwrap();
        d.register_handler(range(21, 30), Box::new(Refuses)).unwrap();

        let err = d.start_handlers().unwrap_err();
        assert!(matches!(err, KernelError::ModuleStart { ref module, .. } if module == "refuses"));
        assert_eq!(*log.borrow(), vec!["b:shutdown", "a:shutdown"]);
    }
}
