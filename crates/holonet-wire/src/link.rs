//! Peer links and the table that owns them.
//!
//! A [`PeerLink`] is one connection to one peer identity. It moves through
//! Connecting -> Established -> Closed exactly once; reconnecting means
//! building a new link. Socket work happens elsewhere: a link talks to its
//! I/O tasks only through the channels in [`LinkIo`], and [`PeerLink::pump`]
//! drains them without waiting.

use crate::message::Frame;
use crate::transport::WireError;
use holonet_types::envelope::{Envelope, LinkId, PeerRole};
use holonet_types::error::HolonetError;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a closed link waits for its writer to return unsent frames.
pub const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Established,
    /// Terminal.
    Closed,
}

/// Something the I/O tasks report about a link.
#[derive(Debug)]
pub enum LinkEvent {
    /// A complete inbound frame.
    Frame(Frame),
    /// The socket is gone. Frames the writer still held are returned.
    Closed {
        reason: String,
        undelivered: Vec<Frame>,
    },
}

/// The tick-loop side of a link's I/O channels.
pub struct LinkIo {
    events: UnboundedReceiver<LinkEvent>,
    outgoing: Option<UnboundedSender<Frame>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

/// The far side of an in-memory [`LinkIo`].
pub struct RemoteEnd {
    /// Push inbound frames or a close event into the link.
    pub events: UnboundedSender<LinkEvent>,
    /// Frames the link flushed for sending.
    pub outgoing: UnboundedReceiver<Frame>,
}

impl RemoteEnd {
    /// Deliver a frame as if it arrived from the network.
    pub fn deliver(&self, opcode: u32, payload: impl Into<bytes::Bytes>) {
        let _ = self.events.send(LinkEvent::Frame(Frame::new(opcode, payload)));
    }

    /// Report the connection as lost.
    pub fn disconnect(&self, reason: &str) {
        let _ = self.events.send(LinkEvent::Closed {
            reason: reason.to_string(),
            undelivered: Vec::new(),
        });
    }

    /// Everything flushed so far.
    pub fn drain_sent(&mut self) -> Vec<Frame> {
        let mut sent = Vec::new();
        while let Ok(frame) = self.outgoing.try_recv() {
            sent.push(frame);
        }
        sent
    }
}

impl LinkIo {
    /// Channels wired to spawned socket tasks. `reader` is aborted on drop.
    ///
    /// When a `writer` is given, a closed link keeps listening for the
    /// frames it hands back before it can be reaped.
    pub fn new(
        events: UnboundedReceiver<LinkEvent>,
        outgoing: UnboundedSender<Frame>,
        reader: Option<JoinHandle<()>>,
        writer: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            events,
            outgoing: Some(outgoing),
            reader,
            writer,
        }
    }

    /// Stop reading and let the writer finish what it already holds.
    fn stop(&mut self) {
        self.outgoing = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    fn writer_finished(&self) -> bool {
        self.writer.as_ref().map_or(true, |w| w.is_finished())
    }

    /// An in-memory pair with no socket behind it.
    pub fn pair() -> (Self, RemoteEnd) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Self::new(events_rx, out_tx, None, None),
            RemoteEnd {
                events: events_tx,
                outgoing: out_rx,
            },
        )
    }
}

impl Drop for LinkIo {
    fn drop(&mut self) {
        // The writer exits on its own once `outgoing` is dropped.
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// A live connection to exactly one peer.
pub struct PeerLink {
    id: LinkId,
    peer: String,
    role: PeerRole,
    state: LinkState,
    inbound: VecDeque<Envelope>,
    outbound: VecDeque<Envelope>,
    undelivered: Vec<Envelope>,
    announced: Option<String>,
    close_reason: Option<String>,
    io: Option<LinkIo>,
    /// I/O of a closed link whose writer has not exited yet.
    draining: Option<(LinkIo, Instant)>,
}

impl PeerLink {
    /// A new link in Connecting.
    pub fn connecting(peer: impl Into<String>, role: PeerRole) -> Self {
        Self {
            id: LinkId::new(),
            peer: peer.into(),
            role,
            state: LinkState::Connecting,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            undelivered: Vec::new(),
            announced: None,
            close_reason: None,
            io: None,
            draining: None,
        }
    }

    /// A new link that is already Established over `io`.
    pub fn established(peer: impl Into<String>, role: PeerRole, io: LinkIo) -> Self {
        let mut link = Self::connecting(peer, role);
        link.establish(io);
        link
    }

    /// Connecting -> Established. Ignored in any other state.
    pub fn establish(&mut self, io: LinkIo) {
        if self.state != LinkState::Connecting {
            warn!(link = %self.id, peer = %self.peer, state = ?self.state, "Ignoring establish on non-connecting link");
            return;
        }
        self.io = Some(io);
        self.state = LinkState::Established;
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Peer identity: node name, or remote address until the peer says hello.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == LinkState::Closed
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    /// Frames received but not yet dispatched.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Queue an envelope for sending. Fails immediately on a Closed link.
    pub fn enqueue(&mut self, envelope: Envelope) -> Result<(), HolonetError> {
        if self.state == LinkState::Closed {
            return Err(HolonetError::DeliveryFailed {
                link: self.id,
                opcode: envelope.opcode,
            });
        }
        self.outbound.push_back(envelope);
        Ok(())
    }

    /// Next received envelope, in arrival order.
    pub fn pop_inbound(&mut self) -> Option<Envelope> {
        self.inbound.pop_front()
    }

    /// Move I/O results into the receive buffer and flush the send queue.
    ///
    /// Returns the name a peer announced in a hello frame, if one arrived.
    pub fn pump(&mut self) -> Option<String> {
        if self.state != LinkState::Established {
            return None;
        }
        self.pump_events();
        if self.state == LinkState::Established {
            self.flush();
        }
        self.announced.take()
    }

    fn pump_events(&mut self) {
        loop {
            let Some(io) = self.io.as_mut() else {
                return;
            };
            match io.events.try_recv() {
                Ok(LinkEvent::Frame(frame)) => {
                    if let Some(name) = frame.hello_name() {
                        self.announced = Some(name);
                    } else {
                        self.inbound.push_back(frame.into_envelope(self.id));
                    }
                }
                Ok(LinkEvent::Closed {
                    reason,
                    undelivered,
                }) => {
                    let id = self.id;
                    self.undelivered
                        .extend(undelivered.into_iter().map(|f| f.into_envelope(id)));
                    self.close(&reason);
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.close("link I/O tasks stopped");
                    return;
                }
            }
        }
    }

    fn flush(&mut self) {
        let Some(outgoing) = self.io.as_ref().and_then(|io| io.outgoing.as_ref()) else {
            return;
        };
        while let Some(envelope) = self.outbound.pop_front() {
            if let Err(failed) = outgoing.send(Frame::from(envelope.clone())) {
                debug!(link = %self.id, opcode = failed.0.opcode, "Writer gone while flushing");
                self.outbound.push_front(envelope);
                self.close("link writer stopped");
                return;
            }
        }
    }

    /// Transition to Closed. Unsent envelopes become undelivered.
    pub fn close(&mut self, reason: &str) {
        if self.state == LinkState::Closed {
            return;
        }
        info!(link = %self.id, peer = %self.peer, role = %self.role, reason, "Link closed");
        self.state = LinkState::Closed;
        self.close_reason = Some(reason.to_string());
        self.undelivered.extend(self.outbound.drain(..));
        if let Some(mut io) = self.io.take() {
            io.stop();
            if io.writer.is_some() {
                self.draining = Some((io, Instant::now()));
            }
        }
    }

    /// Collect frames the writer returned after close.
    ///
    /// True once nothing more can come back: the writer exited, or it
    /// outlived [`WRITER_DRAIN_TIMEOUT`] and was aborted.
    pub fn settle(&mut self) -> bool {
        let id = self.id;
        let Some((io, since)) = self.draining.as_mut() else {
            return true;
        };
        let finished = io.writer_finished();
        while let Ok(event) = io.events.try_recv() {
            if let LinkEvent::Closed { undelivered, .. } = event {
                self.undelivered
                    .extend(undelivered.into_iter().map(|f| f.into_envelope(id)));
            }
        }
        if finished {
            self.draining = None;
            return true;
        }
        if since.elapsed() >= WRITER_DRAIN_TIMEOUT {
            warn!(link = %id, peer = %self.peer, "Link writer did not exit, abandoning its frames");
            if let Some(writer) = io.writer.take() {
                writer.abort();
            }
            self.draining = None;
            return true;
        }
        false
    }

    /// Envelopes that will never be sent.
    pub fn take_undelivered(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.undelivered)
    }
}

/// A link removed from the table after closing.
#[derive(Debug)]
pub struct ClosedLink {
    pub id: LinkId,
    pub peer: String,
    pub role: PeerRole,
    pub reason: String,
    pub undelivered: Vec<Envelope>,
}

/// All links owned by a node, in insertion order.
#[derive(Default)]
pub struct LinkTable {
    links: Vec<PeerLink>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self { links: Vec::new() }
    }

    /// Adopt a link. No two live links may share a peer identity.
    pub fn insert(&mut self, link: PeerLink) -> Result<LinkId, WireError> {
        if self.by_peer(link.peer()).is_some() {
            return Err(WireError::DuplicatePeer(link.peer().to_string()));
        }
        let id = link.id();
        debug!(link = %id, peer = %link.peer(), role = %link.role(), "Link adopted");
        self.links.push(link);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, id: LinkId) -> Option<&PeerLink> {
        self.links.iter().find(|l| l.id() == id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut PeerLink> {
        self.links.iter_mut().find(|l| l.id() == id)
    }

    /// Link at a position; positions are stable until the next reap.
    pub fn at_mut(&mut self, index: usize) -> Option<&mut PeerLink> {
        self.links.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.iter()
    }

    /// The live link for a peer identity.
    pub fn by_peer(&self, peer: &str) -> Option<&PeerLink> {
        self.links
            .iter()
            .find(|l| !l.is_closed() && l.peer() == peer)
    }

    /// The first live link with a role.
    pub fn by_role(&self, role: PeerRole) -> Option<&PeerLink> {
        self.links.iter().find(|l| !l.is_closed() && l.role() == role)
    }

    /// Queue an envelope on the link it names.
    pub fn enqueue(&mut self, envelope: Envelope) -> Result<(), HolonetError> {
        match self.get_mut(envelope.link) {
            Some(link) => link.enqueue(envelope),
            None => Err(HolonetError::DeliveryFailed {
                link: envelope.link,
                opcode: envelope.opcode,
            }),
        }
    }

    /// Pump every link and bind announced names to identities.
    pub fn pump_all(&mut self) {
        for i in 0..self.links.len() {
            let Some(name) = self.links[i].pump() else {
                continue;
            };
            let taken = self
                .links
                .iter()
                .enumerate()
                .any(|(j, l)| j != i && !l.is_closed() && l.peer() == name);
            let link = &mut self.links[i];
            if taken {
                warn!(link = %link.id(), peer = %name, "Peer already linked, dropping duplicate");
                link.close("duplicate peer identity");
            } else if link.peer() != name {
                info!(link = %link.id(), from = %link.peer(), peer = %name, "Peer identified");
                link.peer = name;
            }
        }
    }

    /// Close every link.
    pub fn close_all(&mut self, reason: &str) {
        for link in &mut self.links {
            link.close(reason);
        }
    }

    /// Remove Closed links whose receive buffer is empty and whose writer
    /// has returned everything it still held.
    pub fn reap_closed(&mut self) -> Vec<ClosedLink> {
        let mut reaped = Vec::new();
        let mut i = 0;
        while i < self.links.len() {
            let link = &mut self.links[i];
            if link.is_closed() && link.pending_inbound() == 0 && link.settle() {
                let mut link = self.links.remove(i);
                reaped.push(ClosedLink {
                    id: link.id(),
                    peer: link.peer().to_string(),
                    role: link.role(),
                    reason: link.close_reason().unwrap_or("closed").to_string(),
                    undelivered: link.take_undelivered(),
                });
            } else {
                i += 1;
            }
        }
        reaped
    }
}
