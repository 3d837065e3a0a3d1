//! Envelopes, opcode ranges, and link identity.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use uuid::Uuid;

/// Opcode of the control frame a node sends first on an outbound link.
/// The payload is the sender's node name.
pub const OP_HELLO: u32 = 0;

/// Unique identity of one live link. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId(pub Uuid);

impl LinkId {
    /// Generate a fresh link ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the remote end of a link is to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    /// The mandatory upstream peer dialed at startup.
    Upstream,
    /// A connection accepted on the local listener.
    Inbound,
    /// Any other outbound peer dialed at runtime.
    Peer,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => write!(f, "upstream"),
            Self::Inbound => write!(f, "inbound"),
            Self::Peer => write!(f, "peer"),
        }
    }
}

/// An inclusive, non-empty opcode range owned by one handler module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpcodeRange {
    first: u32,
    last: u32,
}

impl OpcodeRange {
    /// Build `first..=last`. Returns `None` when `first > last`.
    pub fn new(first: u32, last: u32) -> Option<Self> {
        (first <= last).then_some(Self { first, last })
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn contains(&self, opcode: u32) -> bool {
        (self.first..=self.last).contains(&opcode)
    }

    pub fn overlaps(&self, other: &OpcodeRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

impl TryFrom<RangeInclusive<u32>> for OpcodeRange {
    type Error = String;

    fn try_from(range: RangeInclusive<u32>) -> Result<Self, Self::Error> {
        let (first, last) = range.into_inner();
        Self::new(first, last).ok_or_else(|| format!("empty opcode range {first}..={last}"))
    }
}

impl fmt::Display for OpcodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#06x}, {:#06x}]", self.first, self.last)
    }
}

/// A decoded message unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message type.
    pub opcode: u32,
    /// Opaque opcode-specific body.
    pub payload: Bytes,
    /// The link it arrived on, or the link it must leave on.
    pub link: LinkId,
}

impl Envelope {
    pub fn new(opcode: u32, payload: impl Into<Bytes>, link: LinkId) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            link,
        }
    }

    /// Same opcode and payload, addressed to another link.
    pub fn readdress(&self, link: LinkId) -> Self {
        Self {
            opcode: self.opcode,
            payload: self.payload.clone(),
            link,
        }
    }
}
