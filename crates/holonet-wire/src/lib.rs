//! Holonet wire layer: links between cluster nodes.
//!
//! Every link is an ordered, reliable TCP byte stream carrying frames of
//! `length | opcode | payload`. Socket I/O runs in small tokio tasks; the
//! node's tick loop only ever polls their channels, so nothing here blocks
//! a tick.
//!
//! ## Architecture
//!
//! - **Transport**: local listener; turns accepted sockets into links and
//!   moves frames between sockets and link buffers each tick
//! - **PeerLink / LinkTable**: per-peer send queue and receive buffer
//! - **ConnectionBroker**: dials registry entries, with timed startup
//!   connects and backoff-scheduled runtime reconnects
//! - **Frame**: the opcode + payload unit on the wire

pub mod broker;
pub mod link;
pub mod message;
pub mod transport;

pub use broker::{ConnectionBroker, ReconnectPolicy};
pub use link::{ClosedLink, LinkIo, LinkState, LinkTable, PeerLink, RemoteEnd};
pub use message::Frame;
pub use transport::{Transport, WireError};
