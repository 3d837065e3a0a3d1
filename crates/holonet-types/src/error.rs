//! Shared error types for the Holonet node.

use crate::envelope::LinkId;
use crate::registry::NodeStatus;
use thiserror::Error;

/// Failures raised by the process registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No row exists for the requested node.
    #[error("Registry entry not found: {0}")]
    NotFound(String),

    /// More than one row matched a node name.
    #[error("Registry is inconsistent: {rows} rows for node '{node}'")]
    Ambiguous {
        /// The node name that matched more than once.
        node: String,
        /// How many rows matched.
        rows: usize,
    },

    /// A node tried to write a row it does not own.
    #[error("Node '{writer}' may not write the registry row of '{target}'")]
    NotOwner {
        /// The registered name of this process.
        writer: String,
        /// The row it tried to write.
        target: String,
    },

    /// A requested status change is not a legal lifecycle step.
    #[error("Illegal status transition for '{node}': {from} -> {to}")]
    InvalidTransition {
        /// The node whose status was being written.
        node: String,
        /// Status before the write.
        from: NodeStatus,
        /// Status that was requested.
        to: NodeStatus,
    },

    /// A record mapping does not match the columns a query returns.
    #[error("Column mapping mismatch for {record}: expected {expected:?}, query returns {found:?}")]
    Mapping {
        /// The record type being mapped.
        record: &'static str,
        /// Columns the record expects.
        expected: Vec<String>,
        /// Columns the query produces.
        found: Vec<String>,
    },

    /// The underlying database rejected or failed a statement.
    #[error("Database error: {0}")]
    Database(String),
}

/// Top-level error type for the Holonet node.
#[derive(Error, Debug)]
pub enum HolonetError {
    /// Configuration is missing or invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A registry operation failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A peer could not be reached.
    #[error("Connection to '{peer}' failed: {reason}")]
    ConnectionFailed {
        /// Peer identity (node name or address).
        peer: String,
        /// Why the attempt failed.
        reason: String,
    },

    /// No handler owns the opcode.
    #[error("Unknown opcode: {0:#06x}")]
    UnknownOpcode(u32),

    /// An envelope could not be handed to its link.
    #[error("Delivery of opcode {opcode:#06x} on link {link} failed")]
    DeliveryFailed {
        /// Target link.
        link: LinkId,
        /// Opcode of the undeliverable envelope.
        opcode: u32,
    },

    /// An asynchronous database request failed or could not be queued.
    #[error("Database error: {0}")]
    Database(String),
}

/// Alias for Result with HolonetError.
pub type HolonetResult<T> = Result<T, HolonetError>;
