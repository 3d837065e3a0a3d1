//! Core types for the Holonet node substrate.
//!
//! This crate defines the data shared by the registry client, the wire
//! layer, and the kernel: registry rows, node status, envelopes and opcode
//! ranges, node configuration, and the error taxonomy. It contains no I/O.

pub mod config;
pub mod envelope;
pub mod error;
pub mod registry;
