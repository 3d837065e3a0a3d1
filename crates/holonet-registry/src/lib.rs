//! Process registry for Holonet nodes.
//!
//! Nodes discover each other through one shared table. Each node owns its
//! own row and is the only writer of it; peers only read. Writes are
//! synchronous so a status is durable before anyone is expected to see it.
//!
//! - **RegistryClient**: self registration, status writes, peer lookup
//! - **BoundQuery / RowRecord**: declarative row mapping, checked at setup
//! - **QueryPool**: worker-backed queries whose results are polled per tick

pub mod client;
pub mod mapping;
pub mod migration;
pub mod pool;

pub use client::RegistryClient;
pub use mapping::{BoundQuery, RowRecord};
pub use pool::{QueryCompletion, QueryHandle, QueryPool, QueryRequest, QueryRows, QueryToken, SqlValue};
