//! Core kernel for a Holonet node.
//!
//! The kernel owns every subsystem of one node process and drives them from
//! a single cooperative loop. Nothing in a tick waits: socket and database
//! work finishes in the background and is picked up by polling on a later
//! tick.
//!
//! - **Node**: startup ordering, the tick loop, and ordered teardown
//! - **Dispatcher**: opcode routing, link ownership, handler modules
//! - **HandlerModule**: the contract pluggable modules implement
//! - **HeartbeatTimer**: fixed-interval liveness log line
//! - **Supervisor**: shutdown requests from signals or the operator

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod module;
pub mod node;
pub mod supervisor;

pub use dispatcher::Dispatcher;
pub use error::{KernelError, KernelResult};
pub use module::{HandlerModule, ModuleContext, ModuleId, Registration};
pub use node::{Node, NodeState};
pub use supervisor::Supervisor;
