//! Handler modules shipped with the chat node.
//!
//! Each module owns a fixed opcode range:
//!
//! | Module         | Opcodes      |
//! |----------------|--------------|
//! | [`StatusModule`] | 1..=15     |
//! | [`RosterModule`] | 16..=31    |
//! | [`RelayModule`]  | 32..=4095  |

pub mod relay;
pub mod roster;
pub mod status;

pub use relay::RelayModule;
pub use roster::RosterModule;
pub use status::StatusModule;

use holonet_kernel::Registration;
use holonet_types::envelope::OpcodeRange;
use holonet_types::error::{HolonetError, HolonetResult};
use std::ops::RangeInclusive;

pub const STATUS_OPCODES: RangeInclusive<u32> = 1..=15;
pub const ROSTER_OPCODES: RangeInclusive<u32> = 16..=31;
pub const RELAY_OPCODES: RangeInclusive<u32> = 32..=4095;

fn range(opcodes: RangeInclusive<u32>) -> HolonetResult<OpcodeRange> {
    OpcodeRange::try_from(opcodes).map_err(HolonetError::Configuration)
}

/// Every module the chat node runs, in registration order.
pub fn registrations(node_name: &str) -> HolonetResult<Vec<Registration>> {
    Ok(vec![
        Registration::new(range(STATUS_OPCODES)?, StatusModule::new(node_name)),
        Registration::new(range(ROSTER_OPCODES)?, RosterModule::new()),
        Registration::new(range(RELAY_OPCODES)?, RelayModule::new()),
    ])
}
