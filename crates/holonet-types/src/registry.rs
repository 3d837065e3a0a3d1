//! Process registry rows and node status.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a node as published in the registry.
///
/// The numeric values are the on-disk encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStatus {
    Offline = 0,
    Loading = 1,
    Online = 2,
}

impl NodeStatus {
    /// Decode the stored integer. Unknown values map to `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Offline),
            1 => Some(Self::Loading),
            2 => Some(Self::Online),
            _ => None,
        }
    }

    /// The stored integer.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Whether a node may move from `self` to `next` within one lifetime.
    ///
    /// The only legal path is Offline -> Loading -> Online -> Offline.
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Offline, Self::Loading)
                | (Self::Loading, Self::Online)
                | (Self::Online, Self::Offline)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Loading => write!(f, "loading"),
            Self::Online => write!(f, "online"),
        }
    }
}

/// One row of the shared process registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Unique node name (e.g. "chat", "connection").
    pub node_name: String,
    /// Address peers should dial.
    pub address: String,
    /// Port peers should dial.
    pub port: u16,
    /// Last published status.
    pub status: NodeStatus,
    /// Incremented on every process start.
    pub start_counter: u32,
}

impl RegistryEntry {
    /// `address:port` as a dialable string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_forward_transitions_allowed() {
        use NodeStatus::*;
        assert!(Offline.can_transition_to(Loading));
        assert!(Loading.can_transition_to(Online));
        assert!(Online.can_transition_to(Offline));

        assert!(!Offline.can_transition_to(Online));
        assert!(!Loading.can_transition_to(Offline));
        assert!(!Online.can_transition_to(Loading));
        assert!(!Loading.can_transition_to(Loading));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(NodeStatus::from_code(2), Some(NodeStatus::Online));
        assert_eq!(NodeStatus::from_code(7), None);
        assert_eq!(NodeStatus::Loading.code(), 1);
    }
}
