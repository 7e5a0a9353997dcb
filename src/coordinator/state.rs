use crate::model::{ConfigHandle, ConnectionId, DesiredSet, Key};
use crate::pipeline::StageRef;
use std::fmt::Display;

/// Coordinator lifecycle.
///
/// ```text
/// Inactive ─activate─► Provisioning ─barrier─► Inserting ─sentinel─► Ready
///                            ▲                                        │
///                            └──────────────── modify ────────────────┘
///
/// any ─close─► Closing ─teardown─► Closed        failed op ─► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Inactive,
    Provisioning,
    Inserting,
    Ready,
    /// An operation failed. Only `close` is accepted.
    Failed,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Closing | LifecycleState::Closed)
    }
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Inactive => "inactive",
            LifecycleState::Provisioning => "provisioning",
            LifecycleState::Inserting => "inserting",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
            LifecycleState::Closing => "closing",
            LifecycleState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Handler instance for one key, single resolution.
#[derive(Debug, Clone)]
pub enum PendingSupply {
    Waiting,
    Supplied(StageRef),
    Failed(String),
}

impl PendingSupply {
    pub fn is_supplied(&self) -> bool {
        matches!(self, PendingSupply::Supplied(_))
    }
}

/// Whether a key's stage has been placed. Presence guards against inserting twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionRecord {
    Pending,
    Inserted,
}

/// Point-in-time view of a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSnapshot {
    pub connection: ConnectionId,
    pub state: LifecycleState,
    pub desired: DesiredSet,
    /// Owned configuration handles, ordered by key.
    pub handles: Vec<(Key, ConfigHandle)>,
    /// Keys whose handler has been supplied, ordered.
    pub supplied: Vec<Key>,
    /// Keys whose stage is in the pipeline, ordered.
    pub inserted: Vec<Key>,
    /// Lifecycle operations waiting behind the one in flight.
    pub queued: usize,
    pub generation: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(LifecycleState::Provisioning.to_string(), "provisioning");
        assert!(LifecycleState::Closing.is_terminal());
        assert!(!LifecycleState::Failed.is_terminal());
    }
}
