use super::state::CoordinatorSnapshot;
use crate::error::{OrchestratorError, PipelineError, ProvisioningError, TeardownError};
use crate::model::{ConfigHandle, ConnectionId, DesiredSet, Key};
use tokio::sync::oneshot;

/// One-shot response channel used by the coordinator.
pub type Response<T> = oneshot::Sender<Result<T, OrchestratorError>>;

/// Resolution of a successful `activate`: every desired stage is in place
/// and data flow is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ready {
    pub connection: ConnectionId,
    /// Assembly cycle that completed; increases by one per activate/modify.
    pub generation: u64,
}

/// Commands accepted by the coordinator mailbox.
#[derive(Debug)]
pub enum CoordinatorRequest {
    Activate {
        desired: DesiredSet,
        respond_to: Response<Ready>,
    },
    Modify {
        desired: DesiredSet,
        respond_to: Response<()>,
    },
    Close {
        respond_to: Response<()>,
    },
    Snapshot {
        respond_to: Response<CoordinatorSnapshot>,
    },
}

/// Completions reported back to the coordinator by the tasks it spawned and
/// by its anchor stage.
#[derive(Debug)]
pub(crate) enum CoordinatorEvent {
    Created {
        key: Key,
        handle: ConfigHandle,
    },
    ProvisionFailed {
        seq: u64,
        key: Key,
        error: ProvisioningError,
    },
    Pruned {
        seq: u64,
    },
    Inserted {
        seq: u64,
        key: Key,
        result: Result<(), PipelineError>,
    },
    InsertionAborted {
        seq: u64,
        error: PipelineError,
    },
    Assembled {
        generation: u64,
    },
    AnchorRemoved,
    TeardownDone {
        failures: Vec<TeardownError>,
    },
}
