//! # Coordinator Client
//!
//! Typed, cloneable handle to one connection's coordinator. Every call is a
//! message to the actor's mailbox answered on a oneshot channel.

use super::message::{CoordinatorRequest, Ready};
use super::state::CoordinatorSnapshot;
use crate::error::OrchestratorError;
use crate::model::{ConnectionId, DesiredSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

#[derive(Clone)]
pub struct CoordinatorClient {
    connection: ConnectionId,
    sender: mpsc::Sender<CoordinatorRequest>,
    closed: Arc<AtomicBool>,
}

impl CoordinatorClient {
    pub(crate) fn new(
        connection: ConnectionId,
        sender: mpsc::Sender<CoordinatorRequest>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            sender,
            closed,
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// `true` once a close has been requested, by a caller or by the
    /// pipeline removing the coordinator's anchor.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Provisions and inserts every handler of `desired`.
    ///
    /// Resolves once all stages are in the pipeline in desired order and
    /// reads are enabled. Fails fast on the first provisioning or supply
    /// error.
    #[instrument(skip(self, desired), fields(connection = %self.connection, keys = desired.len()))]
    pub async fn activate(&self, desired: DesiredSet) -> Result<Ready, OrchestratorError> {
        let (respond_to, response) = oneshot::channel();
        self.send(CoordinatorRequest::Activate {
            desired,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| OrchestratorError::ActorDropped)?
    }

    /// Replaces the desired set of a ready pipeline.
    ///
    /// Removed keys lose their stage and record; added keys are provisioned
    /// and inserted after their predecessor.
    #[instrument(skip(self, desired), fields(connection = %self.connection, keys = desired.len()))]
    pub async fn modify(&self, desired: DesiredSet) -> Result<(), OrchestratorError> {
        let (respond_to, response) = oneshot::channel();
        self.send(CoordinatorRequest::Modify {
            desired,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| OrchestratorError::ActorDropped)?
    }

    /// Deletes every owned record. Idempotent; a repeated close resolves
    /// once the first teardown has finished.
    #[instrument(skip(self), fields(connection = %self.connection))]
    pub async fn close(&self) -> Result<(), OrchestratorError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Close already requested");
        }
        let (respond_to, response) = oneshot::channel();
        self.send(CoordinatorRequest::Close { respond_to }).await?;
        response.await.map_err(|_| OrchestratorError::ActorDropped)?
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot, OrchestratorError> {
        let (respond_to, response) = oneshot::channel();
        self.send(CoordinatorRequest::Snapshot { respond_to }).await?;
        response.await.map_err(|_| OrchestratorError::ActorDropped)?
    }

    async fn send(&self, request: CoordinatorRequest) -> Result<(), OrchestratorError> {
        self.sender
            .send(request)
            .await
            .map_err(|_| OrchestratorError::ActorClosed)
    }
}
