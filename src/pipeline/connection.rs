use super::affinity::{self, Affinity};
use super::chain::Pipeline;
use super::stage::{PipelineEvent, StageRef};
use crate::error::PipelineError;
use crate::model::ConnectionId;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

/// Handle to one physical connection and its pipeline task.
///
/// Stands in for the transport channel: it delivers inbound data, exposes the
/// pipeline for inspection and closes it. Cloning shares the same pipeline.
#[derive(Clone)]
pub struct Connection {
    affinity: Affinity,
}

impl Connection {
    /// Spawns the pipeline task for `id`. Reads flow immediately.
    pub fn spawn(id: ConnectionId, buffer_size: usize) -> (Self, JoinHandle<()>) {
        Self::start(Pipeline::new(id), buffer_size)
    }

    /// Spawns the pipeline task for `id` with reads disabled, so nothing
    /// passes before a coordinator has assembled the pipeline.
    pub fn spawn_gated(id: ConnectionId, buffer_size: usize) -> (Self, JoinHandle<()>) {
        Self::start(Pipeline::gated(id), buffer_size)
    }

    fn start(pipeline: Pipeline, buffer_size: usize) -> (Self, JoinHandle<()>) {
        let (worker, affinity) = affinity::new(pipeline, buffer_size);
        let handle = tokio::spawn(worker.run());
        (Self { affinity }, handle)
    }

    pub fn id(&self) -> &ConnectionId {
        self.affinity.connection()
    }

    pub fn affinity(&self) -> &Affinity {
        &self.affinity
    }

    pub fn is_active(&self) -> bool {
        self.affinity.is_active()
    }

    /// Appends a static stage, typically before any coordinator is attached.
    pub async fn add_last(&self, name: &str, stage: StageRef) -> Result<(), PipelineError> {
        let name = name.to_string();
        self.affinity
            .mutate("add_last", move |p| p.add_last(&name, stage))
            .await
    }

    /// Hands inbound data to the pipeline. Buffered while reads are disabled.
    pub async fn deliver(&self, msg: impl Into<String>) -> Result<(), PipelineError> {
        let msg = msg.into();
        self.affinity.mutate("deliver", move |p| p.inbound(msg)).await
    }

    pub async fn fire_user_event(&self, event: PipelineEvent) -> Result<(), PipelineError> {
        self.affinity
            .mutate("fire_user_event", move |p| p.fire_event(event))
            .await
    }

    pub async fn names(&self) -> Result<Vec<String>, PipelineError> {
        self.affinity.submit("names", |p| p.names()).await
    }

    /// Reads that reached the tail, in arrival order.
    pub async fn delivered(&self) -> Result<Vec<String>, PipelineError> {
        self.affinity
            .submit("delivered", |p| p.delivered().to_vec())
            .await
    }

    pub async fn tail_events(&self) -> Result<Vec<PipelineEvent>, PipelineError> {
        self.affinity
            .submit("tail_events", |p| p.tail_events().to_vec())
            .await
    }

    pub async fn is_read_enabled(&self) -> Result<bool, PipelineError> {
        self.affinity
            .submit("is_read_enabled", |p| p.is_read_enabled())
            .await
    }

    pub async fn read_enable_count(&self) -> Result<u64, PipelineError> {
        self.affinity
            .submit("read_enable_count", |p| p.read_enable_count())
            .await
    }

    /// Deactivates the pipeline. Every stage sees `handler_removed`.
    ///
    /// Closing an already closed connection is a no-op.
    #[instrument(skip(self), fields(connection = %self.id()))]
    pub async fn close(&self) {
        match self.affinity.submit("close", |p| p.deactivate()).await {
            Ok(()) => info!("Connection closed"),
            Err(_) => info!("Connection already closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::TagStage;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connection_delivers_and_closes() {
        let (conn, handle) = Connection::spawn(ConnectionId::new("conn-1"), 8);
        conn.add_last("a", Arc::new(TagStage::new("a"))).await.unwrap();
        conn.deliver("hi").await.unwrap();
        assert_eq!(conn.delivered().await.unwrap(), vec!["hi|a".to_string()]);

        conn.close().await;
        handle.await.unwrap();
        assert!(!conn.is_active());
        assert!(conn.deliver("late").await.unwrap_err().is_stale());

        // second close is harmless
        conn.close().await;
    }

    #[tokio::test]
    async fn test_gated_connection_holds_early_reads() {
        let (conn, _handle) = Connection::spawn_gated(ConnectionId::new("conn-2"), 8);
        conn.add_last("a", Arc::new(TagStage::new("a"))).await.unwrap();
        conn.deliver("early").await.unwrap();

        assert!(!conn.is_read_enabled().await.unwrap());
        assert!(conn.delivered().await.unwrap().is_empty());
        assert_eq!(conn.read_enable_count().await.unwrap(), 0);
        conn.close().await;
    }
}
