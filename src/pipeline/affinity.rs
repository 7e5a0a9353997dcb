//! Per-connection execution affinity.
//!
//! Each connection owns exactly one [`AffinityLoop`] task. The task owns the
//! [`Pipeline`] and runs submitted jobs one at a time, in submission order.
//! Every mutation (insert, remove, read gating) goes through
//! [`Affinity::submit`], even when it originates on a provisioning worker.
//!
//! Once the pipeline is deactivated the loop exits. Jobs still queued are
//! dropped and their submitters observe [`PipelineError::StaleMutation`].

use super::chain::Pipeline;
use crate::error::PipelineError;
use crate::model::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

type Job = Box<dyn FnOnce(&mut Pipeline) + Send>;

/// Creates the loop/handle pair for a fresh pipeline.
pub fn new(pipeline: Pipeline, buffer_size: usize) -> (AffinityLoop, Affinity) {
    let (sender, receiver) = mpsc::channel(buffer_size.max(1));
    let connection = pipeline.connection().clone();
    (
        AffinityLoop { receiver, pipeline },
        Affinity { connection, sender },
    )
}

/// The serial task owning a connection's pipeline.
pub struct AffinityLoop {
    receiver: mpsc::Receiver<Job>,
    pipeline: Pipeline,
}

impl AffinityLoop {
    pub async fn run(mut self) {
        let connection = self.pipeline.connection().clone();
        info!(%connection, "Pipeline loop started");

        while let Some(job) = self.receiver.recv().await {
            job(&mut self.pipeline);
            if !self.pipeline.is_active() {
                break;
            }
        }

        self.receiver.close();
        self.pipeline.deactivate();
        info!(%connection, stages = self.pipeline.len(), "Pipeline loop stopped");
    }
}

/// Cloneable handle for submitting work onto a connection's pipeline task.
#[derive(Clone)]
pub struct Affinity {
    connection: ConnectionId,
    sender: mpsc::Sender<Job>,
}

impl Affinity {
    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    /// `false` once the pipeline task has stopped.
    pub fn is_active(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Runs `work` on the pipeline task and returns its result.
    ///
    /// Jobs from one submitter run in the order they were submitted.
    pub async fn submit<R, F>(&self, operation: &str, work: F) -> Result<R, PipelineError>
    where
        F: FnOnce(&mut Pipeline) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (respond_to, response) = oneshot::channel();
        let job: Job = Box::new(move |pipeline| {
            let _ = respond_to.send(work(pipeline));
        });
        if self.sender.send(job).await.is_err() {
            debug!(connection = %self.connection, operation, "Submit after pipeline stopped");
            return Err(self.stale(operation));
        }
        response.await.map_err(|_| self.stale(operation))
    }

    /// Like [`submit`](Self::submit) for jobs that themselves return a
    /// pipeline result.
    pub async fn mutate<R, F>(&self, operation: &str, work: F) -> Result<R, PipelineError>
    where
        F: FnOnce(&mut Pipeline) -> Result<R, PipelineError> + Send + 'static,
        R: Send + 'static,
    {
        self.submit(operation, work).await?
    }

    fn stale(&self, operation: &str) -> PipelineError {
        PipelineError::StaleMutation {
            connection: self.connection.clone(),
            operation: operation.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::TagStage;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let (worker, affinity) = new(Pipeline::new(ConnectionId::new("conn-a")), 8);
        let handle = tokio::spawn(worker.run());

        for name in ["a", "b", "c"] {
            affinity
                .mutate("add", move |p| p.add_last(name, Arc::new(TagStage::new(name))))
                .await
                .unwrap();
        }
        let names = affinity.submit("names", |p| p.names()).await.unwrap();
        assert_eq!(names, vec!["a", "b", "c", "tail"]);

        affinity
            .submit("close", |p| p.deactivate())
            .await
            .unwrap();
        handle.await.unwrap();
        assert!(!affinity.is_active());
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_stale() {
        let (worker, affinity) = new(Pipeline::new(ConnectionId::new("conn-b")), 8);
        let handle = tokio::spawn(worker.run());
        affinity.submit("close", |p| p.deactivate()).await.unwrap();
        handle.await.unwrap();

        let err = affinity.submit("names", |p| p.names()).await.unwrap_err();
        assert!(err.is_stale());
    }
}
