use crate::error::ProvisioningError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Shared, bounded pool for provisioning calls.
///
/// Every task acquires a permit before it starts, so at most `size` calls are
/// in flight across all connections. Tasks never run on a connection's
/// pipeline task.
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a task.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Spawns `task` once a permit is free.
    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<Result<T, ProvisioningError>>
    where
        F: Future<Output = Result<T, ProvisioningError>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| ProvisioningError::PoolClosed)?;
            task.await
        })
    }

    /// Runs `task` on the pool and waits for it.
    pub async fn run<F, T>(&self, task: F) -> Result<T, ProvisioningError>
    where
        F: Future<Output = Result<T, ProvisioningError>> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(task)
            .await
            .map_err(|_| ProvisioningError::PoolClosed)?
    }
}
