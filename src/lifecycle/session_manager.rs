use crate::config::OrchestratorConfig;
use crate::coordinator::{self, CoordinatorClient, CoordinatorContext, CoordinatorSnapshot, Ready};
use crate::error::{ConfigError, OrchestratorError};
use crate::model::{ConnectionId, DesiredSet};
use crate::pipeline::Connection;
use crate::provisioning::{ProvisioningClient, WorkerPool};
use crate::supply::SupplyChannel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

type Sessions = Arc<Mutex<HashMap<ConnectionId, Session>>>;

/// One connection together with its coordinator and their tasks.
struct Session {
    connection: Connection,
    coordinator: CoordinatorClient,
    coordinator_task: JoinHandle<()>,
    /// Awaits the pipeline task and discards the session when the transport
    /// closes the connection.
    watcher: JoinHandle<()>,
}

/// Runtime owner of every connection and coordinator.
///
/// `SessionManager` is responsible for:
/// - **Wiring**: every coordinator gets its connection's affinity, the shared
///   provisioning client, the shared worker pool and the supply channel
/// - **Lifecycle**: opening connections, closing them and shutting down.
///   A connection closed from the transport side is discarded on its own.
/// - **Routing**: lifecycle calls by [`ConnectionId`]
///
/// # Example
///
/// ```ignore
/// let backend = Backend::start(supply.clone(), 64);
/// let manager = SessionManager::new(config, Arc::new(backend.client.clone()), supply)?;
///
/// let (id, ready) = manager.open(desired).await?;
/// manager.modify(&id, next).await?;
/// manager.close(&id).await?;
///
/// manager.shutdown().await?;
/// ```
pub struct SessionManager {
    config: Arc<OrchestratorConfig>,
    provisioning: Arc<dyn ProvisioningClient>,
    supply: SupplyChannel,
    workers: WorkerPool,
    sessions: Sessions,
    next_id: AtomicU64,
}

impl SessionManager {
    /// Validates `config` and creates an empty manager.
    pub fn new(
        config: OrchestratorConfig,
        provisioning: Arc<dyn ProvisioningClient>,
        supply: SupplyChannel,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let workers = WorkerPool::new(config.provisioning_workers);
        info!(
            app = %config.app_name,
            workers = workers.size(),
            "Session manager ready"
        );
        Ok(Self {
            config: Arc::new(config),
            provisioning,
            supply,
            workers,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Opens a new connection and activates `desired` on it.
    pub async fn open(&self, desired: DesiredSet) -> Result<(ConnectionId, Ready), OrchestratorError> {
        let id = ConnectionId::new(format!(
            "conn-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));
        let ready = self.attach(id.clone(), desired).await?;
        Ok((id, ready))
    }

    /// Spawns a connection named `connection`, starts its coordinator and
    /// activates `desired`.
    ///
    /// A failed activation closes the coordinator and the connection before
    /// the error is returned.
    #[instrument(skip(self, desired), fields(keys = desired.len()))]
    pub async fn attach(
        &self,
        connection: ConnectionId,
        desired: DesiredSet,
    ) -> Result<Ready, OrchestratorError> {
        let coordinator = {
            let mut sessions = self.sessions.lock().await;
            if sessions.contains_key(&connection) {
                return Err(OrchestratorError::InvalidState {
                    operation: "attach",
                    state: format!("connection {connection} already attached"),
                });
            }
            let session = self.spawn_session(connection.clone());
            let coordinator = session.coordinator.clone();
            sessions.insert(connection.clone(), session);
            coordinator
        };

        match coordinator.activate(desired).await {
            Ok(ready) => {
                info!(%connection, generation = ready.generation, "Connection ready");
                Ok(ready)
            }
            Err(e) => {
                warn!(%connection, error = %e, "Activation failed, closing connection");
                if let Err(close_error) = self.close(&connection).await {
                    warn!(%connection, error = %close_error, "Close after failed activation");
                }
                Err(e)
            }
        }
    }

    fn spawn_session(&self, id: ConnectionId) -> Session {
        let (connection, pipeline_handle) =
            Connection::spawn_gated(id.clone(), self.config.command_buffer);
        let (actor, coordinator) = coordinator::new(id, self.config.clone());
        let coordinator_task = tokio::spawn(actor.run(CoordinatorContext {
            affinity: connection.affinity().clone(),
            provisioning: self.provisioning.clone(),
            workers: self.workers.clone(),
            supply: self.supply.clone(),
        }));
        let watcher = tokio::spawn(watch_pipeline(
            self.sessions.clone(),
            connection.id().clone(),
            pipeline_handle,
        ));
        Session {
            connection,
            coordinator,
            coordinator_task,
            watcher,
        }
    }

    pub async fn modify(&self, id: &ConnectionId, desired: DesiredSet) -> Result<(), OrchestratorError> {
        self.coordinator(id).await?.modify(desired).await
    }

    pub async fn snapshot(&self, id: &ConnectionId) -> Result<CoordinatorSnapshot, OrchestratorError> {
        self.coordinator(id).await?.snapshot().await
    }

    /// The pipeline side of an open connection.
    pub async fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.sessions
            .lock()
            .await
            .get(id)
            .map(|session| session.connection.clone())
    }

    pub async fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn coordinator(&self, id: &ConnectionId) -> Result<CoordinatorClient, OrchestratorError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .map(|session| session.coordinator.clone())
            .ok_or_else(|| OrchestratorError::UnknownConnection(id.clone()))
    }

    /// Closes the coordinator, then the connection, and waits for both tasks.
    #[instrument(skip(self))]
    pub async fn close(&self, id: &ConnectionId) -> Result<(), OrchestratorError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| OrchestratorError::UnknownConnection(id.clone()))?;
        Self::close_session(session).await
    }

    async fn close_session(session: Session) -> Result<(), OrchestratorError> {
        let Session {
            connection,
            coordinator,
            coordinator_task,
            watcher,
        } = session;
        let result = coordinator.close().await;
        connection.close().await;

        // Dropping the last client lets the coordinator loop exit.
        drop(coordinator);
        drop(connection);
        for handle in [coordinator_task, watcher] {
            if let Err(e) = handle.await {
                error!(error = %e, "Session task failed");
            }
        }
        result
    }

    /// Closes every open connection.
    pub async fn shutdown(self) -> Result<(), String> {
        info!("Shutting down session manager...");
        let sessions: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let mut failed = 0;
        for session in sessions {
            let id = session.connection.id().clone();
            if let Err(e) = Self::close_session(session).await {
                error!(connection = %id, error = %e, "Close failed during shutdown");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(format!("{failed} connection(s) failed to close"));
        }
        info!("Session manager shutdown complete");
        Ok(())
    }
}

/// Waits for a connection's pipeline task to end. If the session is still
/// registered, the transport closed it: the session is removed and its
/// coordinator closed.
async fn watch_pipeline(sessions: Sessions, id: ConnectionId, pipeline: JoinHandle<()>) {
    if let Err(e) = pipeline.await {
        error!(connection = %id, error = %e, "Pipeline task failed");
    }

    let session = {
        let mut sessions = sessions.lock().await;
        // A live entry under the same id belongs to a later attach.
        let lost = sessions
            .get(&id)
            .is_some_and(|session| !session.connection.is_active());
        if lost {
            sessions.remove(&id)
        } else {
            None
        }
    };
    let Some(Session {
        connection,
        coordinator,
        coordinator_task,
        watcher: _,
    }) = session
    else {
        return;
    };

    info!(connection = %id, "Connection closed by transport, discarding session");
    if let Err(e) = coordinator.close().await {
        warn!(connection = %id, error = %e, "Coordinator close after connection loss");
    }
    drop(coordinator);
    drop(connection);
    if let Err(e) = coordinator_task.await {
        error!(connection = %id, error = %e, "Coordinator task failed");
    }
}
