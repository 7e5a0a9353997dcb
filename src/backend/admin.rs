//! # Configuration Admin Actor
//!
//! In-memory stand-in for the external provisioning system. It owns
//! configuration records and turns record changes into supply notifications.
//!
//! | Request  | Effect                                                                 |
//! |----------|------------------------------------------------------------------------|
//! | `Create` | new record `<kind>~<n>`, no properties yet                             |
//! | `Update` | stores properties, asks the kind's factory for a stage, then `provide` |
//! | `Delete` | drops the record and `withdraw`s its key; unknown handles succeed      |
//! | `Get`    | one record                                                             |
//! | `List`   | every record, ordered by handle                                        |
//!
//! The supply notification for an update is routed before the update's
//! response is sent.

use super::factory::FactoryRegistry;
use crate::error::ProvisioningError;
use crate::model::{ConfigHandle, HandlerRecord, Properties};
use crate::supply::SupplyChannel;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

// =============================================================================
// 1. RECORDS & MESSAGES
// =============================================================================

/// One configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigRecord {
    pub handle: ConfigHandle,
    pub factory_pid: String,
    pub properties: Option<Properties>,
}

/// Response channel used by the admin actor.
pub type Response<T> = oneshot::Sender<Result<T, ProvisioningError>>;

#[derive(Debug)]
pub enum AdminRequest {
    Create {
        factory_pid: String,
        respond_to: Response<ConfigHandle>,
    },
    Get {
        handle: ConfigHandle,
        respond_to: Response<Option<ConfigRecord>>,
    },
    Update {
        handle: ConfigHandle,
        properties: Properties,
        respond_to: Response<()>,
    },
    Delete {
        handle: ConfigHandle,
        respond_to: Response<()>,
    },
    List {
        respond_to: Response<Vec<ConfigRecord>>,
    },
}

/// Dependencies injected when the actor starts.
#[derive(Clone)]
pub struct AdminContext {
    pub factories: FactoryRegistry,
    pub supply: SupplyChannel,
}

// =============================================================================
// 2. THE ACTOR
// =============================================================================

pub struct ConfigAdmin {
    receiver: mpsc::Receiver<AdminRequest>,
    store: HashMap<ConfigHandle, ConfigRecord>,
    next_id: u64,
}

/// Creates the admin actor and its handle. Spawn `run` to start it.
pub fn new(buffer_size: usize) -> (ConfigAdmin, ConfigAdminHandle) {
    let (sender, receiver) = mpsc::channel(buffer_size.max(1));
    let actor = ConfigAdmin {
        receiver,
        store: HashMap::new(),
        next_id: 0,
    };
    (actor, ConfigAdminHandle { sender })
}

impl ConfigAdmin {
    pub async fn run(mut self, context: AdminContext) {
        info!(kinds = ?context.factories.kinds(), "Config admin started");

        while let Some(msg) = self.receiver.recv().await {
            match msg {
                AdminRequest::Create {
                    factory_pid,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.create(&context, factory_pid));
                }
                AdminRequest::Get { handle, respond_to } => {
                    let record = self.store.get(&handle).cloned();
                    debug!(%handle, found = record.is_some(), "Get");
                    let _ = respond_to.send(Ok(record));
                }
                AdminRequest::Update {
                    handle,
                    properties,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.update(&context, handle, properties));
                }
                AdminRequest::Delete { handle, respond_to } => {
                    self.delete(&context, &handle);
                    let _ = respond_to.send(Ok(()));
                }
                AdminRequest::List { respond_to } => {
                    let mut records: Vec<_> = self.store.values().cloned().collect();
                    records.sort_by(|a, b| a.handle.cmp(&b.handle));
                    let _ = respond_to.send(Ok(records));
                }
            }
        }

        info!(size = self.store.len(), "Config admin shutdown");
    }

    fn create(
        &mut self,
        context: &AdminContext,
        factory_pid: String,
    ) -> Result<ConfigHandle, ProvisioningError> {
        if !context.factories.contains(&factory_pid) {
            warn!(%factory_pid, "Create for unknown kind");
            return Err(ProvisioningError::UnknownKind(factory_pid));
        }
        self.next_id += 1;
        let handle = ConfigHandle::new(format!("{factory_pid}~{}", self.next_id));
        self.store.insert(
            handle.clone(),
            ConfigRecord {
                handle: handle.clone(),
                factory_pid,
                properties: None,
            },
        );
        info!(%handle, size = self.store.len(), "Created");
        Ok(handle)
    }

    fn update(
        &mut self,
        context: &AdminContext,
        handle: ConfigHandle,
        properties: Properties,
    ) -> Result<(), ProvisioningError> {
        let Some(stored) = self.store.get_mut(&handle) else {
            warn!(%handle, "Not found");
            return Err(ProvisioningError::NotFound(handle));
        };
        let record = HandlerRecord::from_properties(&properties).map_err(|reason| {
            warn!(%handle, %reason, "Update rejected");
            ProvisioningError::Update {
                handle: handle.clone(),
                reason,
            }
        })?;
        stored.properties = Some(properties);
        info!(%handle, key = %record.key, connection = %record.connection, "Updated");

        let built = match context.factories.get(&stored.factory_pid) {
            Some(factory) => factory.create_stage(&record),
            None => Err(format!("factory '{}' is gone", stored.factory_pid)),
        };
        match built {
            Ok(stage) => {
                context.supply.provide(&record.connection, record.key, stage);
            }
            Err(reason) => {
                warn!(%handle, key = %record.key, %reason, "Factory refused record");
                context.supply.fail(&record.connection, record.key, reason);
            }
        }
        Ok(())
    }

    fn delete(&mut self, context: &AdminContext, handle: &ConfigHandle) {
        let Some(record) = self.store.remove(handle) else {
            debug!(%handle, "Delete of unknown record");
            return;
        };
        info!(%handle, size = self.store.len(), "Deleted");

        if let Some(factory) = context.factories.get(&record.factory_pid) {
            factory.deleted(handle);
        }
        let parsed = record
            .properties
            .as_ref()
            .map(HandlerRecord::from_properties);
        if let Some(Ok(parsed)) = parsed {
            context.supply.withdraw(&parsed.connection, parsed.key);
        }
    }
}

// =============================================================================
// 3. THE HANDLE
// =============================================================================

/// Typed handle for talking to a running [`ConfigAdmin`].
#[derive(Clone)]
pub struct ConfigAdminHandle {
    sender: mpsc::Sender<AdminRequest>,
}

impl ConfigAdminHandle {
    pub async fn create(&self, factory_pid: &str) -> Result<ConfigHandle, ProvisioningError> {
        let (respond_to, response) = oneshot::channel();
        self.send(AdminRequest::Create {
            factory_pid: factory_pid.to_string(),
            respond_to,
        })
        .await?;
        response.await.map_err(|_| ProvisioningError::BackendDropped)?
    }

    pub async fn get(&self, handle: &ConfigHandle) -> Result<Option<ConfigRecord>, ProvisioningError> {
        let (respond_to, response) = oneshot::channel();
        self.send(AdminRequest::Get {
            handle: handle.clone(),
            respond_to,
        })
        .await?;
        response.await.map_err(|_| ProvisioningError::BackendDropped)?
    }

    pub async fn update(
        &self,
        handle: &ConfigHandle,
        properties: Properties,
    ) -> Result<(), ProvisioningError> {
        let (respond_to, response) = oneshot::channel();
        self.send(AdminRequest::Update {
            handle: handle.clone(),
            properties,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| ProvisioningError::BackendDropped)?
    }

    pub async fn delete(&self, handle: &ConfigHandle) -> Result<(), ProvisioningError> {
        let (respond_to, response) = oneshot::channel();
        self.send(AdminRequest::Delete {
            handle: handle.clone(),
            respond_to,
        })
        .await?;
        response.await.map_err(|_| ProvisioningError::BackendDropped)?
    }

    pub async fn list(&self) -> Result<Vec<ConfigRecord>, ProvisioningError> {
        let (respond_to, response) = oneshot::channel();
        self.send(AdminRequest::List { respond_to }).await?;
        response.await.map_err(|_| ProvisioningError::BackendDropped)?
    }

    async fn send(&self, request: AdminRequest) -> Result<(), ProvisioningError> {
        self.sender
            .send(request)
            .await
            .map_err(|_| ProvisioningError::BackendClosed)
    }
}

// =============================================================================
// 4. TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::factory::{RejectingFactory, TagFactory};
    use crate::model::{ConnectionId, Key};
    use crate::supply::SupplyNotice;

    fn start() -> (ConfigAdminHandle, SupplyChannel, tokio::task::JoinHandle<()>) {
        let factories = FactoryRegistry::new();
        factories.register("K1", TagFactory);
        factories.register("BAD", RejectingFactory::new("unsupported"));
        let supply = SupplyChannel::new();
        let (actor, handle) = new(16);
        let join = tokio::spawn(actor.run(AdminContext {
            factories,
            supply: supply.clone(),
        }));
        (handle, supply, join)
    }

    fn props(conn: &ConnectionId, key: &Key) -> Properties {
        HandlerRecord::properties("app", "localhost", 1, conn, key, &Properties::new())
    }

    #[tokio::test]
    async fn test_update_provides_and_delete_withdraws() {
        let (admin, supply, join) = start();
        let conn = ConnectionId::new("c1");
        let mut notices = supply.register(&conn);
        let key = Key::new("svc", "K1");

        let handle = admin.create("K1").await.unwrap();
        assert_eq!(handle.pid(), "K1~1");
        admin.update(&handle, props(&conn, &key)).await.unwrap();
        match notices.try_recv() {
            Ok(SupplyNotice::Provided { key: provided, .. }) => assert_eq!(provided, key),
            other => panic!("unexpected notice: {other:?}"),
        }

        admin.delete(&handle).await.unwrap();
        assert!(matches!(notices.try_recv(), Ok(SupplyNotice::Withdrawn { .. })));
        assert!(admin.get(&handle).await.unwrap().is_none());

        // idempotent delete
        admin.delete(&handle).await.unwrap();
        assert!(notices.try_recv().is_err());

        drop(admin);
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_kind_and_rejecting_factory() {
        let (admin, supply, _join) = start();
        assert_eq!(
            admin.create("NOPE").await,
            Err(ProvisioningError::UnknownKind("NOPE".into()))
        );

        let conn = ConnectionId::new("c2");
        let mut notices = supply.register(&conn);
        let handle = admin.create("BAD").await.unwrap();
        admin
            .update(&handle, props(&conn, &Key::new("auth", "BAD")))
            .await
            .unwrap();
        match notices.try_recv() {
            Ok(SupplyNotice::Failed { reason, .. }) => assert_eq!(reason, "unsupported"),
            other => panic!("unexpected notice: {other:?}"),
        }
        assert_eq!(admin.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let (admin, _supply, _join) = start();
        let missing = ConfigHandle::new("K1~99");
        let result = admin
            .update(&missing, props(&ConnectionId::new("c"), &Key::new("a", "K1")))
            .await;
        assert_eq!(result, Err(ProvisioningError::NotFound(missing)));
    }
}
