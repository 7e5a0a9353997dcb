use super::ProvisioningClient;
use crate::backend::{ConfigAdminHandle, ConfigRecord};
use crate::error::ProvisioningError;
use crate::model::{ConfigHandle, Properties};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// [`ProvisioningClient`] backed by the in-memory configuration admin.
#[derive(Clone)]
pub struct ConfigAdminClient {
    inner: ConfigAdminHandle,
}

impl ConfigAdminClient {
    pub fn new(inner: ConfigAdminHandle) -> Self {
        Self { inner }
    }

    pub async fn get(&self, handle: &ConfigHandle) -> Result<Option<ConfigRecord>, ProvisioningError> {
        self.inner.get(handle).await
    }

    /// Every record currently held by the backend.
    pub async fn list(&self) -> Result<Vec<ConfigRecord>, ProvisioningError> {
        self.inner.list().await
    }
}

#[async_trait]
impl ProvisioningClient for ConfigAdminClient {
    #[instrument(skip(self))]
    async fn create(&self, kind: &str) -> Result<ConfigHandle, ProvisioningError> {
        debug!("Sending create to config admin");
        self.inner.create(kind).await.map_err(|e| match e {
            ProvisioningError::UnknownKind(_) | ProvisioningError::Create { .. } => e,
            other => ProvisioningError::Create {
                kind: kind.to_string(),
                reason: other.to_string(),
            },
        })
    }

    #[instrument(skip(self, properties))]
    async fn update(
        &self,
        handle: &ConfigHandle,
        properties: Properties,
    ) -> Result<(), ProvisioningError> {
        debug!(?properties, "Sending update to config admin");
        self.inner.update(handle, properties).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, handle: &ConfigHandle) -> Result<(), ProvisioningError> {
        self.inner.delete(handle).await.map_err(|e| ProvisioningError::Delete {
            handle: handle.clone(),
            reason: e.to_string(),
        })
    }
}
