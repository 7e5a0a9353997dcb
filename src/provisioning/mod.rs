//! # Provisioning Client
//!
//! The narrow contract the coordinator consumes from the external
//! configuration system: create a record for a provider kind, stamp it with
//! properties, delete it.
//!
//! - [`ProvisioningClient`]: the contract.
//! - [`ConfigAdminClient`]: implementation backed by the
//!   [`ConfigAdmin`](crate::backend::ConfigAdmin) actor.
//! - [`WorkerPool`]: the shared bounded pool every provisioning call runs on.
//! - [`mock`]: a recording client with error injection for tests.

pub mod admin_client;
pub mod mock;
pub mod worker_pool;

pub use admin_client::ConfigAdminClient;
pub use worker_pool::WorkerPool;

use crate::error::ProvisioningError;
use crate::model::{ConfigHandle, Properties};
use async_trait::async_trait;

#[async_trait]
pub trait ProvisioningClient: Send + Sync + 'static {
    /// Creates a configuration record for `kind`.
    async fn create(&self, kind: &str) -> Result<ConfigHandle, ProvisioningError>;

    /// Replaces the properties of an existing record.
    async fn update(
        &self,
        handle: &ConfigHandle,
        properties: Properties,
    ) -> Result<(), ProvisioningError>;

    /// Deletes a record. Deleting an already deleted record succeeds.
    async fn delete(&self, handle: &ConfigHandle) -> Result<(), ProvisioningError>;
}
