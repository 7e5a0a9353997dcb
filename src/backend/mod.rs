//! In-memory provisioning backend.
//!
//! Plays the external configuration system for the demo binary and the
//! integration tests: a [`ConfigAdmin`] actor owning records, plus a
//! [`FactoryRegistry`] of per-kind [`HandlerFactory`]s that turn record
//! updates into stages delivered through the [`SupplyChannel`].

pub mod admin;
pub mod factory;

pub use admin::{AdminContext, ConfigAdmin, ConfigAdminHandle, ConfigRecord};
pub use factory::{FactoryRegistry, FnFactory, HandlerFactory, RejectingFactory, TagFactory};

use crate::provisioning::ConfigAdminClient;
use crate::supply::SupplyChannel;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A running backend.
pub struct Backend {
    /// Provisioning client talking to this backend's admin actor.
    pub client: ConfigAdminClient,
    /// Factories may be registered at any time.
    pub factories: FactoryRegistry,
    handle: JoinHandle<()>,
}

impl Backend {
    pub fn start(supply: SupplyChannel, buffer_size: usize) -> Self {
        let factories = FactoryRegistry::new();
        let (actor, admin) = admin::new(buffer_size);
        let handle = tokio::spawn(actor.run(AdminContext {
            factories: factories.clone(),
            supply,
        }));
        Self {
            client: ConfigAdminClient::new(admin),
            factories,
            handle,
        }
    }

    /// Stops the admin actor once every client clone has been dropped.
    pub async fn shutdown(self) -> Result<(), String> {
        info!("Shutting down backend...");
        drop(self.client);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Config admin task failed");
            return Err(format!("config admin task failed: {e}"));
        }
        info!("Backend shutdown complete");
        Ok(())
    }
}
