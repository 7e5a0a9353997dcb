//! # Error Taxonomy
//!
//! Every failure the orchestrator can observe maps to one of the enums below.
//!
//! - [`ProvisioningError`]: the configuration backend rejected a create, update or delete.
//! - [`PipelineError`]: a pipeline mutation could not be applied. [`PipelineError::StaleMutation`]
//!   is the benign case (the connection is already gone) and is logged, never surfaced.
//! - [`OrchestratorError`]: what coordinator and session operations return to their callers.
//! - [`TeardownError`]: one failed delete during `close`. Collected and logged, never returned.
//! - [`ConfigError`]: loading or validating [`OrchestratorConfig`](crate::config::OrchestratorConfig).

use crate::model::{ConfigHandle, ConnectionId, Key};

/// Failure reported by a [`ProvisioningClient`](crate::provisioning::ProvisioningClient).
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ProvisioningError {
    #[error("Create failed for kind '{kind}': {reason}")]
    Create { kind: String, reason: String },
    #[error("Update failed for {handle}: {reason}")]
    Update { handle: ConfigHandle, reason: String },
    #[error("Delete failed for {handle}: {reason}")]
    Delete { handle: ConfigHandle, reason: String },
    #[error("No factory registered for kind '{0}'")]
    UnknownKind(String),
    #[error("Configuration record not found: {0}")]
    NotFound(ConfigHandle),
    #[error("Provisioning backend closed")]
    BackendClosed,
    #[error("Provisioning backend dropped response channel")]
    BackendDropped,
    #[error("Worker pool closed")]
    PoolClosed,
}

/// Failure applying a mutation to a connection's pipeline.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PipelineError {
    #[error("Connection {connection} is no longer active ({operation})")]
    StaleMutation {
        connection: ConnectionId,
        operation: String,
    },
    #[error("Duplicate stage name: {0}")]
    DuplicateName(String),
    #[error("Stage not found: {0}")]
    StageNotFound(String),
}

impl PipelineError {
    pub fn is_stale(&self) -> bool {
        matches!(self, PipelineError::StaleMutation { .. })
    }
}

/// Errors returned by coordinator and session operations.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OrchestratorError {
    #[error("Provisioning failed for {key}: {source}")]
    Provisioning {
        key: Key,
        #[source]
        source: ProvisioningError,
    },
    #[error("Backend cannot supply a handler for {key}: {reason}")]
    SupplyFailure { key: Key, reason: String },
    #[error("Timed out waiting for handler supply: {}", format_keys(.pending))]
    SupplyTimeout { pending: Vec<Key> },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Cannot {operation} while coordinator is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("Invalid desired set: {0}")]
    InvalidDesiredSet(String),
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("Coordinator closed")]
    Closed,
    #[error("Actor closed")]
    ActorClosed,
    #[error("Actor dropped response channel")]
    ActorDropped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn format_keys(keys: &[Key]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// One configuration record that could not be deleted while closing.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("Teardown of {key} ({handle}) on {connection} failed: {source}")]
pub struct TeardownError {
    pub connection: ConnectionId,
    pub key: Key,
    pub handle: ConfigHandle,
    #[source]
    pub source: ProvisioningError,
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl PartialEq for ConfigError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supply_timeout_lists_pending_keys() {
        let err = OrchestratorError::SupplyTimeout {
            pending: vec![Key::new("svc", "K1"), Key::new("auth", "K2")],
        };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for handler supply: K1:svc, K2:auth"
        );
    }

    #[test]
    fn test_stale_mutation_is_benign() {
        let err = PipelineError::StaleMutation {
            connection: ConnectionId::new("conn-1"),
            operation: "remove log".into(),
        };
        assert!(err.is_stale());
        assert!(!PipelineError::DuplicateName("log".into()).is_stale());
    }
}
