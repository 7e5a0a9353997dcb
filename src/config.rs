//! Orchestrator configuration.
//!
//! Loaded from TOML or built in code via [`Default`]. Every field has a default,
//! so an empty document is a valid configuration.
//!
//! ```toml
//! app_name = "gateway"
//! inet_host = "0.0.0.0"
//! inet_port = 8443
//! supply_timeout_ms = 5000
//!
//! [extra_properties]
//! "extra.mode" = "strict"
//! ```

use crate::error::ConfigError;
use crate::model::Properties;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ANCHOR_NAME: &str = "dynamicChannelHandler";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Application name stamped into every handler record.
    pub app_name: String,
    pub inet_host: String,
    pub inet_port: u16,
    /// Pipeline name of the coordinator's own stage.
    pub anchor_name: String,
    /// Capacity of each coordinator's command mailbox.
    pub command_buffer: usize,
    /// Maximum number of provisioning calls in flight across all connections.
    pub provisioning_workers: usize,
    /// Bound on the supply barrier in milliseconds. `0` waits forever.
    pub supply_timeout_ms: u64,
    /// Forwarded to every handler record; only `extra.` entries are kept.
    pub extra_properties: Properties,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            app_name: "pipeline-orchestrator".to_string(),
            inet_host: "127.0.0.1".to_string(),
            inet_port: 0,
            anchor_name: DEFAULT_ANCHOR_NAME.to_string(),
            command_buffer: 32,
            provisioning_workers: 8,
            supply_timeout_ms: 30_000,
            extra_properties: Properties::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.anchor_name.trim().is_empty() {
            return Err(ConfigError::Invalid("anchor_name must not be empty".into()));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid("command_buffer must be at least 1".into()));
        }
        if self.provisioning_workers == 0 {
            return Err(ConfigError::Invalid(
                "provisioning_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn supply_timeout(&self) -> Option<Duration> {
        match self.supply_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn with_supply_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.supply_timeout_ms = timeout.map_or(0, |t| t.as_millis().max(1) as u64);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PropertyValue;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.anchor_name, DEFAULT_ANCHOR_NAME);
        assert_eq!(config.supply_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_overrides_and_extras() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            app_name = "gateway"
            inet_port = 8443
            supply_timeout_ms = 0

            [extra_properties]
            "extra.mode" = "strict"
            "extra.retries" = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.app_name, "gateway");
        assert_eq!(config.inet_port, 8443);
        assert_eq!(config.supply_timeout(), None);
        assert_eq!(
            config.extra_properties.get("extra.retries"),
            Some(&PropertyValue::Int(3))
        );
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let result = OrchestratorConfig::from_toml_str("provisioning_workers = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));

        let result = OrchestratorConfig::from_toml_str("anchor_name = \" \"");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let result = OrchestratorConfig::from_toml_str("inet_port = \"not a port\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
