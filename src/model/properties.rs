//! Configuration record properties.
//!
//! The backend routes supply callbacks using nothing but the properties stamped
//! into a record, so every handler record carries the connection identity and
//! the key it was created for.

use crate::model::{ConnectionId, Key};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

pub const APP_NAME: &str = "appName";
pub const INET_HOST: &str = "inetHost";
pub const INET_PORT: &str = "inetPort";
pub const HANDLER_NAME: &str = "handlerName";
pub const CHANNEL_ID: &str = "channelId";
pub const FACTORY_PID: &str = "factoryPid";

/// Prefix marking a property as an extra to forward to handler records.
pub const EXTRA_PREFIX: &str = "extra.";
/// Marker set on a property map that carries extras.
pub const EXTRA_PROPERTIES: &str = "extra.properties";

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Int(i) => write!(f, "{i}"),
            PropertyValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Str(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

impl From<u16> for PropertyValue {
    fn from(i: u16) -> Self {
        PropertyValue::Int(i64::from(i))
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// Property map of one configuration record. Ordered so logs are stable.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Keeps only `extra.`-prefixed entries and strips the prefix.
///
/// The `extra.properties` marker itself is dropped.
pub fn from_extra_properties(extras: &Properties) -> Properties {
    extras
        .iter()
        .filter(|(name, _)| name.as_str() != EXTRA_PROPERTIES)
        .filter_map(|(name, value)| {
            name.strip_prefix(EXTRA_PREFIX)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

/// Collects the `extra.`-prefixed entries of `properties`, keeping the prefix.
///
/// Returns `None` unless the map carries the `extra.properties` marker.
pub fn to_extra_properties(properties: &Properties) -> Option<Properties> {
    if !properties.contains_key(EXTRA_PROPERTIES) {
        return None;
    }
    let mut extras: Properties = properties
        .iter()
        .filter(|(name, _)| name.starts_with(EXTRA_PREFIX))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    extras.insert(EXTRA_PROPERTIES.to_string(), PropertyValue::Bool(true));
    Some(extras)
}

/// Parsed view of a handler configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerRecord {
    pub app_name: String,
    pub inet_host: String,
    pub inet_port: u16,
    pub connection: ConnectionId,
    pub key: Key,
    pub extras: Properties,
}

impl HandlerRecord {
    /// Builds the property map stamped into a record by `update`.
    ///
    /// `extras` is the raw configured map; only its `extra.` entries survive,
    /// with the prefix stripped.
    pub fn properties(
        app_name: &str,
        inet_host: &str,
        inet_port: u16,
        connection: &ConnectionId,
        key: &Key,
        extras: &Properties,
    ) -> Properties {
        let mut props = from_extra_properties(extras);
        props.insert(APP_NAME.into(), app_name.into());
        props.insert(INET_HOST.into(), inet_host.into());
        props.insert(INET_PORT.into(), inet_port.into());
        props.insert(HANDLER_NAME.into(), key.handler_name().into());
        props.insert(CHANNEL_ID.into(), connection.as_str().into());
        props.insert(FACTORY_PID.into(), key.provider_kind().into());
        props
    }

    /// Parses a record back from its properties.
    ///
    /// Fails with the name of the first missing or mistyped property.
    pub fn from_properties(properties: &Properties) -> Result<Self, String> {
        let text = |name: &str| {
            properties
                .get(name)
                .and_then(PropertyValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| format!("missing or invalid '{name}'"))
        };
        let inet_port = properties
            .get(INET_PORT)
            .and_then(PropertyValue::as_int)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| format!("missing or invalid '{INET_PORT}'"))?;

        let reserved = [APP_NAME, INET_HOST, INET_PORT, HANDLER_NAME, CHANNEL_ID, FACTORY_PID];
        let extras = properties
            .iter()
            .filter(|(name, _)| !reserved.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Self {
            app_name: text(APP_NAME)?,
            inet_host: text(INET_HOST)?,
            inet_port,
            connection: ConnectionId::new(text(CHANNEL_ID)?),
            key: Key::new(text(HANDLER_NAME)?, text(FACTORY_PID)?),
            extras,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extras() -> Properties {
        let mut extras = Properties::new();
        extras.insert("extra.timeout".into(), 30i64.into());
        extras.insert("extra.mode".into(), "strict".into());
        extras.insert("plain".into(), "ignored".into());
        extras.insert(EXTRA_PROPERTIES.into(), true.into());
        extras
    }

    #[test]
    fn test_extra_prefix_is_stripped() {
        let stripped = from_extra_properties(&extras());
        assert_eq!(stripped.len(), 2);
        assert_eq!(stripped.get("timeout"), Some(&PropertyValue::Int(30)));
        assert_eq!(stripped.get("mode"), Some(&PropertyValue::from("strict")));
        assert!(!stripped.contains_key("plain"));
    }

    #[test]
    fn test_to_extra_properties_requires_marker() {
        let mut props = extras();
        let collected = to_extra_properties(&props).unwrap();
        assert!(collected.contains_key("extra.timeout"));
        assert!(!collected.contains_key("plain"));

        props.remove(EXTRA_PROPERTIES);
        assert!(to_extra_properties(&props).is_none());
    }

    #[test]
    fn test_handler_record_roundtrips_identity() {
        let key = Key::new("log", "K1");
        let conn = ConnectionId::new("conn-7");
        let props = HandlerRecord::properties("app", "localhost", 8080, &conn, &key, &extras());

        assert_eq!(props.get(CHANNEL_ID), Some(&PropertyValue::from("conn-7")));
        assert_eq!(props.get(HANDLER_NAME), Some(&PropertyValue::from("log")));

        let record = HandlerRecord::from_properties(&props).unwrap();
        assert_eq!(record.key, key);
        assert_eq!(record.connection, conn);
        assert_eq!(record.inet_port, 8080);
        assert_eq!(record.extras.get("mode"), Some(&PropertyValue::from("strict")));
    }

    #[test]
    fn test_handler_record_reports_missing_property() {
        let mut props = HandlerRecord::properties(
            "app",
            "localhost",
            1,
            &ConnectionId::new("c"),
            &Key::new("a", "K"),
            &Properties::new(),
        );
        props.remove(CHANNEL_ID);
        let err = HandlerRecord::from_properties(&props).unwrap_err();
        assert!(err.contains(CHANNEL_ID));
    }
}
