//! Identity types shared by every component of the orchestrator.
//!
//! A [`Key`] names one desired pipeline stage, a [`DesiredSet`] is the ordered
//! shape a connection's pipeline should converge to, and [`ConnectionId`] /
//! [`ConfigHandle`] are the opaque identifiers that tie configuration records
//! and supply callbacks back to a single connection.

use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;

/// Identity of one desired stage: the stage name plus the provider kind that
/// is able to build it.
///
/// Equality and hashing use both fields, so `("log", "K1")` and `("log", "K2")`
/// are different keys even though they would compete for the same pipeline name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    handler_name: String,
    provider_kind: String,
}

impl Key {
    pub fn new(handler_name: impl Into<String>, provider_kind: impl Into<String>) -> Self {
        Self {
            handler_name: handler_name.into(),
            provider_kind: provider_kind.into(),
        }
    }

    /// The name the stage is registered under in the pipeline.
    pub fn handler_name(&self) -> &str {
        &self.handler_name
    }

    /// The provider kind (factory pid) asked to create the configuration.
    pub fn provider_kind(&self) -> &str {
        &self.provider_kind
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider_kind, self.handler_name)
    }
}

impl<N: Into<String>, K: Into<String>> From<(N, K)> for Key {
    fn from((name, kind): (N, K)) -> Self {
        Self::new(name, kind)
    }
}

/// Ordered sequence of keys describing the target pipeline shape.
///
/// Order is the insertion order. Handler names must be unique because they
/// double as pipeline stage names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Key>", into = "Vec<Key>")]
pub struct DesiredSet {
    keys: Vec<Key>,
}

impl DesiredSet {
    /// Builds a desired set, rejecting duplicate handler names.
    pub fn new(keys: impl IntoIterator<Item = Key>) -> Result<Self, OrchestratorError> {
        let keys: Vec<Key> = keys.into_iter().collect();
        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(key.handler_name()) {
                return Err(OrchestratorError::InvalidDesiredSet(format!(
                    "handler name '{}' appears more than once",
                    key.handler_name()
                )));
            }
        }
        Ok(Self { keys })
    }

    /// Convenience constructor from `(handler_name, provider_kind)` pairs.
    pub fn from_pairs<N, K>(
        pairs: impl IntoIterator<Item = (N, K)>,
    ) -> Result<Self, OrchestratorError>
    where
        N: Into<String>,
        K: Into<String>,
    {
        Self::new(pairs.into_iter().map(Key::from))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.keys.contains(key)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Key> {
        self.keys.iter()
    }

    /// Keys of `self` that are absent from `next`, in `self` order.
    ///
    /// This is the `old \ new` half of a reconfiguration diff.
    pub fn removed_in(&self, next: &DesiredSet) -> Vec<Key> {
        self.keys
            .iter()
            .filter(|key| !next.contains(key))
            .cloned()
            .collect()
    }

    /// Handler names in order.
    pub fn handler_names(&self) -> Vec<String> {
        self.keys
            .iter()
            .map(|key| key.handler_name().to_string())
            .collect()
    }
}

impl TryFrom<Vec<Key>> for DesiredSet {
    type Error = OrchestratorError;

    fn try_from(keys: Vec<Key>) -> Result<Self, Self::Error> {
        Self::new(keys)
    }
}

impl From<DesiredSet> for Vec<Key> {
    fn from(set: DesiredSet) -> Self {
        set.keys
    }
}

impl<'a> IntoIterator for &'a DesiredSet {
    type Item = &'a Key;
    type IntoIter = std::slice::Iter<'a, Key>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}

/// Opaque identity of one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque handle to one configuration record owned by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigHandle(String);

impl ConfigHandle {
    pub fn new(pid: impl Into<String>) -> Self {
        Self(pid.into())
    }

    pub fn pid(&self) -> &str {
        &self.0
    }
}

impl Display for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_identity_uses_both_fields() {
        let a = Key::new("log", "K1");
        let b = Key::new("log", "K2");
        assert_ne!(a, b);
        assert_eq!(a, Key::from(("log", "K1")));
        assert_eq!(a.to_string(), "K1:log");
    }

    #[test]
    fn test_desired_set_rejects_duplicate_names() {
        let result = DesiredSet::from_pairs([("log", "K1"), ("log", "K2")]);
        assert!(matches!(result, Err(OrchestratorError::InvalidDesiredSet(_))));
    }

    #[test]
    fn test_removed_in_keeps_old_order() {
        let old = DesiredSet::from_pairs([("A", "K"), ("B", "K"), ("C", "K")]).unwrap();
        let new = DesiredSet::from_pairs([("B", "K"), ("C", "K"), ("D", "K")]).unwrap();
        assert_eq!(old.removed_in(&new), vec![Key::new("A", "K")]);
        assert!(new.removed_in(&new).is_empty());
    }

    #[test]
    fn test_desired_set_deserializes_with_validation() {
        let ok: DesiredSet = toml::from_str::<Wrapper>(
            r#"keys = [{ handler_name = "svc", provider_kind = "K1" }]"#,
        )
        .unwrap()
        .keys;
        assert_eq!(ok.handler_names(), vec!["svc".to_string()]);

        let dup = toml::from_str::<Wrapper>(
            r#"keys = [
                { handler_name = "svc", provider_kind = "K1" },
                { handler_name = "svc", provider_kind = "K2" },
            ]"#,
        );
        assert!(dup.is_err());
    }

    #[derive(Deserialize)]
    struct Wrapper {
        keys: DesiredSet,
    }
}
