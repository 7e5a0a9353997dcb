//! # Mock Provisioning
//!
//! A [`ProvisioningClient`] that records every call and lets tests inject
//! failures, without running a backend.
//!
//! ```ignore
//! let supply = SupplyChannel::new();
//! let mock = MockProvisioning::new().auto_supply(supply.clone());
//! mock.fail_create_for("K2");
//! mock.refuse_supply_for("auth", "bad credentials");
//!
//! // ... drive a coordinator with Arc::new(mock.clone()) ...
//!
//! assert_eq!(mock.deletes_for("log"), 1);
//! mock.verify_no_leaks();
//! ```
//!
//! With [`auto_supply`](MockProvisioning::auto_supply) the mock plays the
//! backend's part too: every successful `update` provides a [`TagStage`] for
//! the record's key through the [`SupplyChannel`], unless the handler was put
//! on hold or refused.

use super::ProvisioningClient;
use crate::error::ProvisioningError;
use crate::model::{ConfigHandle, ConnectionId, HandlerRecord, Key, Properties};
use crate::pipeline::TagStage;
use crate::supply::SupplyChannel;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningCall {
    Create { kind: String },
    Update { handle: ConfigHandle, properties: Properties },
    Delete { handle: ConfigHandle },
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    calls: Vec<ProvisioningCall>,
    live: HashSet<ConfigHandle>,
    records: HashMap<ConfigHandle, Key>,
    fail_create: HashSet<String>,
    fail_update: HashSet<String>,
    fail_delete: HashSet<String>,
    refuse_supply: HashMap<String, String>,
    hold_supply: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MockProvisioning {
    state: Arc<Mutex<MockState>>,
    supply: Option<SupplyChannel>,
    latency: Option<Duration>,
}

impl MockProvisioning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provides a [`TagStage`] through `supply` on every successful update.
    pub fn auto_supply(mut self, supply: SupplyChannel) -> Self {
        self.supply = Some(supply);
        self
    }

    /// Delays every call, to let concurrent operations interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// `create` fails for this provider kind.
    pub fn fail_create_for(&self, kind: &str) {
        self.lock().fail_create.insert(kind.to_string());
    }

    /// `update` fails for records of this handler name.
    pub fn fail_update_for(&self, handler_name: &str) {
        self.lock().fail_update.insert(handler_name.to_string());
    }

    /// `delete` fails for records of this handler name.
    pub fn fail_delete_for(&self, handler_name: &str) {
        self.lock().fail_delete.insert(handler_name.to_string());
    }

    /// Reports a supply failure instead of providing this handler.
    pub fn refuse_supply_for(&self, handler_name: &str, reason: &str) {
        self.lock()
            .refuse_supply
            .insert(handler_name.to_string(), reason.to_string());
    }

    /// Accepts the update but never supplies this handler.
    pub fn hold_supply_for(&self, handler_name: &str) {
        self.lock().hold_supply.insert(handler_name.to_string());
    }

    pub fn calls(&self) -> Vec<ProvisioningCall> {
        self.lock().calls.clone()
    }

    /// Provider kinds passed to `create`, in call order.
    pub fn creates(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProvisioningCall::Create { kind } => Some(kind.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<ConfigHandle> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProvisioningCall::Delete { handle } => Some(handle.clone()),
                _ => None,
            })
            .collect()
    }

    /// Handles whose first update named `handler_name`.
    pub fn handles_for(&self, handler_name: &str) -> Vec<ConfigHandle> {
        let state = self.lock();
        let mut handles: Vec<_> = state
            .records
            .iter()
            .filter(|(_, key)| key.handler_name() == handler_name)
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        handles
    }

    /// Number of records ever stamped for `handler_name`.
    pub fn creates_for(&self, handler_name: &str) -> usize {
        self.handles_for(handler_name).len()
    }

    /// Number of delete calls against records of `handler_name`.
    pub fn deletes_for(&self, handler_name: &str) -> usize {
        let handles = self.handles_for(handler_name);
        self.deletes()
            .iter()
            .filter(|handle| handles.contains(handle))
            .count()
    }

    pub fn live_handles(&self) -> Vec<ConfigHandle> {
        let mut live: Vec<_> = self.lock().live.iter().cloned().collect();
        live.sort();
        live
    }

    /// Panics if any created record was never deleted.
    pub fn verify_no_leaks(&self) {
        let live = self.live_handles();
        if !live.is_empty() {
            panic!("{} configuration record(s) leaked: {live:?}", live.len());
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ProvisioningClient for MockProvisioning {
    async fn create(&self, kind: &str) -> Result<ConfigHandle, ProvisioningError> {
        self.pause().await;
        let mut state = self.lock();
        state.calls.push(ProvisioningCall::Create {
            kind: kind.to_string(),
        });
        if state.fail_create.contains(kind) {
            return Err(ProvisioningError::Create {
                kind: kind.to_string(),
                reason: "injected failure".into(),
            });
        }
        state.next_id += 1;
        let handle = ConfigHandle::new(format!("{kind}~{}", state.next_id));
        state.live.insert(handle.clone());
        Ok(handle)
    }

    async fn update(
        &self,
        handle: &ConfigHandle,
        properties: Properties,
    ) -> Result<(), ProvisioningError> {
        self.pause().await;
        let record = HandlerRecord::from_properties(&properties).map_err(|reason| {
            ProvisioningError::Update {
                handle: handle.clone(),
                reason,
            }
        })?;

        let outcome = {
            let mut state = self.lock();
            state.calls.push(ProvisioningCall::Update {
                handle: handle.clone(),
                properties,
            });
            if !state.live.contains(handle) {
                return Err(ProvisioningError::NotFound(handle.clone()));
            }
            state
                .records
                .entry(handle.clone())
                .or_insert_with(|| record.key.clone());

            let name = record.key.handler_name();
            if state.fail_update.contains(name) {
                return Err(ProvisioningError::Update {
                    handle: handle.clone(),
                    reason: "injected failure".into(),
                });
            }
            if state.hold_supply.contains(name) {
                None
            } else {
                Some(state.refuse_supply.get(name).cloned())
            }
        };

        if let (Some(supply), Some(refusal)) = (&self.supply, outcome) {
            match refusal {
                Some(reason) => {
                    supply.fail(&record.connection, record.key.clone(), reason);
                }
                None => {
                    let stage = Arc::new(TagStage::new(record.key.handler_name()));
                    supply.provide(&record.connection, record.key.clone(), stage);
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, handle: &ConfigHandle) -> Result<(), ProvisioningError> {
        self.pause().await;
        let withdrawn = {
            let mut state = self.lock();
            state.calls.push(ProvisioningCall::Delete {
                handle: handle.clone(),
            });
            let key = state.records.get(handle).cloned();
            if let Some(key) = &key {
                if state.fail_delete.contains(key.handler_name()) {
                    return Err(ProvisioningError::Delete {
                        handle: handle.clone(),
                        reason: "injected failure".into(),
                    });
                }
            }
            let was_live = state.live.remove(handle);
            key.filter(|_| was_live)
        };

        if let (Some(supply), Some(key)) = (&self.supply, withdrawn) {
            if let Some(connection) = self.connection_of(handle) {
                supply.withdraw(&connection, key);
            }
        }
        Ok(())
    }
}

impl MockProvisioning {
    fn connection_of(&self, handle: &ConfigHandle) -> Option<ConnectionId> {
        self.lock().calls.iter().rev().find_map(|call| match call {
            ProvisioningCall::Update {
                handle: updated,
                properties,
            } if updated == handle => HandlerRecord::from_properties(properties)
                .ok()
                .map(|record| record.connection),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supply::SupplyNotice;

    fn props(conn: &ConnectionId, key: &Key) -> Properties {
        HandlerRecord::properties("app", "localhost", 9000, conn, key, &Properties::new())
    }

    #[tokio::test]
    async fn test_records_calls_and_tracks_live_handles() {
        let mock = MockProvisioning::new();
        let conn = ConnectionId::new("c1");
        let key = Key::new("svc", "K1");

        let handle = mock.create("K1").await.unwrap();
        mock.update(&handle, props(&conn, &key)).await.unwrap();
        assert_eq!(mock.live_handles(), vec![handle.clone()]);
        assert_eq!(mock.creates(), vec!["K1".to_string()]);
        assert_eq!(mock.creates_for("svc"), 1);

        mock.delete(&handle).await.unwrap();
        mock.delete(&handle).await.unwrap();
        assert_eq!(mock.deletes_for("svc"), 2);
        mock.verify_no_leaks();
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let mock = MockProvisioning::new();
        mock.fail_create_for("K2");
        mock.fail_update_for("log");
        mock.fail_delete_for("log");

        assert!(matches!(
            mock.create("K2").await,
            Err(ProvisioningError::Create { .. })
        ));

        let conn = ConnectionId::new("c1");
        let handle = mock.create("K1").await.unwrap();
        let err = mock
            .update(&handle, props(&conn, &Key::new("log", "K1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Update { .. }));
        assert!(matches!(
            mock.delete(&handle).await,
            Err(ProvisioningError::Delete { .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_supply_provides_refuses_and_withdraws() {
        let supply = SupplyChannel::new();
        let conn = ConnectionId::new("c1");
        let mut notices = supply.register(&conn);
        let mock = MockProvisioning::new().auto_supply(supply.clone());
        mock.refuse_supply_for("auth", "no credentials");

        let svc = mock.create("K1").await.unwrap();
        mock.update(&svc, props(&conn, &Key::new("svc", "K1"))).await.unwrap();
        let auth = mock.create("K2").await.unwrap();
        mock.update(&auth, props(&conn, &Key::new("auth", "K2"))).await.unwrap();
        mock.delete(&svc).await.unwrap();

        assert!(matches!(notices.recv().await, Some(SupplyNotice::Provided { .. })));
        match notices.recv().await {
            Some(SupplyNotice::Failed { key, reason }) => {
                assert_eq!(key, Key::new("auth", "K2"));
                assert_eq!(reason, "no credentials");
            }
            other => panic!("unexpected notice: {other:?}"),
        }
        assert!(matches!(notices.recv().await, Some(SupplyNotice::Withdrawn { .. })));
    }
}
