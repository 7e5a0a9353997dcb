//! # Supply Channel
//!
//! The inbound path by which the provisioning backend hands handler instances
//! to coordinators.
//!
//! The backend never holds a coordinator reference. It only knows the
//! connection id and the [`Key`] stamped into a configuration record, and
//! calls [`SupplyChannel::provide`], [`SupplyChannel::withdraw`] or
//! [`SupplyChannel::fail`]. The channel fans each notification out to the
//! coordinator registered for that connection.
//!
//! All three calls are synchronous and safe to make concurrently from any
//! thread, for any mix of keys and connections.

use crate::model::{ConnectionId, Key};
use crate::pipeline::StageRef;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Notification delivered to a registered coordinator.
#[derive(Debug)]
pub enum SupplyNotice {
    Provided { key: Key, stage: StageRef },
    Withdrawn { key: Key },
    Failed { key: Key, reason: String },
}

impl SupplyNotice {
    pub fn key(&self) -> &Key {
        match self {
            SupplyNotice::Provided { key, .. }
            | SupplyNotice::Withdrawn { key }
            | SupplyNotice::Failed { key, .. } => key,
        }
    }
}

type Routes = HashMap<ConnectionId, mpsc::UnboundedSender<SupplyNotice>>;

/// Routing table from connection id to the coordinator's inbox.
#[derive(Clone, Default)]
pub struct SupplyChannel {
    routes: Arc<RwLock<Routes>>,
}

impl SupplyChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the inbox for `connection`, replacing any previous one.
    pub fn register(&self, connection: &ConnectionId) -> mpsc::UnboundedReceiver<SupplyNotice> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.insert(connection.clone(), sender).is_some() {
            warn!(%connection, "Supply route replaced");
        }
        debug!(%connection, routes = routes.len(), "Supply route registered");
        receiver
    }

    pub fn unregister(&self, connection: &ConnectionId) {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        if routes.remove(connection).is_some() {
            debug!(%connection, routes = routes.len(), "Supply route removed");
        }
    }

    pub fn is_registered(&self, connection: &ConnectionId) -> bool {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(connection)
    }

    /// Delivers a handler instance for `key`. Returns `false` when no
    /// coordinator is listening for `connection`.
    pub fn provide(&self, connection: &ConnectionId, key: Key, stage: StageRef) -> bool {
        self.route(connection, SupplyNotice::Provided { key, stage })
    }

    /// Reports that the handler for `key` went away.
    pub fn withdraw(&self, connection: &ConnectionId, key: Key) -> bool {
        self.route(connection, SupplyNotice::Withdrawn { key })
    }

    /// Reports that the backend cannot supply a handler for `key`.
    pub fn fail(&self, connection: &ConnectionId, key: Key, reason: impl Into<String>) -> bool {
        self.route(
            connection,
            SupplyNotice::Failed {
                key,
                reason: reason.into(),
            },
        )
    }

    fn route(&self, connection: &ConnectionId, notice: SupplyNotice) -> bool {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = routes.get(connection) else {
            debug!(%connection, key = %notice.key(), "No supply route, notice dropped");
            return false;
        };
        let key = notice.key().clone();
        if sender.send(notice).is_err() {
            debug!(%connection, %key, "Supply route closed, notice dropped");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::TagStage;

    #[tokio::test]
    async fn test_notices_reach_only_their_connection() {
        let supply = SupplyChannel::new();
        let a = ConnectionId::new("a");
        let b = ConnectionId::new("b");
        let mut rx_a = supply.register(&a);
        let mut rx_b = supply.register(&b);

        assert!(supply.provide(&a, Key::new("svc", "K1"), std::sync::Arc::new(TagStage::new("svc"))));
        assert!(supply.withdraw(&b, Key::new("log", "K1")));

        match rx_a.recv().await {
            Some(SupplyNotice::Provided { key, .. }) => assert_eq!(key, Key::new("svc", "K1")),
            other => panic!("unexpected notice: {other:?}"),
        }
        match rx_b.recv().await {
            Some(SupplyNotice::Withdrawn { key }) => assert_eq!(key, Key::new("log", "K1")),
            other => panic!("unexpected notice: {other:?}"),
        }
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_unrouted_notice_is_dropped() {
        let supply = SupplyChannel::new();
        let conn = ConnectionId::new("gone");
        assert!(!supply.fail(&conn, Key::new("svc", "K1"), "nope"));

        let rx = supply.register(&conn);
        drop(rx);
        assert!(!supply.withdraw(&conn, Key::new("svc", "K1")));

        supply.unregister(&conn);
        assert!(!supply.is_registered(&conn));
    }

    #[test]
    fn test_concurrent_provides_from_many_threads() {
        let supply = SupplyChannel::new();
        let conn = ConnectionId::new("shared");
        let mut rx = supply.register(&conn);

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let supply = supply.clone();
                let conn = conn.clone();
                std::thread::spawn(move || {
                    supply.provide(
                        &conn,
                        Key::new(format!("h{i}"), "K"),
                        std::sync::Arc::new(TagStage::new("x")),
                    )
                })
            })
            .collect();
        for t in threads {
            assert!(t.join().unwrap());
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 8);
    }
}
