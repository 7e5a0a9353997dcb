use pipeline_orchestrator::backend::{Backend, FnFactory, RejectingFactory, TagFactory};
use pipeline_orchestrator::config::{OrchestratorConfig, DEFAULT_ANCHOR_NAME};
use pipeline_orchestrator::coordinator::LifecycleState;
use pipeline_orchestrator::error::{OrchestratorError, ProvisioningError};
use pipeline_orchestrator::lifecycle::SessionManager;
use pipeline_orchestrator::model::{ConnectionId, DesiredSet, HandlerRecord, Key, PropertyValue};
use pipeline_orchestrator::pipeline::{StageRef, TagStage, TAIL_NAME};
use pipeline_orchestrator::supply::SupplyChannel;
use std::sync::Arc;
use std::time::Duration;

/// Backend with factories for `K1`..`K3` plus a manager wired to it.
fn system(config: OrchestratorConfig) -> (Backend, SessionManager) {
    let supply = SupplyChannel::new();
    let backend = Backend::start(supply.clone(), 64);
    for kind in ["K1", "K2", "K3"] {
        backend.factories.register(kind, TagFactory);
    }
    let manager = SessionManager::new(config, Arc::new(backend.client.clone()), supply)
        .expect("valid config");
    (backend, manager)
}

fn desired(pairs: &[(&str, &str)]) -> DesiredSet {
    DesiredSet::from_pairs(pairs.iter().copied()).unwrap()
}

fn names(stages: &[&str]) -> Vec<String> {
    let mut all = vec![DEFAULT_ANCHOR_NAME.to_string()];
    all.extend(stages.iter().map(|s| s.to_string()));
    all.push(TAIL_NAME.to_string());
    all
}

/// Full lifecycle against the in-memory configuration admin.
#[tokio::test]
async fn test_full_connection_lifecycle() {
    let (backend, manager) = system(OrchestratorConfig::default());

    let (id, ready) = manager
        .open(desired(&[("svc", "K1"), ("log", "K1"), ("auth", "K2")]))
        .await
        .expect("activation failed");
    assert_eq!(ready.connection, id);

    let connection = manager.connection(&id).await.expect("connection not found");
    assert_eq!(connection.names().await.unwrap(), names(&["svc", "log", "auth"]));
    assert_eq!(backend.client.list().await.unwrap().len(), 3);

    connection.deliver("hello").await.unwrap();
    assert_eq!(
        connection.delivered().await.unwrap(),
        vec!["hello|svc|log|auth".to_string()]
    );

    manager.close(&id).await.expect("close failed");
    assert!(backend.client.list().await.unwrap().is_empty());
    assert!(connection.names().await.is_err());
    assert!(manager.connections().await.is_empty());

    manager.shutdown().await.unwrap();
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_records_are_stamped_for_their_connection() {
    let mut config = OrchestratorConfig::default();
    config.app_name = "gateway".into();
    config.inet_port = 8443;
    config
        .extra_properties
        .insert("extra.mode".into(), PropertyValue::from("strict"));
    let (backend, manager) = system(config);

    let (id, _) = manager.open(desired(&[("svc", "K1")])).await.unwrap();

    let records = backend.client.list().await.unwrap();
    assert_eq!(records.len(), 1);
    let properties = records[0].properties.clone().expect("record never updated");
    let record = HandlerRecord::from_properties(&properties).unwrap();
    assert_eq!(record.connection, id);
    assert_eq!(record.key, Key::new("svc", "K1"));
    assert_eq!(record.app_name, "gateway");
    assert_eq!(record.inet_port, 8443);
    assert_eq!(record.extras.get("mode"), Some(&PropertyValue::from("strict")));

    manager.shutdown().await.unwrap();
    assert!(backend.client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_modify_reconciles_pipeline_and_records() {
    let (backend, manager) = system(OrchestratorConfig::default());
    let (id, _) = manager
        .open(desired(&[("A", "K1"), ("B", "K1"), ("C", "K2")]))
        .await
        .unwrap();
    let connection = manager.connection(&id).await.unwrap();

    manager
        .modify(&id, desired(&[("B", "K1"), ("C", "K2"), ("D", "K3")]))
        .await
        .unwrap();

    assert_eq!(connection.names().await.unwrap(), names(&["B", "C", "D"]));
    assert_eq!(connection.read_enable_count().await.unwrap(), 2);

    let snapshot = manager.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.state, LifecycleState::Ready);
    let mut owned: Vec<_> = snapshot.handles.into_iter().map(|(_, handle)| handle).collect();
    owned.sort();
    let mut held: Vec<_> = backend
        .client
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.handle)
        .collect();
    held.sort();
    assert_eq!(owned, held);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_modifies_are_serialized() {
    let (backend, manager) = system(OrchestratorConfig::default());
    let (id, _) = manager
        .open(desired(&[("Y", "K1"), ("A", "K1")]))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        manager.modify(&id, desired(&[("Y", "K1"), ("A", "K1"), ("X", "K2")])),
        manager.modify(&id, desired(&[("A", "K1"), ("X", "K2")])),
    );
    first.unwrap();
    second.unwrap();

    let connection = manager.connection(&id).await.unwrap();
    assert_eq!(connection.names().await.unwrap(), names(&["A", "X"]));
    assert_eq!(backend.client.list().await.unwrap().len(), 2);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_handler_fails_activation_and_cleans_up() {
    let (backend, manager) = system(OrchestratorConfig::default());
    backend
        .factories
        .register("K2", RejectingFactory::new("auth backend unreachable"));

    let err = manager
        .open(desired(&[("svc", "K1"), ("auth", "K2")]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        OrchestratorError::SupplyFailure {
            key: Key::new("auth", "K2"),
            reason: "auth backend unreachable".into(),
        }
    );
    assert!(manager.connections().await.is_empty());
    assert!(backend.client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_provider_kind_fails_activation() {
    let (backend, manager) = system(OrchestratorConfig::default());

    let err = manager
        .open(desired(&[("svc", "K1"), ("cache", "K9")]))
        .await
        .unwrap_err();

    match err {
        OrchestratorError::Provisioning { key, source } => {
            assert_eq!(key.handler_name(), "cache");
            assert_eq!(source, ProvisioningError::UnknownKind("K9".into()));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(backend.client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_custom_factory_stage_sees_traffic() {
    let (backend, manager) = system(OrchestratorConfig::default());
    backend.factories.register(
        "upper",
        FnFactory::new(|record: &HandlerRecord| {
            let stage: StageRef = Arc::new(TagStage::new(record.key.handler_name().to_uppercase()));
            Ok(stage)
        }),
    );

    let (id, _) = manager
        .open(desired(&[("svc", "K1"), ("shout", "upper")]))
        .await
        .unwrap();
    let connection = manager.connection(&id).await.unwrap();
    connection.deliver("x").await.unwrap();

    assert_eq!(connection.delivered().await.unwrap(), vec!["x|svc|SHOUT".to_string()]);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_close_tears_down_records() {
    let (backend, manager) = system(OrchestratorConfig::default());
    let (id, _) = manager
        .open(desired(&[("a", "K1"), ("b", "K2")]))
        .await
        .unwrap();
    let (other, _) = manager.open(desired(&[("c", "K3")])).await.unwrap();
    let connection = manager.connection(&id).await.unwrap();

    connection.close().await;

    let mut discarded = false;
    for _ in 0..300 {
        let records = backend.client.list().await.unwrap();
        if manager.connections().await == vec![other.clone()] && records.len() == 1 {
            discarded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(discarded, "session was not discarded with its connection");
    assert!(matches!(
        manager.snapshot(&id).await,
        Err(OrchestratorError::UnknownConnection(_))
    ));
    assert!(matches!(
        manager.close(&id).await,
        Err(OrchestratorError::UnknownConnection(_))
    ));

    manager.shutdown().await.unwrap();
    assert!(backend.client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_connections_are_independent() {
    let (backend, manager) = system(OrchestratorConfig::default());
    let (first, _) = manager.open(desired(&[("a", "K1")])).await.unwrap();
    let (second, _) = manager
        .open(desired(&[("a", "K1"), ("b", "K2")]))
        .await
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(backend.client.list().await.unwrap().len(), 3);

    manager.close(&first).await.unwrap();

    assert_eq!(backend.client.list().await.unwrap().len(), 2);
    let connection = manager.connection(&second).await.unwrap();
    assert_eq!(connection.names().await.unwrap(), names(&["a", "b"]));
    assert!(matches!(
        manager.modify(&first, DesiredSet::empty()).await,
        Err(OrchestratorError::UnknownConnection(_))
    ));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_attach_rejects_duplicate_connection() {
    let (_backend, manager) = system(OrchestratorConfig::default());
    let id = ConnectionId::new("edge-1");
    manager.attach(id.clone(), DesiredSet::empty()).await.unwrap();

    let err = manager.attach(id, DesiredSet::empty()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidState { operation: "attach", .. }));

    manager.shutdown().await.unwrap();
}
