use crate::model::{ConfigHandle, HandlerRecord};
use crate::pipeline::{StageRef, TagStage};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Builds stages for one provider kind.
///
/// The admin actor calls [`create_stage`](HandlerFactory::create_stage) every
/// time a record of this kind receives properties, and
/// [`deleted`](HandlerFactory::deleted) when the record goes away.
pub trait HandlerFactory: Send + Sync + 'static {
    fn create_stage(&self, record: &HandlerRecord) -> Result<StageRef, String>;

    fn deleted(&self, _handle: &ConfigHandle) {}
}

/// Factory backed by a closure.
pub struct FnFactory<F>(F);

impl<F> FnFactory<F>
where
    F: Fn(&HandlerRecord) -> Result<StageRef, String> + Send + Sync + 'static,
{
    pub fn new(build: F) -> Self {
        Self(build)
    }
}

impl<F> HandlerFactory for FnFactory<F>
where
    F: Fn(&HandlerRecord) -> Result<StageRef, String> + Send + Sync + 'static,
{
    fn create_stage(&self, record: &HandlerRecord) -> Result<StageRef, String> {
        (self.0)(record)
    }
}

/// Builds a [`TagStage`] named after the record's handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagFactory;

impl HandlerFactory for TagFactory {
    fn create_stage(&self, record: &HandlerRecord) -> Result<StageRef, String> {
        Ok(Arc::new(TagStage::new(record.key.handler_name())))
    }
}

/// Refuses every record with a fixed reason.
#[derive(Debug, Clone)]
pub struct RejectingFactory {
    reason: String,
}

impl RejectingFactory {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl HandlerFactory for RejectingFactory {
    fn create_stage(&self, _record: &HandlerRecord) -> Result<StageRef, String> {
        Err(self.reason.clone())
    }
}

/// Provider kind → factory. Shared between the admin actor and whoever
/// registers factories; registration may happen while the actor runs.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn HandlerFactory>>>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, factory: impl HandlerFactory) {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), Arc::new(factory));
    }

    pub fn unregister(&self, kind: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind)
            .is_some()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn HandlerFactory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.get(kind).is_some()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }
}
