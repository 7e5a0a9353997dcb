//! Pipeline stages and the context they act through.
//!
//! A stage never touches the [`Pipeline`](super::Pipeline) directly. Each
//! callback receives a [`StageContext`] and records what should happen next
//! (forward a read, fire an event, remove itself). The pipeline applies those
//! actions after the callback returns, on the connection's own task.

use std::fmt::Debug;
use std::sync::Arc;

/// Events travelling through the pipeline alongside inbound data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Fired by the completion sentinel once every stage ahead of it is in place.
    AssemblyComplete { generation: u64 },
    /// Application-defined event.
    User(String),
}

/// One processing stage of a connection pipeline.
///
/// All callbacks have defaults: reads and events are forwarded unchanged.
pub trait Stage: Send + Sync + 'static {
    /// Called right after the stage was placed into the pipeline.
    fn handler_added(&self, _ctx: &mut StageContext) {}

    /// Called right after the stage was taken out of the pipeline.
    fn handler_removed(&self, _ctx: &mut StageContext) {}

    fn on_read(&self, ctx: &mut StageContext, msg: String) {
        ctx.fire_read(msg);
    }

    fn on_event(&self, ctx: &mut StageContext, event: PipelineEvent) {
        ctx.fire_event(event);
    }
}

pub type StageRef = Arc<dyn Stage>;

impl Debug for dyn Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Stage")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StageAction {
    FireRead(String),
    FireEvent(PipelineEvent),
    FireEventFromHead(PipelineEvent),
    SetReadEnabled(bool),
    RemoveSelf,
}

/// Handle given to a stage callback.
#[derive(Debug)]
pub struct StageContext {
    name: String,
    actions: Vec<StageAction>,
}

impl StageContext {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
        }
    }

    /// Name the stage is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forwards a read to the next stage.
    pub fn fire_read(&mut self, msg: String) {
        self.actions.push(StageAction::FireRead(msg));
    }

    /// Forwards an event to the next stage.
    pub fn fire_event(&mut self, event: PipelineEvent) {
        self.actions.push(StageAction::FireEvent(event));
    }

    /// Fires an event from the head of the pipeline, so every stage sees it.
    pub fn fire_pipeline_event(&mut self, event: PipelineEvent) {
        self.actions.push(StageAction::FireEventFromHead(event));
    }

    /// Turns inbound data flow on or off for the whole connection.
    pub fn set_read_enabled(&mut self, enabled: bool) {
        self.actions.push(StageAction::SetReadEnabled(enabled));
    }

    /// Takes this stage out of the pipeline once the callback returns.
    pub fn remove_self(&mut self) {
        self.actions.push(StageAction::RemoveSelf);
    }

    pub(crate) fn into_actions(self) -> Vec<StageAction> {
        self.actions
    }
}

/// Stage that tags every read with its name and forwards it.
///
/// Handy for observing stage order from the tail.
#[derive(Debug, Clone)]
pub struct TagStage {
    tag: String,
}

impl TagStage {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Stage for TagStage {
    fn on_read(&self, ctx: &mut StageContext, msg: String) {
        ctx.fire_read(format!("{msg}|{}", self.tag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_records_actions_in_order() {
        let mut ctx = StageContext::new("sentinel");
        ctx.fire_pipeline_event(PipelineEvent::AssemblyComplete { generation: 1 });
        ctx.remove_self();
        assert_eq!(ctx.name(), "sentinel");
        assert_eq!(
            ctx.into_actions(),
            vec![
                StageAction::FireEventFromHead(PipelineEvent::AssemblyComplete { generation: 1 }),
                StageAction::RemoveSelf,
            ]
        );
    }

    #[test]
    fn test_tag_stage_appends_tag() {
        let stage = TagStage::new("svc");
        let mut ctx = StageContext::new("svc");
        stage.on_read(&mut ctx, "hello".into());
        assert_eq!(
            ctx.into_actions(),
            vec![StageAction::FireRead("hello|svc".into())]
        );
    }
}
