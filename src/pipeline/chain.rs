//! The ordered, named chain of stages belonging to one connection.
//!
//! ```text
//!   inbound ──► [stage 0] ──► [stage 1] ──► ... ──► [stage n-1] ──► tail
//!                  ▲                                                  │
//!                  └──── fire_pipeline_event restarts here            └─► delivered / tail_events
//! ```
//!
//! `Pipeline` is not thread safe by construction: it is owned by the
//! connection's [`AffinityLoop`](super::AffinityLoop) and only mutated from jobs
//! submitted through [`Affinity`](super::Affinity).

use super::stage::{PipelineEvent, StageAction, StageContext, StageRef};
use crate::error::PipelineError;
use crate::model::ConnectionId;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Name reported for the implicit last position of every pipeline.
pub const TAIL_NAME: &str = "tail";

struct Entry {
    name: String,
    stage: StageRef,
}

pub struct Pipeline {
    connection: ConnectionId,
    stages: Vec<Entry>,
    active: bool,
    read_enabled: bool,
    read_enable_count: u64,
    buffered: VecDeque<String>,
    delivered: Vec<String>,
    tail_events: Vec<PipelineEvent>,
}

impl Pipeline {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            stages: Vec::new(),
            active: true,
            read_enabled: true,
            read_enable_count: 0,
            buffered: VecDeque::new(),
            delivered: Vec::new(),
            tail_events: Vec::new(),
        }
    }

    /// A pipeline that buffers reads until something enables them.
    /// Starting gated does not count as a toggle.
    pub fn gated(connection: ConnectionId) -> Self {
        Self {
            read_enabled: false,
            ..Self::new(connection)
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stage names in order, followed by [`TAIL_NAME`].
    pub fn names(&self) -> Vec<String> {
        self.stages
            .iter()
            .map(|entry| entry.name.clone())
            .chain(std::iter::once(TAIL_NAME.to_string()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Places `stage` immediately after the stage named `base`.
    pub fn insert_after(
        &mut self,
        base: &str,
        name: &str,
        stage: StageRef,
    ) -> Result<(), PipelineError> {
        self.ensure_active(|| format!("insert {name} after {base}"))?;
        if self.contains(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        let index = self
            .position(base)
            .ok_or_else(|| PipelineError::StageNotFound(base.to_string()))?;
        self.attach(index + 1, name, stage);
        Ok(())
    }

    /// Appends `stage` as the last stage before the tail.
    pub fn add_last(&mut self, name: &str, stage: StageRef) -> Result<(), PipelineError> {
        self.ensure_active(|| format!("add {name}"))?;
        if self.contains(name) {
            return Err(PipelineError::DuplicateName(name.to_string()));
        }
        self.attach(self.stages.len(), name, stage);
        Ok(())
    }

    /// Removes the stage named `name` and returns it.
    pub fn remove(&mut self, name: &str) -> Result<StageRef, PipelineError> {
        self.ensure_active(|| format!("remove {name}"))?;
        let index = self
            .position(name)
            .ok_or_else(|| PipelineError::StageNotFound(name.to_string()))?;
        Ok(self.detach(index))
    }

    pub fn is_read_enabled(&self) -> bool {
        self.read_enabled
    }

    /// Number of disabled → enabled transitions so far.
    pub fn read_enable_count(&self) -> u64 {
        self.read_enable_count
    }

    /// Gates inbound data. Enabling flushes buffered reads in arrival order.
    pub fn set_read_enabled(&mut self, enabled: bool) {
        if enabled == self.read_enabled {
            return;
        }
        self.read_enabled = enabled;
        debug!(connection = %self.connection, enabled, "Read gating changed");
        if enabled {
            self.read_enable_count += 1;
            while self.read_enabled {
                match self.buffered.pop_front() {
                    Some(msg) => self.dispatch_read(0, msg),
                    None => break,
                }
            }
        }
    }

    /// Inbound data from the transport.
    pub fn inbound(&mut self, msg: String) -> Result<(), PipelineError> {
        self.ensure_active(|| "inbound read".to_string())?;
        if self.read_enabled {
            self.dispatch_read(0, msg);
        } else {
            trace!(connection = %self.connection, "Read buffered");
            self.buffered.push_back(msg);
        }
        Ok(())
    }

    /// Fires `event` from the head of the pipeline.
    pub fn fire_event(&mut self, event: PipelineEvent) -> Result<(), PipelineError> {
        self.ensure_active(|| "fire event".to_string())?;
        self.dispatch_event(0, event);
        Ok(())
    }

    pub fn buffered_reads(&self) -> usize {
        self.buffered.len()
    }

    /// Reads that travelled past the last stage.
    pub fn delivered(&self) -> &[String] {
        &self.delivered
    }

    /// Events that travelled past the last stage.
    pub fn tail_events(&self) -> &[PipelineEvent] {
        &self.tail_events
    }

    /// Marks the pipeline inactive and tears every stage down, last to first.
    ///
    /// Actions queued by `handler_removed` callbacks are discarded.
    pub fn deactivate(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        while let Some(entry) = self.stages.pop() {
            let mut ctx = StageContext::new(&entry.name);
            entry.stage.handler_removed(&mut ctx);
            debug!(connection = %self.connection, stage = %entry.name, "Stage torn down");
        }
        self.buffered.clear();
    }

    fn ensure_active(&self, operation: impl FnOnce() -> String) -> Result<(), PipelineError> {
        if self.active {
            Ok(())
        } else {
            Err(PipelineError::StaleMutation {
                connection: self.connection.clone(),
                operation: operation(),
            })
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|entry| entry.name == name)
    }

    fn attach(&mut self, index: usize, name: &str, stage: StageRef) {
        self.stages.insert(
            index,
            Entry {
                name: name.to_string(),
                stage: stage.clone(),
            },
        );
        debug!(connection = %self.connection, stage = name, index, "Stage added");
        let mut ctx = StageContext::new(name);
        stage.handler_added(&mut ctx);
        self.apply(name, index, ctx.into_actions());
    }

    fn detach(&mut self, index: usize) -> StageRef {
        let entry = self.stages.remove(index);
        debug!(connection = %self.connection, stage = %entry.name, "Stage removed");
        let mut ctx = StageContext::new(&entry.name);
        entry.stage.handler_removed(&mut ctx);
        self.apply(&entry.name, index, ctx.into_actions());
        entry.stage
    }

    fn dispatch_read(&mut self, start: usize, msg: String) {
        let Some((name, stage)) = self.entry_at(start) else {
            self.delivered.push(msg);
            return;
        };
        let mut ctx = StageContext::new(&name);
        stage.on_read(&mut ctx, msg);
        self.apply(&name, start, ctx.into_actions());
    }

    fn dispatch_event(&mut self, start: usize, event: PipelineEvent) {
        let Some((name, stage)) = self.entry_at(start) else {
            trace!(connection = %self.connection, ?event, "Event reached tail");
            self.tail_events.push(event);
            return;
        };
        let mut ctx = StageContext::new(&name);
        stage.on_event(&mut ctx, event);
        self.apply(&name, start, ctx.into_actions());
    }

    fn entry_at(&self, index: usize) -> Option<(String, StageRef)> {
        self.stages
            .get(index)
            .map(|entry| (entry.name.clone(), entry.stage.clone()))
    }

    /// Applies the actions a stage queued. `index` is where the stage sat
    /// when the callback ran; it becomes the successor's index once removed.
    fn apply(&mut self, name: &str, index: usize, actions: Vec<StageAction>) {
        for action in actions {
            if !self.active {
                return;
            }
            let next = self.position(name).map_or(index, |i| i + 1);
            match action {
                StageAction::FireRead(msg) => self.dispatch_read(next, msg),
                StageAction::FireEvent(event) => self.dispatch_event(next, event),
                StageAction::FireEventFromHead(event) => self.dispatch_event(0, event),
                StageAction::SetReadEnabled(enabled) => self.set_read_enabled(enabled),
                StageAction::RemoveSelf => {
                    if let Some(i) = self.position(name) {
                        self.detach(i);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{Stage, TagStage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pipeline() -> Pipeline {
        Pipeline::new(ConnectionId::new("conn-test"))
    }

    fn tag(name: &str) -> StageRef {
        Arc::new(TagStage::new(name))
    }

    #[test]
    fn test_gated_pipeline_buffers_first_reads() {
        let mut p = Pipeline::gated(ConnectionId::new("conn-test"));
        p.add_last("a", tag("a")).unwrap();
        p.inbound("early".into()).unwrap();
        assert!(p.delivered().is_empty());
        assert_eq!(p.read_enable_count(), 0);

        p.set_read_enabled(true);
        assert_eq!(p.delivered(), ["early|a".to_string()]);
        assert_eq!(p.read_enable_count(), 1);
    }

    #[test]
    fn test_insert_after_orders_stages() {
        let mut p = pipeline();
        p.add_last("anchor", tag("anchor")).unwrap();
        p.insert_after("anchor", "a", tag("a")).unwrap();
        p.insert_after("a", "b", tag("b")).unwrap();
        p.insert_after("anchor", "first", tag("first")).unwrap();

        assert_eq!(p.names(), vec!["anchor", "first", "a", "b", TAIL_NAME]);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_unknown_base() {
        let mut p = pipeline();
        p.add_last("anchor", tag("anchor")).unwrap();
        assert_eq!(
            p.add_last("anchor", tag("x")),
            Err(PipelineError::DuplicateName("anchor".into()))
        );
        assert_eq!(
            p.insert_after("missing", "x", tag("x")),
            Err(PipelineError::StageNotFound("missing".into()))
        );
    }

    #[test]
    fn test_reads_flow_head_to_tail() {
        let mut p = pipeline();
        p.add_last("a", tag("a")).unwrap();
        p.add_last("b", tag("b")).unwrap();
        p.inbound("m".into()).unwrap();
        assert_eq!(p.delivered(), ["m|a|b".to_string()]);
    }

    #[test]
    fn test_read_gating_buffers_and_flushes() {
        let mut p = pipeline();
        p.add_last("a", tag("a")).unwrap();
        p.set_read_enabled(false);
        p.inbound("1".into()).unwrap();
        p.inbound("2".into()).unwrap();
        assert!(p.delivered().is_empty());
        assert_eq!(p.buffered_reads(), 2);

        p.set_read_enabled(true);
        p.set_read_enabled(true);
        assert_eq!(p.delivered(), ["1|a".to_string(), "2|a".to_string()]);
        assert_eq!(p.read_enable_count(), 1);
    }

    struct OneShot;

    impl Stage for OneShot {
        fn handler_added(&self, ctx: &mut StageContext) {
            ctx.fire_pipeline_event(PipelineEvent::User("ready".into()));
            ctx.remove_self();
        }
    }

    #[test]
    fn test_stage_can_fire_from_head_and_remove_itself() {
        let mut p = pipeline();
        p.add_last("a", tag("a")).unwrap();
        p.add_last("oneshot", Arc::new(OneShot)).unwrap();

        assert_eq!(p.names(), vec!["a", TAIL_NAME]);
        assert_eq!(p.tail_events(), [PipelineEvent::User("ready".into())]);
    }

    struct CountRemovals(Arc<AtomicUsize>);

    impl Stage for CountRemovals {
        fn handler_removed(&self, _ctx: &mut StageContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_deactivate_tears_down_and_rejects_mutations() {
        let removed = Arc::new(AtomicUsize::new(0));
        let mut p = pipeline();
        p.add_last("a", Arc::new(CountRemovals(removed.clone()))).unwrap();
        p.add_last("b", Arc::new(CountRemovals(removed.clone()))).unwrap();

        p.deactivate();
        assert_eq!(removed.load(Ordering::SeqCst), 2);
        assert_eq!(p.names(), vec![TAIL_NAME]);

        let err = p.add_last("c", tag("c")).unwrap_err();
        assert!(err.is_stale());
        assert!(p.remove("a").unwrap_err().is_stale());
    }
}
