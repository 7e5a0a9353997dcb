//! The two stages a coordinator places into its connection's pipeline.
//!
//! [`AnchorStage`] is the coordinator's own fixed position: dynamic stages are
//! inserted after it, and it is where the assembly signal is turned back into
//! a coordinator event. [`CompletionSentinel`] is appended after the last
//! dynamic stage of a cycle. As soon as the pipeline reports it added, it fires
//! [`PipelineEvent::AssemblyComplete`] from the head and removes itself.

use super::message::CoordinatorEvent;
use crate::pipeline::{PipelineEvent, Stage, StageContext};
use tokio::sync::mpsc;
use tracing::debug;

/// Pipeline name of the completion sentinel while it is in place.
pub const SENTINEL_NAME: &str = "completionSentinel";

pub(crate) struct AnchorStage {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl AnchorStage {
    pub(crate) fn new(events: mpsc::UnboundedSender<CoordinatorEvent>) -> Self {
        Self { events }
    }
}

impl Stage for AnchorStage {
    fn handler_removed(&self, ctx: &mut StageContext) {
        debug!(stage = ctx.name(), "Anchor removed");
        let _ = self.events.send(CoordinatorEvent::AnchorRemoved);
    }

    fn on_event(&self, ctx: &mut StageContext, event: PipelineEvent) {
        if let PipelineEvent::AssemblyComplete { generation } = event {
            ctx.set_read_enabled(true);
            let _ = self.events.send(CoordinatorEvent::Assembled { generation });
        }
        ctx.fire_event(event);
    }
}

pub(crate) struct CompletionSentinel {
    generation: u64,
}

impl CompletionSentinel {
    pub(crate) fn new(generation: u64) -> Self {
        Self { generation }
    }
}

impl Stage for CompletionSentinel {
    fn handler_added(&self, ctx: &mut StageContext) {
        ctx.fire_pipeline_event(PipelineEvent::AssemblyComplete {
            generation: self.generation,
        });
        ctx.remove_self();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionId;
    use crate::pipeline::{Pipeline, TagStage, TAIL_NAME};
    use std::sync::Arc;

    #[test]
    fn test_sentinel_signals_anchor_and_leaves() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = Pipeline::new(ConnectionId::new("c"));
        p.add_last("anchor", Arc::new(AnchorStage::new(tx))).unwrap();
        p.insert_after("anchor", "svc", Arc::new(TagStage::new("svc"))).unwrap();
        p.set_read_enabled(false);
        p.inbound("early".into()).unwrap();

        p.add_last(SENTINEL_NAME, Arc::new(CompletionSentinel::new(3))).unwrap();

        assert_eq!(p.names(), vec!["anchor", "svc", TAIL_NAME]);
        assert!(matches!(
            rx.try_recv(),
            Ok(CoordinatorEvent::Assembled { generation: 3 })
        ));
        assert!(p.is_read_enabled());
        assert_eq!(p.read_enable_count(), 1);
        assert_eq!(p.delivered(), ["early|svc".to_string()]);
        assert_eq!(
            p.tail_events(),
            [PipelineEvent::AssemblyComplete { generation: 3 }]
        );
    }

    #[test]
    fn test_anchor_removal_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut p = Pipeline::new(ConnectionId::new("c"));
        p.add_last("anchor", Arc::new(AnchorStage::new(tx))).unwrap();
        p.remove("anchor").unwrap();
        assert!(matches!(rx.try_recv(), Ok(CoordinatorEvent::AnchorRemoved)));
    }
}
