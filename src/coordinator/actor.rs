//! # Pipeline Coordinator Actor
//!
//! One actor per connection. It owns every piece of coordinator state (the
//! desired set, configuration handles, pending supplies, insertion records
//! and the lifecycle queue) and mutates it only inside its own run loop, so
//! none of it needs a lock.
//!
//! The loop multiplexes four inputs:
//!
//! | Input                | Source                                                        |
//! |----------------------|---------------------------------------------------------------|
//! | command mailbox      | [`CoordinatorClient`](super::CoordinatorClient) calls         |
//! | supply inbox         | [`SupplyChannel`] notifications from the backend              |
//! | event inbox          | provisioning tasks, insertion tasks and the anchor stage      |
//! | barrier deadline     | `supply_timeout_ms`, while an operation waits for supplies    |
//!
//! ## Lifecycle queue
//!
//! `activate`, `modify` and `close` are appended to a FIFO. The next entry is
//! started only after the one in flight has resolved, so overlapping calls on
//! one connection are totally ordered. A `close` entering the queue cancels
//! any operation that has not reached insertion yet.
//!
//! ## One cycle
//!
//! 1. *Pruning* (modify only): stages of removed keys are taken out of the
//!    pipeline and their records deleted.
//! 2. *Provisioning*: a pending supply is created for every desired key, then
//!    each key without a handle gets `create` + `update` on the worker pool.
//!    The barrier resolves once every desired key is supplied and fails fast on
//!    the first provisioning or supply error.
//! 3. *Inserting*: stages are inserted in desired order on the connection's
//!    affinity, each after its predecessor, then the completion sentinel is
//!    appended. Its signal enables reads and resolves the operation.

use super::client::CoordinatorClient;
use super::message::{CoordinatorEvent, CoordinatorRequest, Ready, Response};
use super::sentinel::{AnchorStage, CompletionSentinel, SENTINEL_NAME};
use super::state::{CoordinatorSnapshot, InsertionRecord, LifecycleState, PendingSupply};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, PipelineError, ProvisioningError, TeardownError};
use crate::model::{ConfigHandle, ConnectionId, DesiredSet, HandlerRecord, Key, Properties};
use crate::pipeline::{Affinity, StageRef};
use crate::provisioning::{ProvisioningClient, WorkerPool};
use crate::supply::{SupplyChannel, SupplyNotice};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Dependencies injected when the coordinator starts.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub affinity: Affinity,
    pub provisioning: Arc<dyn ProvisioningClient>,
    pub workers: WorkerPool,
    pub supply: SupplyChannel,
}

/// Creates the coordinator for `connection` and its client.
///
/// Spawn [`CoordinatorActor::run`] with a [`CoordinatorContext`] to start it.
pub fn new(
    connection: ConnectionId,
    config: Arc<OrchestratorConfig>,
) -> (CoordinatorActor, CoordinatorClient) {
    let (sender, commands) = mpsc::channel(config.command_buffer.max(1));
    let (events_tx, events) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let client = CoordinatorClient::new(connection.clone(), sender, closed.clone());
    let actor = CoordinatorActor {
        connection,
        config,
        commands,
        commands_open: true,
        events,
        events_tx,
        closed,
        state: LifecycleState::Inactive,
        desired: DesiredSet::empty(),
        handles: HashMap::new(),
        requested: HashSet::new(),
        pending: HashMap::new(),
        inserted: HashMap::new(),
        queue: VecDeque::new(),
        current: None,
        close_requested: false,
        close_waiters: Vec::new(),
        teardowns: 0,
        teardown_failures: Vec::new(),
        next_seq: 0,
        generation: 0,
    };
    (actor, client)
}

enum QueuedOp {
    Activate {
        desired: DesiredSet,
        respond_to: Response<Ready>,
    },
    Modify {
        desired: DesiredSet,
        respond_to: Response<()>,
    },
    Close {
        respond_to: Option<Response<()>>,
    },
}

impl QueuedOp {
    fn reject(self, error: impl FnOnce() -> OrchestratorError) -> Option<Response<()>> {
        match self {
            QueuedOp::Activate { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
                None
            }
            QueuedOp::Modify { respond_to, .. } => {
                let _ = respond_to.send(Err(error()));
                None
            }
            QueuedOp::Close { respond_to } => respond_to,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pruning,
    Provisioning,
    Inserting,
}

enum Responder {
    Activate(Response<Ready>),
    Modify(Response<()>),
}

impl Responder {
    fn operation(&self) -> &'static str {
        match self {
            Responder::Activate(_) => "activate",
            Responder::Modify(_) => "modify",
        }
    }

    fn succeed(self, ready: Ready) {
        match self {
            Responder::Activate(respond_to) => {
                let _ = respond_to.send(Ok(ready));
            }
            Responder::Modify(respond_to) => {
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn fail(self, error: OrchestratorError) {
        match self {
            Responder::Activate(respond_to) => {
                let _ = respond_to.send(Err(error));
            }
            Responder::Modify(respond_to) => {
                let _ = respond_to.send(Err(error));
            }
        }
    }
}

struct InFlight {
    seq: u64,
    phase: Phase,
    desired: DesiredSet,
    responder: Responder,
    deadline: Option<Instant>,
}

struct PlannedInsert {
    key: Key,
    base: String,
    stage: StageRef,
}

pub struct CoordinatorActor {
    connection: ConnectionId,
    config: Arc<OrchestratorConfig>,
    commands: mpsc::Receiver<CoordinatorRequest>,
    commands_open: bool,
    events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    events_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    closed: Arc<AtomicBool>,
    state: LifecycleState,
    desired: DesiredSet,
    handles: HashMap<Key, ConfigHandle>,
    /// Keys whose `create` is in flight.
    requested: HashSet<Key>,
    pending: HashMap<Key, PendingSupply>,
    inserted: HashMap<Key, InsertionRecord>,
    queue: VecDeque<QueuedOp>,
    current: Option<InFlight>,
    close_requested: bool,
    close_waiters: Vec<Response<()>>,
    /// Background deletions that have not reported yet.
    teardowns: usize,
    teardown_failures: Vec<TeardownError>,
    next_seq: u64,
    generation: u64,
}

impl CoordinatorActor {
    // =========================================================================
    // RUN LOOP
    // =========================================================================

    pub async fn run(mut self, ctx: CoordinatorContext) {
        let connection = self.connection.clone();
        info!(%connection, anchor = %self.config.anchor_name, "Coordinator started");

        let mut notices = ctx.supply.register(&connection);
        let mut notices_open = true;
        self.install_anchor(&ctx).await;
        self.pump(&ctx);

        while self.commands_open || self.state != LifecycleState::Closed {
            let deadline = self.barrier_deadline();
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(&ctx, event),
                notice = notices.recv(), if notices_open => match notice {
                    Some(notice) => self.handle_notice(&ctx, notice),
                    None => notices_open = false,
                },
                _ = sleep_until(deadline) => self.on_deadline(),
                request = self.commands.recv(), if self.commands_open => match request {
                    Some(request) => self.handle_request(&ctx, request),
                    None => {
                        self.commands_open = false;
                        if self.state != LifecycleState::Closed {
                            debug!(%connection, "All clients dropped, closing");
                            self.request_close(None);
                        }
                    }
                },
            }
            self.pump(&ctx);
        }

        ctx.supply.unregister(&connection);
        info!(%connection, generation = self.generation, "Coordinator stopped");
    }

    async fn install_anchor(&mut self, ctx: &CoordinatorContext) {
        let anchor = self.config.anchor_name.clone();
        let stage: StageRef = Arc::new(AnchorStage::new(self.events_tx.clone()));
        let result = ctx
            .affinity
            .mutate("install anchor", move |p| {
                p.set_read_enabled(false);
                p.add_last(&anchor, stage)
            })
            .await;
        match result {
            Ok(()) => debug!(connection = %self.connection, "Anchor installed, reads disabled"),
            Err(e) => {
                warn!(connection = %self.connection, error = %e, "Anchor install failed, closing");
                self.request_close(None);
            }
        }
    }

    fn barrier_deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .filter(|op| op.phase == Phase::Provisioning)
            .and_then(|op| op.deadline)
    }

    // =========================================================================
    // COMMANDS
    // =========================================================================

    fn handle_request(&mut self, ctx: &CoordinatorContext, request: CoordinatorRequest) {
        match request {
            CoordinatorRequest::Activate {
                desired,
                respond_to,
            } => {
                debug!(connection = %self.connection, ?desired, "Activate queued");
                self.enqueue(QueuedOp::Activate {
                    desired,
                    respond_to,
                });
            }
            CoordinatorRequest::Modify {
                desired,
                respond_to,
            } => {
                debug!(connection = %self.connection, ?desired, "Modify queued");
                self.enqueue(QueuedOp::Modify {
                    desired,
                    respond_to,
                });
            }
            CoordinatorRequest::Close { respond_to } => match self.state {
                LifecycleState::Closed => {
                    let _ = respond_to.send(Ok(()));
                }
                LifecycleState::Closing => self.close_waiters.push(respond_to),
                _ => self.request_close(Some(respond_to)),
            },
            CoordinatorRequest::Snapshot { respond_to } => {
                let _ = respond_to.send(Ok(self.snapshot()));
            }
        }
    }

    fn enqueue(&mut self, op: QueuedOp) {
        if self.state.is_terminal() {
            op.reject(|| OrchestratorError::Closed);
            return;
        }
        self.queue.push_back(op);
    }

    /// Queues a close. Operations still short of insertion are cancelled.
    fn request_close(&mut self, respond_to: Option<Response<()>>) {
        if self.close_requested || self.state.is_terminal() {
            if let Some(respond_to) = respond_to {
                self.close_waiters.push(respond_to);
            }
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.close_requested = true;
        self.queue.push_back(QueuedOp::Close { respond_to });

        let waiting = self
            .current
            .as_ref()
            .is_some_and(|op| op.phase != Phase::Inserting);
        if waiting {
            self.fail_current(OrchestratorError::Closed);
        }
    }

    /// Starts queued operations until one stays in flight.
    fn pump(&mut self, ctx: &CoordinatorContext) {
        while self.current.is_none() {
            let Some(op) = self.queue.pop_front() else {
                return;
            };
            self.start(ctx, op);
        }
    }

    fn start(&mut self, ctx: &CoordinatorContext, op: QueuedOp) {
        match op {
            QueuedOp::Close { respond_to } => self.begin_close(ctx, respond_to),
            _ if self.close_requested => {
                debug!(connection = %self.connection, "Operation cancelled by pending close");
                op.reject(|| OrchestratorError::Closed);
            }
            QueuedOp::Activate {
                desired,
                respond_to,
            } => {
                if self.state != LifecycleState::Inactive {
                    let _ = respond_to.send(Err(self.invalid_state("activate")));
                    return;
                }
                info!(connection = %self.connection, keys = desired.len(), "Activate");
                self.desired = desired.clone();
                self.begin_cycle(ctx, desired, Responder::Activate(respond_to), Vec::new());
            }
            QueuedOp::Modify {
                desired,
                respond_to,
            } => {
                if self.state != LifecycleState::Ready {
                    let _ = respond_to.send(Err(self.invalid_state("modify")));
                    return;
                }
                let to_remove = self.desired.removed_in(&desired);
                info!(
                    connection = %self.connection,
                    keys = desired.len(),
                    removed = to_remove.len(),
                    "Modify"
                );
                self.desired = desired.clone();
                self.begin_cycle(ctx, desired, Responder::Modify(respond_to), to_remove);
            }
        }
    }

    fn invalid_state(&self, operation: &'static str) -> OrchestratorError {
        warn!(connection = %self.connection, operation, state = %self.state, "Rejected");
        OrchestratorError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    // =========================================================================
    // CYCLE: PRUNE → PROVISION → INSERT
    // =========================================================================

    fn begin_cycle(
        &mut self,
        ctx: &CoordinatorContext,
        desired: DesiredSet,
        responder: Responder,
        to_remove: Vec<Key>,
    ) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.state = LifecycleState::Provisioning;
        self.current = Some(InFlight {
            seq,
            phase: Phase::Pruning,
            desired,
            responder,
            deadline: None,
        });

        if to_remove.is_empty() {
            self.begin_provisioning(ctx);
        } else {
            self.prune(ctx, seq, to_remove);
        }
    }

    /// Removes stages and deletes records of keys leaving the desired set.
    fn prune(&mut self, ctx: &CoordinatorContext, seq: u64, to_remove: Vec<Key>) {
        let mut stage_names = Vec::new();
        let mut deletions = Vec::new();
        for key in to_remove {
            self.pending.remove(&key);
            if self.inserted.remove(&key).is_some() {
                stage_names.push(key.handler_name().to_string());
            }
            if let Some(handle) = self.handles.remove(&key) {
                deletions.push((key, handle));
            }
        }
        debug!(
            connection = %self.connection,
            stages = ?stage_names,
            records = deletions.len(),
            "Pruning"
        );

        let affinity = ctx.affinity.clone();
        let deleting = delete_all(ctx, self.connection.clone(), deletions);
        let events = self.events_tx.clone();
        let connection = self.connection.clone();
        tokio::spawn(async move {
            for name in stage_names {
                remove_stage(&affinity, &connection, name).await;
            }
            for failure in deleting.await {
                warn!(%connection, error = %failure, "Delete failed while pruning");
            }
            let _ = events.send(CoordinatorEvent::Pruned { seq });
        });
    }

    fn begin_provisioning(&mut self, ctx: &CoordinatorContext) {
        let timeout = self.config.supply_timeout();
        let Some(op) = self.current.as_mut() else {
            return;
        };
        op.phase = Phase::Provisioning;
        op.deadline = timeout.map(|t| Instant::now() + t);
        let seq = op.seq;
        let keys = op.desired.keys().to_vec();

        // Pending supplies exist before any record is requested. Earlier
        // failures and withdrawals wait for a fresh supply.
        for key in &keys {
            match self.pending.get_mut(key) {
                Some(entry) if entry.is_supplied() => {}
                Some(entry) => *entry = PendingSupply::Waiting,
                None => {
                    self.pending.insert(key.clone(), PendingSupply::Waiting);
                }
            }
        }

        for key in keys {
            if self.requested.contains(&key) {
                continue;
            }
            let existing = match self.handles.get(&key) {
                Some(_) if self.pending.get(&key).is_some_and(PendingSupply::is_supplied) => {
                    continue;
                }
                Some(handle) => Some(handle.clone()),
                None => {
                    self.requested.insert(key.clone());
                    None
                }
            };
            let properties = HandlerRecord::properties(
                &self.config.app_name,
                &self.config.inet_host,
                self.config.inet_port,
                &self.connection,
                &key,
                &self.config.extra_properties,
            );
            match &existing {
                Some(handle) => {
                    debug!(connection = %self.connection, %key, %handle, "Updating record again")
                }
                None => debug!(connection = %self.connection, %key, "Provisioning"),
            }
            ctx.workers.spawn(provision_key(
                seq,
                key,
                existing,
                properties,
                ctx.provisioning.clone(),
                self.events_tx.clone(),
            ));
        }

        self.check_barrier(ctx);
    }

    /// Starts insertion once every desired key is supplied.
    fn check_barrier(&mut self, ctx: &CoordinatorContext) {
        let Some(op) = self.current.as_ref() else {
            return;
        };
        if op.phase != Phase::Provisioning {
            return;
        }
        let complete = op
            .desired
            .iter()
            .all(|key| self.pending.get(key).is_some_and(PendingSupply::is_supplied));
        if complete {
            self.begin_insertion(ctx);
        }
    }

    fn begin_insertion(&mut self, ctx: &CoordinatorContext) {
        self.generation += 1;
        let generation = self.generation;
        let anchor = self.config.anchor_name.clone();
        let Some(op) = self.current.as_mut() else {
            return;
        };
        op.phase = Phase::Inserting;
        op.deadline = None;
        let seq = op.seq;
        self.state = LifecycleState::Inserting;

        let keys = op.desired.keys();
        let mut plan = Vec::new();
        for (idx, key) in keys.iter().enumerate() {
            if self.inserted.contains_key(key) {
                continue;
            }
            let Some(PendingSupply::Supplied(stage)) = self.pending.get(key) else {
                continue;
            };
            let base = match idx {
                0 => anchor.clone(),
                _ => keys[idx - 1].handler_name().to_string(),
            };
            self.inserted.insert(key.clone(), InsertionRecord::Pending);
            plan.push(PlannedInsert {
                key: key.clone(),
                base,
                stage: stage.clone(),
            });
        }
        info!(
            connection = %self.connection,
            generation,
            inserting = plan.len(),
            "Barrier complete, inserting"
        );

        tokio::spawn(insert_all(
            seq,
            generation,
            anchor,
            plan,
            ctx.affinity.clone(),
            self.events_tx.clone(),
        ));
    }

    fn fail_current(&mut self, error: OrchestratorError) {
        let Some(op) = self.current.take() else {
            return;
        };
        warn!(
            connection = %self.connection,
            operation = op.responder.operation(),
            %error,
            "Operation failed"
        );
        if !self.state.is_terminal() {
            self.state = LifecycleState::Failed;
        }
        op.responder.fail(error);
    }

    fn current_seq(&self) -> Option<u64> {
        self.current.as_ref().map(|op| op.seq)
    }

    fn on_deadline(&mut self) {
        let Some(op) = self.current.as_ref() else {
            return;
        };
        let pending: Vec<Key> = op
            .desired
            .iter()
            .filter(|key| !self.pending.get(*key).is_some_and(PendingSupply::is_supplied))
            .cloned()
            .collect();
        self.fail_current(OrchestratorError::SupplyTimeout { pending });
    }

    // =========================================================================
    // SUPPLY NOTICES
    // =========================================================================

    fn handle_notice(&mut self, ctx: &CoordinatorContext, notice: SupplyNotice) {
        match notice {
            SupplyNotice::Provided { key, stage } => {
                match self.pending.get_mut(&key) {
                    Some(entry) => {
                        if entry.is_supplied() {
                            debug!(connection = %self.connection, %key, "Handler re-supplied");
                        }
                        *entry = PendingSupply::Supplied(stage);
                        debug!(connection = %self.connection, %key, "Handler supplied");
                    }
                    None => {
                        warn!(connection = %self.connection, %key, "Supply for unknown key ignored");
                        return;
                    }
                }
                self.check_barrier(ctx);
            }
            SupplyNotice::Withdrawn { key } => self.unset_handler(ctx, key),
            SupplyNotice::Failed { key, reason } => {
                let placed = self.inserted.get(&key) == Some(&InsertionRecord::Inserted);
                let Some(entry) = self.pending.get_mut(&key) else {
                    warn!(connection = %self.connection, %key, %reason, "Supply failure for unknown key ignored");
                    return;
                };
                let awaited = self
                    .current
                    .as_ref()
                    .is_some_and(|op| op.phase == Phase::Provisioning && op.desired.contains(&key));
                if placed {
                    // The inserted stage keeps serving.
                    warn!(connection = %self.connection, %key, %reason, "Supply failure for placed handler ignored");
                } else if awaited {
                    *entry = PendingSupply::Failed(reason.clone());
                    self.fail_current(OrchestratorError::SupplyFailure { key, reason });
                } else {
                    *entry = PendingSupply::Failed(reason.clone());
                    warn!(connection = %self.connection, %key, %reason, "Supply failure outside barrier");
                }
            }
        }
    }

    /// Reacts to an external withdrawal. The record itself is kept.
    fn unset_handler(&mut self, ctx: &CoordinatorContext, key: Key) {
        let record = self.inserted.remove(&key);
        let keep_waiting = self.desired.contains(&key) && !self.state.is_terminal();
        let known = if keep_waiting {
            self.pending.insert(key.clone(), PendingSupply::Waiting).is_some()
        } else {
            self.pending.remove(&key).is_some()
        };

        match record {
            Some(InsertionRecord::Inserted) => {
                info!(connection = %self.connection, %key, "Handler withdrawn, removing stage");
                spawn_remove(ctx, &self.connection, key.handler_name());
            }
            Some(InsertionRecord::Pending) => {
                debug!(connection = %self.connection, %key, "Handler withdrawn during insertion");
            }
            None if known => {
                debug!(connection = %self.connection, %key, "Handler withdrawn before insertion");
            }
            None => {
                info!(connection = %self.connection, %key, "Withdraw for unknown handler ignored");
            }
        }
    }

    // =========================================================================
    // TASK EVENTS
    // =========================================================================

    fn handle_event(&mut self, ctx: &CoordinatorContext, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Created { key, handle } => {
                self.requested.remove(&key);
                let owned = !self.state.is_terminal() && self.desired.contains(&key);
                if !owned || self.handles.contains_key(&key) {
                    debug!(connection = %self.connection, %key, %handle, "Orphaned record, deleting");
                    self.spawn_teardown(ctx, vec![(key, handle)]);
                    return;
                }
                debug!(connection = %self.connection, %key, %handle, "Record created");
                self.handles.insert(key, handle);
            }
            CoordinatorEvent::ProvisionFailed { seq, key, error } => {
                self.requested.remove(&key);
                self.maybe_finish_close(ctx);
                if self.current_seq() == Some(seq) {
                    self.fail_current(OrchestratorError::Provisioning { key, source: error });
                } else {
                    warn!(connection = %self.connection, %key, %error, "Provisioning failed for stale operation");
                }
            }
            CoordinatorEvent::Pruned { seq } => {
                let pruning = self
                    .current
                    .as_ref()
                    .is_some_and(|op| op.seq == seq && op.phase == Phase::Pruning);
                if pruning {
                    self.begin_provisioning(ctx);
                }
            }
            CoordinatorEvent::Inserted { seq, key, result } => {
                self.on_inserted(ctx, seq, key, result);
            }
            CoordinatorEvent::InsertionAborted { seq, error } => {
                if self.current_seq() == Some(seq) {
                    self.fail_current(insertion_error(error));
                }
            }
            CoordinatorEvent::Assembled { generation } => {
                let inserting = self
                    .current
                    .as_ref()
                    .is_some_and(|op| op.phase == Phase::Inserting);
                if !inserting || generation != self.generation {
                    debug!(connection = %self.connection, generation, "Stale assembly signal");
                    return;
                }
                if let Some(op) = self.current.take() {
                    self.state = LifecycleState::Ready;
                    info!(
                        connection = %self.connection,
                        generation,
                        operation = op.responder.operation(),
                        "Pipeline ready"
                    );
                    op.responder.succeed(Ready {
                        connection: self.connection.clone(),
                        generation,
                    });
                }
            }
            CoordinatorEvent::AnchorRemoved => {
                info!(connection = %self.connection, "Anchor removed, closing");
                self.fail_current(OrchestratorError::Closed);
                self.request_close(None);
            }
            CoordinatorEvent::TeardownDone { failures } => {
                self.teardowns = self.teardowns.saturating_sub(1);
                self.teardown_failures.extend(failures);
                self.maybe_finish_close(ctx);
            }
        }
    }

    fn on_inserted(
        &mut self,
        ctx: &CoordinatorContext,
        seq: u64,
        key: Key,
        result: Result<(), PipelineError>,
    ) {
        match result {
            Ok(()) => match self.inserted.get_mut(&key) {
                Some(record) => {
                    *record = InsertionRecord::Inserted;
                    debug!(connection = %self.connection, %key, "Stage inserted");
                }
                None => {
                    debug!(connection = %self.connection, %key, "Inserted after withdrawal, removing");
                    spawn_remove(ctx, &self.connection, key.handler_name());
                }
            },
            Err(error) => {
                self.inserted.remove(&key);
                if error.is_stale() {
                    debug!(connection = %self.connection, %key, %error, "Insertion on closed connection");
                } else {
                    warn!(connection = %self.connection, %key, %error, "Insertion failed");
                }
                if self.current_seq() == Some(seq) {
                    self.fail_current(insertion_error(error));
                }
            }
        }
    }

    // =========================================================================
    // CLOSE
    // =========================================================================

    fn begin_close(&mut self, ctx: &CoordinatorContext, respond_to: Option<Response<()>>) {
        self.close_requested = false;
        self.state = LifecycleState::Closing;
        self.close_waiters.extend(respond_to);
        for op in self.queue.drain(..) {
            if let Some(waiter) = op.reject(|| OrchestratorError::Closed) {
                self.close_waiters.push(waiter);
            }
        }

        let deletions: Vec<(Key, ConfigHandle)> = self.handles.drain().collect();
        info!(
            connection = %self.connection,
            records = deletions.len(),
            in_flight = self.requested.len(),
            "Closing"
        );
        self.spawn_teardown(ctx, deletions);
    }

    /// Deletes records in the background and reports through `TeardownDone`.
    ///
    /// Close completes once every teardown has reported and no `create` is
    /// still in flight, so a record created during close is deleted before
    /// close resolves.
    fn spawn_teardown(&mut self, ctx: &CoordinatorContext, deletions: Vec<(Key, ConfigHandle)>) {
        self.teardowns += 1;
        let deleting = delete_all(ctx, self.connection.clone(), deletions);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let failures = deleting.await;
            let _ = events.send(CoordinatorEvent::TeardownDone { failures });
        });
    }

    fn maybe_finish_close(&mut self, ctx: &CoordinatorContext) {
        if self.state != LifecycleState::Closing || self.teardowns > 0 || !self.requested.is_empty() {
            return;
        }
        let failures = std::mem::take(&mut self.teardown_failures);
        for failure in &failures {
            warn!(
                connection = %failure.connection,
                key = %failure.key,
                handle = %failure.handle,
                error = %failure.source,
                "Teardown delete failed"
            );
        }
        self.state = LifecycleState::Closed;
        self.pending.clear();
        self.inserted.clear();
        ctx.supply.unregister(&self.connection);
        info!(
            connection = %self.connection,
            failed = failures.len(),
            "Closed"
        );
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn snapshot(&self) -> CoordinatorSnapshot {
        let mut handles: Vec<_> = self
            .handles
            .iter()
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();
        handles.sort();
        let mut supplied: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, supply)| supply.is_supplied())
            .map(|(key, _)| key.clone())
            .collect();
        supplied.sort();
        let mut inserted: Vec<_> = self
            .inserted
            .iter()
            .filter(|(_, record)| **record == InsertionRecord::Inserted)
            .map(|(key, _)| key.clone())
            .collect();
        inserted.sort();

        CoordinatorSnapshot {
            connection: self.connection.clone(),
            state: self.state,
            desired: self.desired.clone(),
            handles,
            supplied,
            inserted,
            queued: self.queue.len(),
            generation: self.generation,
        }
    }
}

// =============================================================================
// SPAWNED TASKS
// =============================================================================

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// `create` unless the record already exists, then `update`, reporting each step.
async fn provision_key(
    seq: u64,
    key: Key,
    existing: Option<ConfigHandle>,
    properties: Properties,
    provisioning: Arc<dyn ProvisioningClient>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
) -> Result<(), ProvisioningError> {
    let handle = match existing {
        Some(handle) => handle,
        None => match provisioning.create(key.provider_kind()).await {
            Ok(handle) => {
                let _ = events.send(CoordinatorEvent::Created {
                    key: key.clone(),
                    handle: handle.clone(),
                });
                handle
            }
            Err(error) => {
                let _ = events.send(CoordinatorEvent::ProvisionFailed {
                    seq,
                    key,
                    error: error.clone(),
                });
                return Err(error);
            }
        },
    };
    if let Err(error) = provisioning.update(&handle, properties).await {
        let _ = events.send(CoordinatorEvent::ProvisionFailed {
            seq,
            key,
            error: error.clone(),
        });
        return Err(error);
    }
    Ok(())
}

/// Inserts planned stages one after another, then appends the sentinel.
async fn insert_all(
    seq: u64,
    generation: u64,
    anchor: String,
    plan: Vec<PlannedInsert>,
    affinity: Affinity,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
) {
    if let Err(error) = affinity
        .submit("disable reads", |p| p.set_read_enabled(false))
        .await
    {
        let _ = events.send(CoordinatorEvent::InsertionAborted { seq, error });
        return;
    }

    for PlannedInsert { key, base, stage } in plan {
        let name = key.handler_name().to_string();
        let result = affinity
            .mutate("insert stage", move |p| p.insert_after(&base, &name, stage))
            .await;
        let failed = result.is_err();
        let _ = events.send(CoordinatorEvent::Inserted { seq, key, result });
        if failed {
            return;
        }
    }

    let result = affinity
        .mutate("append sentinel", move |p| {
            if !p.contains(&anchor) {
                return Err(PipelineError::StageNotFound(anchor));
            }
            p.add_last(SENTINEL_NAME, Arc::new(CompletionSentinel::new(generation)))
        })
        .await;
    if let Err(error) = result {
        let _ = events.send(CoordinatorEvent::InsertionAborted { seq, error });
    }
}

/// Deletes every record in parallel on the worker pool and collects failures.
fn delete_all(
    ctx: &CoordinatorContext,
    connection: ConnectionId,
    deletions: Vec<(Key, ConfigHandle)>,
) -> impl std::future::Future<Output = Vec<TeardownError>> + Send + 'static {
    let tasks: Vec<_> = deletions
        .into_iter()
        .map(|(key, handle)| {
            let provisioning = ctx.provisioning.clone();
            let workers = ctx.workers.clone();
            let connection = connection.clone();
            async move {
                let target = handle.clone();
                workers
                    .run(async move { provisioning.delete(&target).await })
                    .await
                    .map_err(|source| TeardownError {
                        connection,
                        key,
                        handle,
                        source,
                    })
            }
        })
        .collect();
    async move {
        futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }
}

fn spawn_remove(ctx: &CoordinatorContext, connection: &ConnectionId, name: &str) {
    let affinity = ctx.affinity.clone();
    let connection = connection.clone();
    let name = name.to_string();
    tokio::spawn(async move { remove_stage(&affinity, &connection, name).await });
}

/// Removing from a closed pipeline, or a stage that is already gone, is a no-op.
async fn remove_stage(affinity: &Affinity, connection: &ConnectionId, name: String) {
    if !affinity.is_active() {
        debug!(%connection, stage = %name, "Connection inactive, skip removal");
        return;
    }
    let target = name.clone();
    match affinity
        .mutate("remove stage", move |p| p.remove(&target).map(|_| ()))
        .await
    {
        Ok(()) => debug!(%connection, stage = %name, "Stage removed"),
        Err(e) if e.is_stale() => debug!(%connection, stage = %name, "Connection closed before removal"),
        Err(e) => debug!(%connection, stage = %name, error = %e, "Stage already gone"),
    }
}

fn insertion_error(error: PipelineError) -> OrchestratorError {
    if error.is_stale() {
        OrchestratorError::Closed
    } else {
        OrchestratorError::Pipeline(error)
    }
}
