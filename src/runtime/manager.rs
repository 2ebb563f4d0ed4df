//! The flow state machine manager.
//!
//! One [`FlowManager`] per node owns every live flow: it starts them (by RPC
//! request or inbound `SessionInit`), drives them between suspension points,
//! checkpoints them inside host transactions, routes inbound session traffic,
//! resurrects checkpoints on startup, and surfaces the lifecycle feeds.
//!
//! # Concurrency model
//!
//! All flow state lives behind one async mutex: flows on a node are driven
//! cooperatively, one resume step at a time, so access per run-id is fully
//! serialized. Timers and ledger notifications re-enter through the same
//! lock. The only suspension points a flow has are its I/O primitives,
//! sub-flow boundaries, and its entry point - and each one commits a host
//! transaction before the flow slot is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::instrument;

use crate::checkpoints::{
    CheckpointStore, CheckpointWrite, HostTransaction, PersistenceError, StoreError,
    decode_checkpoint, encode_checkpoint,
};
use crate::config::NodeConfig;
use crate::flows::{
    Flow, FlowContext, FlowError, FlowRegistry, FlowResume, FlowYield, ProgressSnapshot,
    ProgressUpdate, RegistryError, SuspendRequest,
};
use crate::ledger::RecordedTransaction;
use crate::runtime::machine::{FlowMachine, Suspension};
use crate::runtime::protocol;
use crate::runtime::updates::{
    Feed, FeedHub, FeedMetrics, FlowDescriptor, FlowOutcome, StateMachineUpdate,
};
use crate::sessions::{FlowSession, SessionPhase};
use crate::transport::{Delivery, DeliveryTag, MessageBus};
use crate::types::{InitiatorKind, NodeId, Party, RunId, SessionId, TxId};
use crate::utils::IdGenerator;
use crate::wire::{Envelope, SessionMessage, decode_envelope};

/// Errors from manager operations.
#[derive(Debug, Error, Diagnostic)]
pub enum ManagerError {
    #[error(transparent)]
    #[diagnostic(code(ledgerflow::manager::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(ledgerflow::manager::registry))]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(code(ledgerflow::manager::persistence))]
    Persistence(#[from] PersistenceError),

    #[error("flow {run_id} could not be checkpointed: {detail}")]
    #[diagnostic(
        code(ledgerflow::manager::checkpoint),
        help("The in-memory flow was discarded; the store's view is authoritative.")
    )]
    Checkpoint { run_id: RunId, detail: String },

    #[error("the flow manager is shut down")]
    #[diagnostic(code(ledgerflow::manager::shutdown))]
    ShutDown,
}

/// Handle returned from a flow start: the run-id plus the result future.
#[derive(Debug)]
pub struct FlowHandle {
    pub run_id: RunId,
    pub result: ResultFuture,
}

/// Awaitable terminal result of a flow.
#[derive(Debug)]
pub struct ResultFuture(pub(crate) oneshot::Receiver<FlowOutcome>);

impl ResultFuture {
    /// Wait for the flow's terminal transition.
    pub async fn outcome(self) -> Result<Value, FlowError> {
        match self.0.await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(FlowError::fatal(
                "the node stopped before the flow reached a terminal state",
            )),
        }
    }
}

enum ResumeOutcome {
    Parked,
    Suspend(SuspendRequest),
    Continue,
    Terminate(FlowOutcome),
}

enum Applied {
    Suspended,
    Terminated,
}

struct ManagerState {
    machines: FxHashMap<RunId, FlowMachine>,
    /// Local session id → owning run, for inbound routing.
    routes: FxHashMap<SessionId, RunId>,
    /// Inbound session messages for sessions not in memory yet, buffered
    /// under the destination session-id until the flow is instantiated.
    orphans: FxHashMap<SessionId, Vec<SessionMessage>>,
    /// Initiator-session-ids already accepted or rejected; re-published inits
    /// are dropped so restart replay never double-instantiates a responder.
    seen_inits: FxHashSet<SessionId>,
    /// Starts requested before the first network-ready signal; their entry
    /// points have not run and no checkpoint exists yet.
    queued_starts: Vec<FlowMachine>,
    committed_txs: FxHashSet<TxId>,
    recorded_txs: Vec<RecordedTransaction>,
    ids: IdGenerator,
}

struct ManagerShared {
    config: NodeConfig,
    registry: Arc<FlowRegistry>,
    store: Arc<dyn CheckpointStore>,
    bus: Arc<dyn MessageBus>,
    updates: Arc<FeedHub<StateMachineUpdate>>,
    mappings: Arc<FeedHub<RecordedTransaction>>,
    state: Mutex<ManagerState>,
    inbound_open: AtomicBool,
    network_ready: AtomicBool,
    shutting_down: AtomicBool,
}

/// The per-node flow runtime. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct FlowManager {
    shared: Arc<ManagerShared>,
}

impl FlowManager {
    /// Construct a manager, resurrect every stored checkpoint, and open the
    /// inbound handler.
    ///
    /// Resurrection happens strictly before inbound traffic is admitted:
    /// routes for resurrected sessions are registered and unacknowledged
    /// outboxes re-published first, so redelivered messages find their flows.
    /// Returns the manager and the number of flows resumed.
    pub async fn start(
        config: NodeConfig,
        registry: Arc<FlowRegistry>,
        store: Arc<dyn CheckpointStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<(Self, usize), ManagerError> {
        let network_ready = config.network_ready_at_start;
        let capacity = config.feeds.buffer_capacity;
        let manager = Self {
            shared: Arc::new(ManagerShared {
                config,
                registry,
                store,
                bus,
                updates: FeedHub::new(capacity),
                mappings: FeedHub::new(capacity),
                state: Mutex::new(ManagerState {
                    machines: FxHashMap::default(),
                    routes: FxHashMap::default(),
                    orphans: FxHashMap::default(),
                    seen_inits: FxHashSet::default(),
                    queued_starts: Vec::new(),
                    committed_txs: FxHashSet::default(),
                    recorded_txs: Vec::new(),
                    ids: IdGenerator::new(),
                }),
                inbound_open: AtomicBool::new(false),
                network_ready: AtomicBool::new(network_ready),
                shutting_down: AtomicBool::new(false),
            }),
        };
        let resumed = manager.resurrect().await?;
        manager.shared.inbound_open.store(true, Ordering::SeqCst);
        Ok((manager, resumed))
    }

    /// Start a flow, returning its handle immediately.
    ///
    /// Before the first network-ready signal the start is queued and the entry
    /// point does not run; otherwise the entry point runs now and the initial
    /// checkpoint is taken before it.
    pub async fn start_flow(
        &self,
        flow: Box<dyn Flow>,
        initiator: InitiatorKind,
    ) -> Result<FlowHandle, ManagerError> {
        let (handle, _, _) = self.start_flow_inner(flow, initiator, false).await?;
        Ok(handle)
    }

    /// Start a flow with progress tracking: handle plus the current step
    /// snapshot and a live step stream.
    pub async fn start_tracked_flow(
        &self,
        flow: Box<dyn Flow>,
        initiator: InitiatorKind,
    ) -> Result<(FlowHandle, ProgressSnapshot, flume::Receiver<ProgressUpdate>), ManagerError> {
        let (handle, snapshot, rx) = self.start_flow_inner(flow, initiator, true).await?;
        let rx = rx.unwrap_or_else(|| flume::unbounded().1);
        Ok((handle, snapshot, rx))
    }

    /// Start a flow by registered class name and argument tuple.
    pub async fn start_flow_by_name(
        &self,
        class: &str,
        args: Value,
        initiator: InitiatorKind,
    ) -> Result<FlowHandle, ManagerError> {
        let flow = self.shared.registry.construct(class, args)?;
        self.start_flow(flow, initiator).await
    }

    async fn start_flow_inner(
        &self,
        flow: Box<dyn Flow>,
        initiator: InitiatorKind,
        tracked: bool,
    ) -> Result<
        (FlowHandle, ProgressSnapshot, Option<flume::Receiver<ProgressUpdate>>),
        ManagerError,
    > {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(ManagerError::ShutDown);
        }
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;

        let run_id = state.ids.generate_run_id();
        tracing::debug!(run_id = %run_id, class = flow.class_name(), "starting flow");
        let mut machine = FlowMachine::new(run_id, initiator, flow);
        let (result_tx, result_rx) = oneshot::channel();
        machine.result_tx = Some(result_tx);
        let progress_rx = if tracked {
            Some(machine.progress.subscribe())
        } else {
            None
        };
        let snapshot = machine.progress.snapshot();

        if self.shared.network_ready.load(Ordering::SeqCst) {
            self.launch(state, machine).await?;
        } else {
            tracing::debug!(run_id = %run_id, "network not ready; queueing start");
            state.queued_starts.push(machine);
        }

        Ok((
            FlowHandle {
                run_id,
                result: ResultFuture(result_rx),
            },
            snapshot,
            progress_rx,
        ))
    }

    /// Insert a fresh machine, announce it, take its initial checkpoint, and
    /// run it to its first real suspension.
    ///
    /// The `Added` event is delivered before any externally observable side
    /// effect of the flow.
    async fn launch(
        &self,
        state: &mut ManagerState,
        machine: FlowMachine,
    ) -> Result<(), ManagerError> {
        let run_id = machine.run_id;
        self.shared.updates.publish(StateMachineUpdate::Added {
            descriptor: machine.descriptor(),
        });
        state.machines.insert(run_id, machine);
        // Initial checkpoint: the entry point is a suspension point.
        if let Err(e) = self.checkpoint_run(state, run_id, Vec::new(), None).await {
            self.discard(state, run_id, "initial checkpoint failed");
            return Err(e);
        }
        self.drive(state, run_id, None).await
    }

    /// Drive one run until it parks or terminates.
    ///
    /// `consume` is the delivery that triggered this work; it is acknowledged
    /// inside the first host transaction committed on the way, so a crash
    /// before that commit redelivers the message.
    async fn drive(
        &self,
        state: &mut ManagerState,
        run_id: RunId,
        mut consume: Option<DeliveryTag>,
    ) -> Result<(), ManagerError> {
        loop {
            let outcome = match state.machines.get_mut(&run_id) {
                None => break,
                Some(machine) => {
                    if let Some(reason) = machine.abort_requested.take() {
                        ResumeOutcome::Terminate(FlowOutcome::Failed(FlowError::Aborted {
                            reason,
                        }))
                    } else if let Some(input) = machine.pending_input.take() {
                        match machine.frames.pop() {
                            None => ResumeOutcome::Terminate(FlowOutcome::Failed(
                                FlowError::fatal("flow frame stack is empty"),
                            )),
                            Some(mut flow) => {
                                let mut ctx = FlowContext::new(
                                    run_id,
                                    &self.shared.config.identity,
                                    &machine.initiator,
                                    &mut machine.progress,
                                    &machine.sessions,
                                );
                                match flow.resume(&mut ctx, input) {
                                    Ok(FlowYield::Suspend(req)) => {
                                        machine.frames.push(flow);
                                        ResumeOutcome::Suspend(req)
                                    }
                                    Ok(FlowYield::Finished(value)) => {
                                        if machine.frames.is_empty() {
                                            ResumeOutcome::Terminate(FlowOutcome::Completed(
                                                value,
                                            ))
                                        } else {
                                            // Sub-flow returned; the parent
                                            // resumes on this same pass, no
                                            // checkpoint in between.
                                            machine.pending_input =
                                                Some(FlowResume::SubFlowFinished(value));
                                            ResumeOutcome::Continue
                                        }
                                    }
                                    Err(e) => {
                                        ResumeOutcome::Terminate(FlowOutcome::Failed(e))
                                    }
                                }
                            }
                        }
                    } else {
                        ResumeOutcome::Parked
                    }
                }
            };

            match outcome {
                ResumeOutcome::Parked => break,
                ResumeOutcome::Continue => continue,
                ResumeOutcome::Suspend(req) => {
                    match self
                        .apply_suspension(state, run_id, req, &mut consume)
                        .await?
                    {
                        Applied::Suspended => continue,
                        Applied::Terminated => break,
                    }
                }
                ResumeOutcome::Terminate(result) => {
                    self.terminate(state, run_id, result, consume.take()).await?;
                    break;
                }
            }
        }
        // A delivery that ended up affecting nothing still has to be
        // consumed, or the bus would redeliver it forever.
        if let Some(tag) = consume.take() {
            self.commit(HostTransaction::new().consume(Some(tag))).await?;
        }
        Ok(())
    }

    /// Apply one suspension request: mutate sessions, record the outbox,
    /// checkpoint inside a host transaction, then try to satisfy the
    /// suspension immediately.
    async fn apply_suspension(
        &self,
        state: &mut ManagerState,
        run_id: RunId,
        req: SuspendRequest,
        consume: &mut Option<DeliveryTag>,
    ) -> Result<Applied, ManagerError> {
        let our_node = self.shared.config.node_id.clone();
        let app_id = self.shared.config.app_id.clone();

        let staged: Result<Vec<Envelope>, FlowError> = {
            let ManagerState {
                machines,
                routes,
                ids,
                ..
            } = &mut *state;
            let Some(machine) = machines.get_mut(&run_id) else {
                return Ok(Applied::Terminated);
            };
            match req {
                SuspendRequest::Send { to, payload } => {
                    match self.stage_send(routes, ids, machine, &our_node, &app_id, &to, payload)
                    {
                        Ok(envelopes) => {
                            machine.suspension = Suspension::Send { party: to.clone() };
                            machine.outbox = envelopes.clone();
                            // A send that just opened the session parks until
                            // the confirm pins the peer; on an established
                            // session it resumes once the commit lands.
                            machine.pending_input =
                                match machine.sessions.by_party(&to).map(|s| s.phase) {
                                    Some(SessionPhase::Confirmed) => {
                                        Some(FlowResume::SendCompleted)
                                    }
                                    _ => None,
                                };
                            Ok(envelopes)
                        }
                        Err(e) => Err(e),
                    }
                }
                SuspendRequest::Receive { from, type_hint } => self.stage_receive(
                    routes, ids, machine, &our_node, &app_id, &from, type_hint, None,
                ),
                SuspendRequest::SendAndReceive {
                    to,
                    payload,
                    type_hint,
                } => self.stage_receive(
                    routes,
                    ids,
                    machine,
                    &our_node,
                    &app_id,
                    &to,
                    type_hint,
                    Some(payload),
                ),
                SuspendRequest::Sleep { duration } => {
                    let deadline = Utc::now()
                        + chrono::Duration::from_std(duration)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    machine.suspension = Suspension::Sleep { deadline };
                    machine.outbox = Vec::new();
                    machine.pending_input = None;
                    Ok(Vec::new())
                }
                SuspendRequest::WaitForLedgerCommit { tx_id } => {
                    machine.suspension = Suspension::LedgerCommit { tx_id };
                    machine.outbox = Vec::new();
                    machine.pending_input = None;
                    Ok(Vec::new())
                }
                SuspendRequest::SubFlow { flow } => {
                    // Sub-flow boundary: push the child frame and checkpoint
                    // with its entry point pending.
                    machine.frames.push(flow);
                    machine.suspension = Suspension::EntryPoint;
                    machine.outbox = Vec::new();
                    machine.pending_input = Some(FlowResume::Start);
                    Ok(Vec::new())
                }
            }
        };

        let publish = match staged {
            Ok(publish) => publish,
            Err(e) => {
                self.terminate(state, run_id, FlowOutcome::Failed(e), consume.take())
                    .await?;
                return Ok(Applied::Terminated);
            }
        };

        if let Err(e) = self
            .checkpoint_run(state, run_id, publish, consume.take())
            .await
        {
            self.discard(state, run_id, "checkpoint commit failed");
            return Err(e);
        }

        // Post-commit satisfaction: queued data, elapsed timers, already
        // committed transactions.
        let ManagerState {
            machines,
            committed_txs,
            recorded_txs,
            ..
        } = &mut *state;
        if let Some(machine) = machines.get_mut(&run_id) {
            match machine.suspension.clone() {
                Suspension::Receive { .. } => Self::try_deliver(machine),
                Suspension::Sleep { deadline } => {
                    let now = Utc::now();
                    if deadline <= now {
                        machine.pending_input = Some(FlowResume::SleepElapsed);
                    } else {
                        self.arm_sleep_timer(
                            run_id,
                            (deadline - now).to_std().unwrap_or_default(),
                        );
                    }
                }
                Suspension::LedgerCommit { tx_id } => {
                    if committed_txs.contains(&tx_id) {
                        Self::record_mapping(
                            &self.shared.mappings,
                            recorded_txs,
                            run_id,
                            tx_id.clone(),
                        );
                        machine.pending_input = Some(FlowResume::TransactionCommitted(tx_id));
                    }
                }
                _ => {}
            }
        }
        Ok(Applied::Suspended)
    }

    /// Stage the envelopes for a send on the session with `to`, creating the
    /// session (with a `SessionInit`) if absent and buffering while the
    /// handshake is outstanding.
    #[allow(clippy::too_many_arguments)]
    fn stage_send(
        &self,
        routes: &mut FxHashMap<SessionId, RunId>,
        ids: &IdGenerator,
        machine: &mut FlowMachine,
        our_node: &NodeId,
        app_id: &str,
        to: &Party,
        payload: Value,
    ) -> Result<Vec<Envelope>, FlowError> {
        if machine.sessions.by_party(to).is_none() {
            let envelope =
                self.open_session(routes, ids, machine, our_node, app_id, to, Some(payload))?;
            return Ok(vec![envelope]);
        }
        let session = machine
            .sessions
            .by_party_mut(to)
            .ok_or_else(|| FlowError::fatal(format!("session with {to} disappeared")))?;
        match session.phase {
            SessionPhase::Initiating => {
                session.pending_sends.push(payload);
                Ok(Vec::new())
            }
            SessionPhase::Confirmed => protocol::data_envelope(our_node, session, payload)
                .map(|env| vec![env])
                .ok_or_else(|| {
                    FlowError::fatal(format!("confirmed session with {to} lacks a peer endpoint"))
                }),
            SessionPhase::Ended | SessionPhase::Errored => Err(FlowError::UnexpectedFlowEnd {
                expected: "send acknowledgement".to_string(),
                reason: format!("session with {to} is already closed"),
            }),
        }
    }

    /// Stage a receive (optionally with a leading send) on the session with
    /// `party` and park the machine on it. One suspension point either way.
    #[allow(clippy::too_many_arguments)]
    fn stage_receive(
        &self,
        routes: &mut FxHashMap<SessionId, RunId>,
        ids: &IdGenerator,
        machine: &mut FlowMachine,
        our_node: &NodeId,
        app_id: &str,
        party: &Party,
        type_hint: &'static str,
        send_first: Option<Value>,
    ) -> Result<Vec<Envelope>, FlowError> {
        let mut publish = Vec::new();
        if machine.sessions.by_party(party).is_none() {
            // A receive-only opener still has to introduce itself; a combined
            // send-and-receive piggybacks its payload on the init.
            let envelope =
                self.open_session(routes, ids, machine, our_node, app_id, party, send_first)?;
            publish.push(envelope);
        } else if let Some(payload) = send_first {
            let mut sent =
                self.stage_send(routes, ids, machine, our_node, app_id, party, payload)?;
            publish.append(&mut sent);
        }
        if let Some(session) = machine.sessions.by_party_mut(party) {
            session.expected_type_hint = Some(type_hint.to_string());
        }
        machine.suspension = Suspension::Receive {
            party: party.clone(),
            type_hint: type_hint.to_string(),
        };
        machine.outbox = publish.clone();
        machine.pending_input = None;
        Ok(publish)
    }

    /// Create an `Initiating` session towards `to` and build its init
    /// envelope. The endpoint is chosen round-robin among the party's
    /// advertised endpoints and pinned at confirmation.
    #[allow(clippy::too_many_arguments)]
    fn open_session(
        &self,
        routes: &mut FxHashMap<SessionId, RunId>,
        ids: &IdGenerator,
        machine: &mut FlowMachine,
        our_node: &NodeId,
        app_id: &str,
        to: &Party,
        first_payload: Option<Value>,
    ) -> Result<Envelope, FlowError> {
        let endpoint = self
            .shared
            .bus
            .next_endpoint(to)
            .ok_or_else(|| FlowError::fatal(format!("no transport endpoint advertises {to}")))?;
        let flow_class = machine.active_class();
        let version = self.shared.registry.version_of(flow_class).unwrap_or(1);
        let mut session =
            FlowSession::initiated(ids.generate_session_id(), to.clone(), endpoint, version);
        if first_payload.is_some() {
            // The piggybacked payload occupies sequence 1 of this session.
            let _ = session.take_send_sequence();
        }
        let envelope =
            protocol::init_envelope(our_node, &session, flow_class, app_id, first_payload);
        routes.insert(session.local_id, machine.run_id);
        machine.sessions.insert(session);
        Ok(envelope)
    }

    /// Feed a parked receive from its session's inbound queue, if anything is
    /// waiting.
    fn try_deliver(machine: &mut FlowMachine) {
        if machine.pending_input.is_some() {
            return;
        }
        let Suspension::Receive { party, type_hint } = machine.suspension.clone() else {
            return;
        };
        let Some(session) = machine.sessions.by_party_mut(&party) else {
            return;
        };
        if let Some(resume) = protocol::pop_inbound(session, &type_hint) {
            machine.pending_input = Some(resume);
        }
    }

    /// Serialize and commit the current checkpoint of a run, together with the
    /// envelopes to publish and the delivery to acknowledge.
    async fn checkpoint_run(
        &self,
        state: &mut ManagerState,
        run_id: RunId,
        publish: Vec<Envelope>,
        consume: Option<DeliveryTag>,
    ) -> Result<(), ManagerError> {
        let Some(machine) = state.machines.get_mut(&run_id) else {
            return Ok(());
        };
        let persisted = machine
            .to_persisted()
            .map_err(|e| ManagerError::Checkpoint {
                run_id,
                detail: e.to_string(),
            })?;
        let blob = encode_checkpoint(&persisted)?;
        let tx = HostTransaction::new()
            .put(run_id, blob)
            .publish_all(publish)
            .consume(consume);
        self.commit(tx).await
    }

    /// Commit one host transaction: checkpoint mutation first, then outbound
    /// hand-off, then inbound acknowledgement. A failed checkpoint write
    /// aborts everything after it.
    async fn commit(&self, tx: HostTransaction) -> Result<(), ManagerError> {
        match tx.checkpoint {
            Some(CheckpointWrite::Put { run_id, blob }) => {
                self.shared.store.put(run_id, blob).await?;
            }
            Some(CheckpointWrite::Remove { run_id }) => {
                self.shared.store.remove(run_id).await?;
            }
            None => {}
        }
        for envelope in &tx.outbound {
            self.shared.bus.publish(envelope);
        }
        if let Some(tag) = &tx.consumed {
            self.shared.bus.acknowledge(tag);
        }
        Ok(())
    }

    /// Terminal transition: notify peers, delete the checkpoint, emit
    /// `Removed`, resolve the result slot.
    #[instrument(skip(self, state, outcome, consume))]
    async fn terminate(
        &self,
        state: &mut ManagerState,
        run_id: RunId,
        outcome: FlowOutcome,
        consume: Option<DeliveryTag>,
    ) -> Result<(), ManagerError> {
        let Some(mut machine) = state.machines.remove(&run_id) else {
            return Ok(());
        };
        for session_id in machine.sessions.local_ids() {
            state.routes.remove(&session_id);
        }
        let failed = matches!(outcome, FlowOutcome::Failed(_));
        let business = match &outcome {
            FlowOutcome::Failed(e) => e.business().cloned(),
            FlowOutcome::Completed(_) => None,
        };
        let ends = protocol::end_envelopes(
            &self.shared.config.node_id,
            &mut machine.sessions,
            business.as_ref(),
            failed,
        );
        let tx = HostTransaction::new()
            .remove(run_id)
            .publish_all(ends)
            .consume(consume);
        self.commit(tx).await?;
        self.shared.updates.publish(StateMachineUpdate::Removed {
            run_id,
            outcome: outcome.clone(),
        });
        if let Some(slot) = machine.result_tx.take() {
            let _ = slot.send(outcome);
        }
        Ok(())
    }

    /// Drop an in-memory flow whose checkpoint could not be committed. The
    /// store's view is authoritative; nothing was published.
    fn discard(&self, state: &mut ManagerState, run_id: RunId, detail: &str) {
        if let Some(mut machine) = state.machines.remove(&run_id) {
            for session_id in machine.sessions.local_ids() {
                state.routes.remove(&session_id);
            }
            let outcome = FlowOutcome::Failed(FlowError::fatal(detail));
            self.shared.updates.publish(StateMachineUpdate::Removed {
                run_id,
                outcome: outcome.clone(),
            });
            if let Some(slot) = machine.result_tx.take() {
                let _ = slot.send(outcome);
            }
        }
    }

    fn arm_sleep_timer(&self, run_id: RunId, duration: std::time::Duration) {
        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(e) = manager.wake_sleeper(run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "sleep wake-up failed");
            }
        });
    }

    /// Timer callback: unpark a sleeping flow whose deadline passed.
    async fn wake_sleeper(&self, run_id: RunId) -> Result<(), ManagerError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let Some(machine) = state.machines.get_mut(&run_id) else {
            return Ok(());
        };
        let Suspension::Sleep { deadline } = machine.suspension.clone() else {
            return Ok(());
        };
        if deadline > Utc::now() {
            return Ok(());
        }
        machine.pending_input = Some(FlowResume::SleepElapsed);
        self.drive(state, run_id, None).await
    }

    fn record_mapping(
        hub: &FeedHub<RecordedTransaction>,
        log: &mut Vec<RecordedTransaction>,
        run_id: RunId,
        tx_id: TxId,
    ) {
        let mapping = RecordedTransaction::new(run_id, tx_id);
        log.push(mapping.clone());
        hub.publish(mapping);
    }

    /// Ledger-engine callback: a transaction became persisted. Unparks every
    /// flow waiting on it and records the (run, tx) association.
    pub async fn notify_transaction_committed(&self, tx_id: TxId) -> Result<(), ManagerError> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        state.committed_txs.insert(tx_id.clone());
        let waiting: Vec<RunId> = state
            .machines
            .iter()
            .filter_map(|(run_id, m)| match &m.suspension {
                Suspension::LedgerCommit { tx_id: waited } if *waited == tx_id => Some(*run_id),
                _ => None,
            })
            .collect();
        for run_id in waiting {
            Self::record_mapping(
                &self.shared.mappings,
                &mut state.recorded_txs,
                run_id,
                tx_id.clone(),
            );
            if let Some(machine) = state.machines.get_mut(&run_id) {
                machine.pending_input = Some(FlowResume::TransactionCommitted(tx_id.clone()));
            }
            self.drive(state, run_id, None).await?;
        }
        Ok(())
    }

    /// First network tick: run every start queued while the directory was
    /// unavailable. Entry points run now and initial checkpoints are taken.
    pub async fn notify_network_ready(&self) -> Result<(), ManagerError> {
        self.shared.network_ready.store(true, Ordering::SeqCst);
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let queued = std::mem::take(&mut state.queued_starts);
        for machine in queued {
            self.launch(state, machine).await?;
        }
        Ok(())
    }

    /// Mark a flow for termination.
    ///
    /// A parked flow is, by definition, at a suspension point and terminates
    /// now; a queued start is dropped before its entry point ever runs. There
    /// is no asynchronous kill of a flow mid-step.
    pub async fn kill(&self, run_id: RunId, reason: &str) -> Result<bool, ManagerError> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        if let Some(pos) = state
            .queued_starts
            .iter()
            .position(|m| m.run_id == run_id)
        {
            let mut machine = state.queued_starts.remove(pos);
            if let Some(slot) = machine.result_tx.take() {
                let _ = slot.send(FlowOutcome::Failed(FlowError::Aborted {
                    reason: reason.to_string(),
                }));
            }
            return Ok(true);
        }
        if state.machines.contains_key(&run_id) {
            self.terminate(
                state,
                run_id,
                FlowOutcome::Failed(FlowError::Aborted {
                    reason: reason.to_string(),
                }),
                None,
            )
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Inbound message handler. Decodes, routes, deduplicates, and drives the
    /// affected flow to its next suspension; the triggering delivery is
    /// acknowledged inside the first host transaction on that path.
    ///
    /// While the handler is closed (startup, shutdown) deliveries are left
    /// unacknowledged for later redelivery.
    #[instrument(skip(self, delivery), fields(tag = delivery.tag.tag))]
    pub async fn process(&self, delivery: Delivery) -> Result<(), ManagerError> {
        if !self.shared.inbound_open.load(Ordering::SeqCst) {
            return Ok(());
        }
        let envelope = match decode_envelope(&delivery.bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Malformed traffic is dropped, never fatal to the node.
                tracing::warn!(error = %e, "dropping undecodable inbound message");
                return self
                    .commit(HostTransaction::new().consume(Some(delivery.tag)))
                    .await;
            }
        };

        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let tag = delivery.tag;

        match envelope.message.clone() {
            SessionMessage::SessionInit {
                initiator_session_id,
                flow_class,
                flow_version,
                app_id: _,
                first_payload,
            } => {
                self.handle_init(
                    state,
                    tag,
                    envelope.origin.clone(),
                    initiator_session_id,
                    &flow_class,
                    flow_version,
                    first_payload,
                )
                .await
            }
            SessionMessage::SessionConfirm {
                initiator_session_id,
                confirmer_session_id,
                flow_version,
                ..
            } => {
                self.handle_confirm(
                    state,
                    tag,
                    envelope.origin.clone(),
                    initiator_session_id,
                    confirmer_session_id,
                    flow_version,
                )
                .await
            }
            SessionMessage::SessionData {
                recipient_session_id,
                sequence,
                payload,
            } => {
                self.handle_data(state, tag, recipient_session_id, sequence, payload)
                    .await
            }
            message @ (SessionMessage::NormalSessionEnd { .. }
            | SessionMessage::ErrorSessionEnd { .. }
            | SessionMessage::SessionReject { .. }) => {
                self.handle_terminal(state, tag, message).await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_init(
        &self,
        state: &mut ManagerState,
        tag: DeliveryTag,
        origin: NodeId,
        initiator_session_id: SessionId,
        flow_class: &str,
        flow_version: u32,
        first_payload: Option<Value>,
    ) -> Result<(), ManagerError> {
        if !state.seen_inits.insert(initiator_session_id) {
            // Replayed init (sender crash between commit and publish, or bus
            // retry); the responder already exists.
            return self.commit(HostTransaction::new().consume(Some(tag))).await;
        }

        let Some(entry) = self.shared.registry.responder(flow_class) else {
            tracing::info!(flow_class, "rejecting session init for unknown flow class");
            let reject = protocol::reject_envelope(
                &self.shared.config.node_id,
                origin,
                initiator_session_id,
                format!("Don't know {flow_class}"),
            );
            return self
                .commit(HostTransaction::new().publish(reject).consume(Some(tag)))
                .await;
        };

        let peer = self
            .shared
            .bus
            .identity_of(&origin)
            .unwrap_or_else(|| Party::new(origin.address()));
        let run_id = state.ids.generate_run_id();
        let mut machine = FlowMachine::new(
            run_id,
            InitiatorKind::Peer {
                party: peer.clone(),
            },
            (entry.factory)(peer.clone()),
        );

        let local_id = state.ids.generate_session_id();
        let mut session = FlowSession::confirmed(
            local_id,
            initiator_session_id,
            peer,
            origin,
            entry.version,
            flow_version,
        );
        if let Some(payload) = first_payload {
            // The piggybacked payload is sequence 1 of the session.
            session.admit_data(1, payload);
        }
        let confirm = protocol::confirm_envelope(
            &self.shared.config.node_id,
            &session,
            &self.shared.config.app_id,
        );
        machine.sessions.insert(session);
        machine.outbox = vec![confirm.clone()];
        state.routes.insert(local_id, run_id);

        self.shared.updates.publish(StateMachineUpdate::Added {
            descriptor: machine.descriptor(),
        });
        state.machines.insert(run_id, machine);
        Self::drain_orphans(state, run_id);

        if let Err(e) = self
            .checkpoint_run(state, run_id, vec![confirm], Some(tag))
            .await
        {
            self.discard(state, run_id, "responder checkpoint failed");
            return Err(e);
        }
        self.drive(state, run_id, None).await
    }

    async fn handle_confirm(
        &self,
        state: &mut ManagerState,
        tag: DeliveryTag,
        origin: NodeId,
        initiator_session_id: SessionId,
        confirmer_session_id: SessionId,
        flow_version: u32,
    ) -> Result<(), ManagerError> {
        let run_id = match state.routes.get(&initiator_session_id) {
            Some(run_id) => *run_id,
            None => {
                // A confirm for a flow that no longer exists is moot.
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            }
        };
        let (flushed, resumed) = {
            let Some(machine) = state.machines.get_mut(&run_id) else {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            };
            let Some(session) = machine.sessions.by_local_id_mut(initiator_session_id) else {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            };
            if session.phase != SessionPhase::Initiating {
                // Duplicate confirm.
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            }
            session.peer_id = Some(confirmer_session_id);
            session.peer_version = Some(flow_version);
            session.phase = SessionPhase::Confirmed;
            // Pin the endpoint that actually confirmed; round-robin stops
            // here.
            session.peer_endpoint = Some(origin);
            let peer = session.peer.clone();
            let flushed = protocol::flush_pending_sends(&self.shared.config.node_id, session);
            machine.outbox.extend(flushed.iter().cloned());
            // The send that opened this session has been waiting for exactly
            // this confirm.
            if matches!(&machine.suspension, Suspension::Send { party } if *party == peer) {
                machine.pending_input = Some(FlowResume::SendCompleted);
            }
            (flushed, machine.pending_input.is_some())
        };

        if let Err(e) = self.checkpoint_run(state, run_id, flushed, Some(tag)).await {
            self.discard(state, run_id, "checkpoint commit failed");
            return Err(e);
        }
        if resumed {
            self.drive(state, run_id, None).await?;
        }
        Ok(())
    }

    async fn handle_data(
        &self,
        state: &mut ManagerState,
        tag: DeliveryTag,
        recipient: SessionId,
        sequence: u64,
        payload: Value,
    ) -> Result<(), ManagerError> {
        let run_id = match state.routes.get(&recipient) {
            Some(run_id) => *run_id,
            None => {
                state
                    .orphans
                    .entry(recipient)
                    .or_default()
                    .push(SessionMessage::SessionData {
                        recipient_session_id: recipient,
                        sequence,
                        payload,
                    });
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            }
        };
        let delivered = {
            let Some(machine) = state.machines.get_mut(&run_id) else {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            };
            let Some(session) = machine.sessions.by_local_id_mut(recipient) else {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            };
            if !session.admit_data(sequence, payload) {
                // Duplicate: already delivered to this session.
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            }
            Self::try_deliver(machine);
            machine.pending_input.is_some()
        };
        if delivered {
            self.drive(state, run_id, Some(tag)).await
        } else {
            // Arrived ahead of the flow's next receive; persist the queue so
            // a restart cannot lose it.
            if let Err(e) = self
                .checkpoint_run(state, run_id, Vec::new(), Some(tag))
                .await
            {
                self.discard(state, run_id, "checkpoint commit failed");
                return Err(e);
            }
            Ok(())
        }
    }

    async fn handle_terminal(
        &self,
        state: &mut ManagerState,
        tag: DeliveryTag,
        message: SessionMessage,
    ) -> Result<(), ManagerError> {
        let recipient = message.routing_id();
        let run_id = match state.routes.get(&recipient) {
            Some(run_id) => *run_id,
            None => {
                // End/reject for a flow that already reached its terminal
                // transition; nothing left to tell.
                tracing::debug!(session = %recipient, tag = message.tag(), "dropping terminal message for dead session");
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            }
        };
        let delivered = {
            let Some(machine) = state.machines.get_mut(&run_id) else {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            };
            let Some(session) = machine.sessions.by_local_id_mut(recipient) else {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            };
            if !protocol::apply_terminal_message(session, &message) {
                return self.commit(HostTransaction::new().consume(Some(tag))).await;
            }
            Self::try_deliver(machine);
            machine.pending_input.is_some()
        };
        if delivered {
            self.drive(state, run_id, Some(tag)).await
        } else {
            if let Err(e) = self
                .checkpoint_run(state, run_id, Vec::new(), Some(tag))
                .await
            {
                self.discard(state, run_id, "checkpoint commit failed");
                return Err(e);
            }
            Ok(())
        }
    }

    /// Apply messages buffered for sessions that just came into memory.
    fn drain_orphans(state: &mut ManagerState, run_id: RunId) {
        let ManagerState {
            machines, orphans, ..
        } = state;
        let Some(machine) = machines.get_mut(&run_id) else {
            return;
        };
        for local_id in machine.sessions.local_ids() {
            let Some(buffered) = orphans.remove(&local_id) else {
                continue;
            };
            for message in buffered {
                let Some(session) = machine.sessions.by_local_id_mut(local_id) else {
                    break;
                };
                if let SessionMessage::SessionData {
                    sequence, payload, ..
                } = message
                {
                    session.admit_data(sequence, payload);
                } else {
                    protocol::apply_terminal_message(session, &message);
                }
            }
        }
    }

    /// Load every stored checkpoint and bring its flow back to life.
    ///
    /// Ordering per flow: register routes, re-publish the unacknowledged
    /// outbox, re-arm the suspension, then drive. A blob with a mismatched
    /// schema version or an unrestorable class is reported and skipped - its
    /// checkpoint stays in the store for out-of-band handling.
    async fn resurrect(&self) -> Result<usize, ManagerError> {
        let rows = self.shared.store.list().await?;
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let mut resumed = 0usize;
        let mut to_drive = Vec::new();

        for (run_id, blob) in rows {
            let checkpoint = match decode_checkpoint(&blob) {
                Ok(cp) => cp,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "checkpoint cannot be resumed");
                    continue;
                }
            };
            let mut machine = match FlowMachine::from_persisted(checkpoint, &self.shared.registry)
            {
                Ok(machine) => machine,
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "flow cannot be restored");
                    continue;
                }
            };
            for session_id in machine.sessions.local_ids() {
                state.routes.insert(session_id, run_id);
            }
            for session in machine.sessions.iter() {
                if !session.initiated_by_us {
                    if let Some(peer_id) = session.peer_id {
                        state.seen_inits.insert(peer_id);
                    }
                }
            }
            for envelope in &machine.outbox {
                self.shared.bus.publish(envelope);
            }
            match machine.suspension.clone() {
                Suspension::Receive { .. } => Self::try_deliver(&mut machine),
                Suspension::Send { party } => {
                    // Resume only once the handshake settled; an unconfirmed
                    // opener keeps waiting for the (redelivered) confirm.
                    let confirmed = machine
                        .sessions
                        .by_party(&party)
                        .is_some_and(|s| s.phase == SessionPhase::Confirmed);
                    if confirmed {
                        machine.pending_input = Some(FlowResume::SendCompleted);
                    }
                }
                Suspension::Sleep { deadline } => {
                    let now = Utc::now();
                    if deadline <= now {
                        machine.pending_input = Some(FlowResume::SleepElapsed);
                    } else {
                        self.arm_sleep_timer(
                            run_id,
                            (deadline - now).to_std().unwrap_or_default(),
                        );
                    }
                }
                Suspension::LedgerCommit { tx_id } => {
                    if state.committed_txs.contains(&tx_id) {
                        machine.pending_input = Some(FlowResume::TransactionCommitted(tx_id));
                    }
                }
                _ => {}
            }
            state.machines.insert(run_id, machine);
            to_drive.push(run_id);
            resumed += 1;
        }

        for run_id in to_drive {
            self.drive(state, run_id, None).await?;
        }
        Ok(resumed)
    }

    /// Graceful shutdown: close the inbound handler and the feeds. Parked
    /// flows are already checkpointed; a later `start` resurrects them.
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.inbound_open.store(false, Ordering::SeqCst);
        self.shared.updates.close();
        self.shared.mappings.close();
    }

    /// Live snapshot of every flow on this node.
    pub async fn state_machines(&self) -> Vec<FlowDescriptor> {
        let state = self.shared.state.lock().await;
        state
            .machines
            .values()
            .map(FlowMachine::descriptor)
            .collect()
    }

    /// Snapshot plus live `Added`/`Removed` stream. The snapshot and the
    /// subscription are taken under one lock, so the stream is a gap-free
    /// continuation of the snapshot.
    pub async fn state_machines_feed(&self) -> Feed<Vec<FlowDescriptor>, StateMachineUpdate> {
        let state = self.shared.state.lock().await;
        let updates = self.shared.updates.subscribe();
        let snapshot = state
            .machines
            .values()
            .map(FlowMachine::descriptor)
            .collect();
        Feed { snapshot, updates }
    }

    /// Snapshot plus live stream of recorded (run, transaction) associations.
    pub async fn transaction_mappings_feed(
        &self,
    ) -> Feed<Vec<RecordedTransaction>, RecordedTransaction> {
        let state = self.shared.state.lock().await;
        let updates = self.shared.mappings.subscribe();
        Feed {
            snapshot: state.recorded_txs.clone(),
            updates,
        }
    }

    /// Class names of every registered flow.
    pub fn registered_flows(&self) -> Vec<String> {
        self.shared.registry.registered_flow_names()
    }

    /// The registry this manager resolves classes against.
    pub fn registry(&self) -> &FlowRegistry {
        &self.shared.registry
    }

    /// Health of the state-machine update feed.
    pub fn update_feed_metrics(&self) -> FeedMetrics {
        self.shared.updates.metrics()
    }

    /// Whether a checkpoint currently exists for `run_id`. Operational
    /// introspection and test support; flows themselves never ask.
    pub async fn has_checkpoint(&self, run_id: RunId) -> Result<bool, ManagerError> {
        Ok(self.shared.store.contains(run_id).await?)
    }
}
