//! The machine core: lifecycle, single-flight event processing, listener
//! notification ordering, and finished-state propagation.
//!
//! A machine is a cheap handle over shared single-threaded state; cloning
//! it yields another handle to the same instance, which is how listeners
//! reach back into the machine that is notifying them. All calls into one
//! instance must come from a single logical thread of control; the handle
//! is deliberately `!Send`.

pub mod config;
pub mod listener;
pub(crate) mod resolution;

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::rc::Rc;

use uuid::Uuid;

use crate::builder::{StateSpec, TransitionSpec};
use crate::core::event::{Event, EventContext, FinishedEvent, StartEvent, UndoEvent, UndoneEvent};
use crate::core::state::{ChildMode, StateId, StateKind, StateNode};
use crate::core::transition::{Transition, TransitionDirection, TransitionKind};
use crate::core::tree::StateTree;
use crate::error::{CallbackError, CallbackStage, MachineError};
use crate::machine::resolution::ResolvedTransition;
use crate::record::{EventRecord, RecordedEvent};

pub use config::{
    CallbackHost, ExceptionHandler, FacadeLogger, InlineHost, MachineConfig, MachineLogger,
    MachineStatus, NullLogger, PendingPolicy, ProcessingResult, ResolutionPolicy, RethrowHandler,
    SwallowHandler,
};
pub use listener::{MachineListener, StateListener, TransitionListener, TransitionNotification};

struct QueuedEvent {
    ctx: EventContext,
    self_generated: bool,
}

#[derive(Clone)]
struct UndoEntry {
    state: StateId,
    context: EventContext,
}

struct UndoSlot {
    stack: Vec<UndoEntry>,
}

pub(crate) struct MachineShared {
    id: Uuid,
    config: MachineConfig,
    tree: RefCell<StateTree>,
    status: Cell<MachineStatus>,
    /// Set on first `start`; structural mutation is forbidden afterwards.
    started_once: Cell<bool>,
    in_flight: Cell<bool>,
    pending: RefCell<VecDeque<QueuedEvent>>,
    listeners: RefCell<Vec<Rc<dyn MachineListener>>>,
    record: RefCell<EventRecord>,
    undo: RefCell<Option<UndoSlot>>,
}

/// A hierarchical state machine instance.
///
/// Build the tree with [`add_state`](Self::add_state),
/// [`set_initial_state`](Self::set_initial_state), and
/// [`add_transition`](Self::add_transition) (or through
/// [`MachineBuilder`](crate::builder::MachineBuilder)), then drive it with
/// [`start`](Self::start) and [`process_event`](Self::process_event).
///
/// # Failure containment
///
/// Listener failures are caught per listener; after the current
/// notification round completes they are handed to the configured
/// [`ExceptionHandler`], whose default destroys the machine and returns
/// the first failure. Failures in structural steps (guards, choice
/// functions, path resolution, data extraction) destroy the machine
/// immediately and skip the remaining notifications.
#[derive(Clone)]
pub struct StateMachine {
    shared: Rc<MachineShared>,
}

impl StateMachine {
    pub fn new(config: MachineConfig) -> Self {
        let tree = StateTree::new(config.name.clone());
        let undo = config
            .undo_enabled
            .then(|| UndoSlot { stack: Vec::new() });
        Self {
            shared: Rc::new(MachineShared {
                id: Uuid::new_v4(),
                tree: RefCell::new(tree),
                status: Cell::new(MachineStatus::NotStarted),
                started_once: Cell::new(false),
                in_flight: Cell::new(false),
                pending: RefCell::new(VecDeque::new()),
                listeners: RefCell::new(Vec::new()),
                record: RefCell::new(EventRecord::new()),
                undo: RefCell::new(undo),
                config,
            }),
        }
    }

    /// Unique id of this machine instance.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> Option<String> {
        self.shared.config.name.clone()
    }

    pub fn status(&self) -> MachineStatus {
        self.shared.status.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.status.get() == MachineStatus::Running
    }

    /// Root of the state tree.
    pub fn root(&self) -> StateId {
        self.tree().root()
    }

    pub(crate) fn tree(&self) -> Ref<'_, StateTree> {
        self.shared.tree.borrow()
    }

    pub(crate) fn tree_mut(&self) -> RefMut<'_, StateTree> {
        self.shared.tree.borrow_mut()
    }

    pub(crate) fn config(&self) -> &MachineConfig {
        &self.shared.config
    }

    fn log(&self, message: impl Fn() -> String) {
        self.shared.config.logger.log(&message);
    }

    // ------------------------------------------------------------------
    // Construction surface
    // ------------------------------------------------------------------

    fn require_mutable(&self) -> Result<(), MachineError> {
        match self.shared.status.get() {
            MachineStatus::Destroyed => Err(MachineError::Destroyed),
            _ if self.shared.started_once.get() => Err(MachineError::MutationAfterStart),
            _ => Ok(()),
        }
    }

    /// Add a state under `parent`. States are parented exactly once, here.
    pub fn add_state(&self, parent: StateId, spec: StateSpec) -> Result<StateId, MachineError> {
        self.require_mutable()?;
        let mut tree = self.tree_mut();
        if !tree.contains(parent) {
            return Err(MachineError::UnknownState(parent));
        }
        let parent_node = tree.node(parent);
        if parent_node.kind.is_pseudo() || parent_node.is_final() {
            return Err(MachineError::PseudoStateMisuse {
                state: tree.label(parent),
                operation: "own child states",
            });
        }
        if let Some(name) = &spec.name {
            if tree.sibling_name_taken(parent, name) {
                return Err(MachineError::DuplicateStateName {
                    parent: tree.label(parent),
                    name: name.clone(),
                });
            }
        }
        if let StateKind::History(slot) = &spec.kind {
            if let Some(default) = slot.default {
                if tree.parent(default) != Some(parent) {
                    return Err(MachineError::HistoryDefaultNotSibling {
                        state: spec.name.clone().unwrap_or_else(|| "<history>".to_string()),
                        default: tree.label(default),
                    });
                }
            }
        }
        if matches!(spec.kind, StateKind::Undo) && self.shared.undo.borrow().is_none() {
            return Err(MachineError::UndoDisabled);
        }
        let node = StateNode::new(spec.name, spec.child_mode, spec.kind);
        Ok(tree.add_child(parent, node))
    }

    /// Designate the child entered when `parent` is entered without a
    /// deeper target.
    pub fn set_initial_state(&self, parent: StateId, child: StateId) -> Result<(), MachineError> {
        self.require_mutable()?;
        let mut tree = self.tree_mut();
        if !tree.contains(parent) {
            return Err(MachineError::UnknownState(parent));
        }
        if !tree.contains(child) {
            return Err(MachineError::UnknownState(child));
        }
        if tree.parent(child) != Some(parent) {
            return Err(MachineError::NotAChild {
                parent: tree.label(parent),
                child: tree.label(child),
            });
        }
        if tree.node(parent).child_mode == ChildMode::Parallel {
            return Err(MachineError::InitialOnParallel {
                state: tree.label(parent),
            });
        }
        tree.node_mut(parent).initial = Some(child);
        Ok(())
    }

    /// Add an outgoing transition to `source`.
    pub fn add_transition(&self, source: StateId, spec: TransitionSpec) -> Result<(), MachineError> {
        self.require_mutable()?;
        let mut tree = self.tree_mut();
        if !tree.contains(source) {
            return Err(MachineError::UnknownState(source));
        }
        let node = tree.node(source);
        if node.kind.is_pseudo() {
            return Err(MachineError::PseudoStateMisuse {
                state: tree.label(source),
                operation: "own outgoing transitions",
            });
        }
        if node.is_final() {
            return Err(MachineError::TransitionFromFinal {
                state: tree.label(source),
            });
        }
        let Some(direction) = spec.direction else {
            return Err(MachineError::MissingDirection {
                state: tree.label(source),
            });
        };
        if let Some(name) = &spec.name {
            if node
                .transitions
                .iter()
                .any(|t| t.name.as_deref() == Some(name))
            {
                return Err(MachineError::DuplicateTransitionName {
                    state: tree.label(source),
                    name: name.clone(),
                });
            }
        }
        tree.node_mut(source).transitions.push(Transition {
            name: spec.name,
            matcher: spec.matcher,
            guard: spec.guard,
            direction,
            kind: spec.kind,
            listeners: spec.listeners,
            static_target: spec.static_target,
        });
        Ok(())
    }

    /// Attach a listener to a state. Allowed at any point before the
    /// machine is destroyed.
    pub fn add_state_listener(
        &self,
        state: StateId,
        listener: Rc<dyn StateListener>,
    ) -> Result<(), MachineError> {
        if self.shared.status.get() == MachineStatus::Destroyed {
            return Err(MachineError::Destroyed);
        }
        let mut tree = self.tree_mut();
        if !tree.contains(state) {
            return Err(MachineError::UnknownState(state));
        }
        if tree.node(state).kind.is_pseudo() {
            return Err(MachineError::PseudoStateMisuse {
                state: tree.label(state),
                operation: "hold listeners",
            });
        }
        tree.node_mut(state).listeners.push(listener);
        Ok(())
    }

    pub fn add_machine_listener(
        &self,
        listener: Rc<dyn MachineListener>,
    ) -> Result<(), MachineError> {
        if self.shared.status.get() == MachineStatus::Destroyed {
            return Err(MachineError::Destroyed);
        }
        self.shared.listeners.borrow_mut().push(listener);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_active(&self, state: StateId) -> bool {
        let tree = self.tree();
        tree.contains(state) && tree.node(state).active
    }

    pub fn is_finished(&self, state: StateId) -> bool {
        let tree = self.tree();
        tree.contains(state) && tree.node(state).finished
    }

    pub fn state_name(&self, state: StateId) -> Option<String> {
        let tree = self.tree();
        if tree.contains(state) {
            tree.node(state).name.clone()
        } else {
            None
        }
    }

    /// Every active state, root first in depth-first order.
    pub fn active_states(&self) -> Vec<StateId> {
        self.tree().active_states()
    }

    /// Active states with no active child, in depth-first child order.
    pub fn active_leaves(&self) -> Vec<StateId> {
        self.tree().active_leaves()
    }

    /// Ordered record of externally submitted events that were actually
    /// processed.
    pub fn recorded_events(&self) -> Vec<RecordedEvent> {
        self.shared.record.borrow().entries().to_vec()
    }

    /// Typed accessor for a data state's value slots.
    pub fn data_handle<D: 'static>(&self, state: StateId) -> Result<DataHandle<D>, MachineError> {
        let tree = self.tree();
        if !tree.contains(state) {
            return Err(MachineError::UnknownState(state));
        }
        match tree.node(state).kind {
            StateKind::Data(_) => Ok(DataHandle {
                state,
                _marker: PhantomData,
            }),
            _ => Err(MachineError::NotADataState {
                state: tree.label(state),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the machine and enter the initial configuration.
    pub fn start(&self) -> Result<(), MachineError> {
        match self.shared.status.get() {
            MachineStatus::Running => return Err(MachineError::AlreadyRunning),
            MachineStatus::Destroyed => return Err(MachineError::Destroyed),
            MachineStatus::NotStarted | MachineStatus::Stopped => {}
        }
        // Validate before flipping status so a misconfigured machine stays
        // usable for further construction.
        self.validate_tree()?;
        self.shared.status.set(MachineStatus::Running);
        self.shared.started_once.set(true);
        self.log(|| "starting".to_string());

        let ctx = EventContext::new(StartEvent);
        // Entry counts as the first in-flight call, so events submitted
        // from start notifications go through the pending policy.
        self.shared.in_flight.set(true);
        let entry = (|| {
            self.notify_machine_round(|l| l.on_started(self))?;
            if !self.is_running() {
                return Ok(());
            }
            let root = self.root();
            let mut entered = Vec::new();
            self.enter_state(root, Vec::new(), &ctx, &mut entered)?;
            self.propagate_finished(&entered, &ctx)?;
            Ok(())
        })();
        let result = match entry {
            Ok(()) => {
                if self.is_running() {
                    if let Some(leaf) = self.tree().active_leaves().first().copied() {
                        self.push_undo(leaf, &ctx);
                    }
                }
                self.drain_pending()
            }
            Err(err) => {
                self.shared.pending.borrow_mut().clear();
                self.destroy_now();
                Err(err)
            }
        };
        self.shared.in_flight.set(false);
        result
    }

    /// Stop the machine, discarding pending events and deactivating every
    /// state without exit notifications. The machine may be restarted.
    pub fn stop(&self) -> Result<(), MachineError> {
        match self.shared.status.get() {
            MachineStatus::Destroyed => Err(MachineError::Destroyed),
            MachineStatus::NotStarted | MachineStatus::Stopped => Ok(()),
            MachineStatus::Running => {
                self.shared.status.set(MachineStatus::Stopped);
                self.shared.pending.borrow_mut().clear();
                // Undo entries reference the configuration being abandoned.
                if let Some(slot) = self.shared.undo.borrow_mut().as_mut() {
                    slot.stack.clear();
                }
                self.tree_mut().deactivate_all();
                self.log(|| "stopped".to_string());
                self.notify_machine_round(|l| l.on_stopped(self))
            }
        }
    }

    /// Destroy the machine: terminal. Discards pending events, notifies
    /// machine listeners, and runs every state's one-time cleanup hook.
    pub fn destroy(&self) -> Result<(), MachineError> {
        self.destroy_now();
        Ok(())
    }

    fn destroy_now(&self) {
        if self.shared.status.get() == MachineStatus::Destroyed {
            return;
        }
        self.shared.status.set(MachineStatus::Destroyed);
        self.shared.pending.borrow_mut().clear();
        self.log(|| "destroyed".to_string());
        // Best-effort notification; a failure here has nowhere to go.
        let listeners = self.machine_listeners();
        for listener in listeners {
            if let Err(err) = listener.on_destroyed(self) {
                self.log(|| format!("destroy listener failed: {err}"));
            }
        }
        let count = self.tree().len();
        for index in 0..count {
            let id = StateId(index);
            let listeners = self.tree().node(id).listeners.clone();
            for listener in listeners {
                listener.on_cleanup(id);
            }
        }
        self.tree_mut().reset_all();
        if let Some(slot) = self.shared.undo.borrow_mut().as_mut() {
            slot.stack.clear();
        }
    }

    fn validate_tree(&self) -> Result<(), MachineError> {
        let tree = self.tree();
        for index in 0..tree.len() {
            let id = StateId(index);
            let node = tree.node(id);
            if node.kind.is_pseudo() || node.child_mode != ChildMode::Exclusive {
                continue;
            }
            let has_enterable_child = node
                .children
                .iter()
                .any(|c| !tree.node(*c).kind.is_pseudo());
            if has_enterable_child && node.initial.is_none() {
                return Err(MachineError::MissingInitialState {
                    state: tree.label(id),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    /// Submit an event.
    ///
    /// Exactly one call is processed at a time; a reentrant call (from a
    /// listener of the in-flight event) is handed to the pending policy
    /// instead of executing inline.
    pub fn process_event<E: Event>(&self, event: E) -> Result<ProcessingResult, MachineError> {
        self.submit(EventContext::new(event), false)
    }

    /// Submit an event with an argument.
    pub fn process_event_with<E: Event, A: 'static>(
        &self,
        event: E,
        argument: A,
    ) -> Result<ProcessingResult, MachineError> {
        self.submit(EventContext::with_argument(event, argument), false)
    }

    /// Move back to the state that was active before the most recent
    /// transition. Requires undo to have been enabled at construction.
    pub fn undo(&self) -> Result<ProcessingResult, MachineError> {
        if self.shared.undo.borrow().is_none() {
            return Err(MachineError::UndoDisabled);
        }
        self.submit(EventContext::new(UndoEvent), false)
    }

    pub(crate) fn submit(
        &self,
        ctx: EventContext,
        self_generated: bool,
    ) -> Result<ProcessingResult, MachineError> {
        match self.shared.status.get() {
            MachineStatus::NotStarted => return Err(MachineError::NotStarted),
            MachineStatus::Destroyed => return Err(MachineError::Destroyed),
            MachineStatus::Stopped => {
                return Err(MachineError::NotRunning {
                    status: MachineStatus::Stopped,
                })
            }
            MachineStatus::Running => {}
        }
        if self.machine_finished() {
            return Ok(ProcessingResult::Ignored);
        }
        if self.shared.in_flight.get() {
            return match self.shared.config.pending_policy {
                PendingPolicy::Reject => Err(MachineError::PendingEventRejected),
                PendingPolicy::Queue => {
                    self.shared
                        .pending
                        .borrow_mut()
                        .push_back(QueuedEvent { ctx, self_generated });
                    Ok(ProcessingResult::Pending)
                }
            };
        }
        self.shared.in_flight.set(true);
        let result = match self.process_inner(&ctx, self_generated) {
            Ok(outcome) => self.drain_pending().map(|()| outcome),
            Err(err) => {
                self.shared.pending.borrow_mut().clear();
                Err(err)
            }
        };
        self.shared.in_flight.set(false);
        result
    }

    fn machine_finished(&self) -> bool {
        let tree = self.tree();
        let root = tree.root();
        tree.node(root).finished
    }

    /// Run queued events FIFO. A failure clears the remaining queue rather
    /// than leaving it partially executed.
    fn drain_pending(&self) -> Result<(), MachineError> {
        loop {
            if self.shared.status.get() != MachineStatus::Running {
                self.shared.pending.borrow_mut().clear();
                return Ok(());
            }
            let next = self.shared.pending.borrow_mut().pop_front();
            let Some(queued) = next else { return Ok(()) };
            if let Err(err) = self.process_inner(&queued.ctx, queued.self_generated) {
                self.shared.pending.borrow_mut().clear();
                return Err(err);
            }
        }
    }

    fn process_inner(
        &self,
        ctx: &EventContext,
        self_generated: bool,
    ) -> Result<ProcessingResult, MachineError> {
        if self.shared.status.get() != MachineStatus::Running || self.machine_finished() {
            return Ok(ProcessingResult::Ignored);
        }
        self.log(|| format!("processing {:?}", ctx.event()));

        if ctx.event_as::<UndoEvent>().is_some() {
            let outcome = self.perform_undo()?;
            if outcome == ProcessingResult::Processed && !self_generated {
                self.shared.record.borrow_mut().append(ctx.clone());
            }
            return Ok(outcome);
        }

        let resolved = match self.resolve_transition(ctx) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.destroy_now();
                return Err(err);
            }
        };
        let Some(resolved) = resolved else {
            if let Some(handler) = &self.shared.config.ignored_event_handler {
                handler(ctx);
            }
            self.log(|| format!("ignored {:?}", ctx.event()));
            return Ok(ProcessingResult::Ignored);
        };

        match self.execute_resolved(resolved, ctx, self_generated) {
            Ok(outcome) => {
                if outcome == ProcessingResult::Processed && !self_generated {
                    self.shared.record.borrow_mut().append(ctx.clone());
                }
                Ok(outcome)
            }
            Err(err) => {
                self.destroy_now();
                Err(err)
            }
        }
    }

    fn perform_undo(&self) -> Result<ProcessingResult, MachineError> {
        let Some((target, original)) = self.pop_undo_entry()? else {
            return Ok(ProcessingResult::Ignored);
        };
        let source = self
            .tree()
            .active_leaves()
            .first()
            .copied()
            .unwrap_or_else(|| self.tree().root());
        let argument = original.argument_rc();
        let wrapped =
            EventContext::from_parts(Rc::new(UndoneEvent::new(original)), argument);
        let synthesized = ResolvedTransition {
            source,
            index: None,
            name: None,
            direction: TransitionDirection::Target(target),
            kind: TransitionKind::Local,
        };
        self.execute_resolved(synthesized, &wrapped, true)
    }

    pub(crate) fn pop_undo_entry(
        &self,
    ) -> Result<Option<(StateId, EventContext)>, MachineError> {
        let mut undo = self.shared.undo.borrow_mut();
        let slot = undo.as_mut().ok_or(MachineError::UndoDisabled)?;
        if slot.stack.len() < 2 {
            return Ok(None);
        }
        let previous = slot.stack[slot.stack.len() - 2].clone();
        slot.stack.pop();
        Ok(Some((previous.state, previous.context)))
    }

    fn push_undo(&self, state: StateId, ctx: &EventContext) {
        if let Some(slot) = self.shared.undo.borrow_mut().as_mut() {
            slot.stack.push(UndoEntry {
                state,
                context: ctx.clone(),
            });
        }
    }

    fn execute_resolved(
        &self,
        resolved: ResolvedTransition,
        ctx: &EventContext,
        self_generated: bool,
    ) -> Result<ProcessingResult, MachineError> {
        let source = resolved.source;

        if resolved.direction == TransitionDirection::Stay {
            let notification = TransitionNotification {
                source,
                name: resolved.name.clone(),
                targets: Vec::new(),
                context: ctx.clone(),
            };
            self.notify_transition_round(source, resolved.index, |l| {
                l.on_triggered(self, &notification)
            })?;
            self.notify_machine_round(|l| l.on_transition(self, &notification))?;
            let leaves = self.tree().active_leaves();
            self.notify_transition_round(source, resolved.index, |l| {
                l.on_complete(self, &notification, &leaves)
            })?;
            self.notify_machine_round(|l| {
                l.on_transition_complete(self, &notification, &leaves)
            })?;
            if !self_generated {
                self.push_undo(source, ctx);
            }
            return Ok(ProcessingResult::Processed);
        }

        let outcome = self.resolve_redirects(ctx, resolved.direction.target_ids())?;
        if outcome.targets.is_empty() {
            // A redirect produced nothing (an undo state with nothing to
            // undo); the event is ignored.
            return Ok(ProcessingResult::Ignored);
        }
        let eff_ctx = outcome.context_override.unwrap_or_else(|| ctx.clone());
        let targets = outcome.targets;

        let (pivot, paths) = self.compute_paths(source, &targets, resolved.kind)?;

        let notification = TransitionNotification {
            source,
            name: resolved.name.clone(),
            targets: targets.clone(),
            context: eff_ctx.clone(),
        };
        self.log(|| {
            let tree = self.tree();
            format!(
                "transition from `{}` to {:?}",
                tree.label(source),
                targets.iter().map(|t| tree.label(*t)).collect::<Vec<_>>()
            )
        });

        self.notify_transition_round(source, resolved.index, |l| {
            l.on_triggered(self, &notification)
        })?;
        if !self.is_running() {
            return Ok(ProcessingResult::Processed);
        }
        self.notify_machine_round(|l| l.on_transition(self, &notification))?;
        if !self.is_running() {
            return Ok(ProcessingResult::Processed);
        }

        let exiting = self.tree().active_subtree_post_order(pivot);
        self.record_history(&exiting);
        self.exit_states(&exiting, &eff_ctx)?;
        if !self.is_running() {
            return Ok(ProcessingResult::Processed);
        }

        let mut entered = Vec::new();
        self.enter_under(pivot, paths, &eff_ctx, &mut entered)?;
        if !self.is_running() {
            return Ok(ProcessingResult::Processed);
        }

        self.propagate_finished(&entered, &eff_ctx)?;
        if !self.is_running() {
            return Ok(ProcessingResult::Processed);
        }

        let leaves = self.tree().active_leaves();
        self.notify_transition_round(source, resolved.index, |l| {
            l.on_complete(self, &notification, &leaves)
        })?;
        self.notify_machine_round(|l| l.on_transition_complete(self, &notification, &leaves))?;

        if !self_generated {
            let primary = targets.first().copied().unwrap_or(source);
            self.push_undo(primary, ctx);
        }
        Ok(ProcessingResult::Processed)
    }

    /// Pivot (effective lowest common ancestor) and the entry paths that
    /// hang below it, one per target, parent first.
    fn compute_paths(
        &self,
        source: StateId,
        targets: &[StateId],
        kind: TransitionKind,
    ) -> Result<(StateId, Vec<Vec<StateId>>), MachineError> {
        let tree = self.tree();
        let pivot = if targets.len() == 1 {
            let target = targets[0];
            let (mut lca, _) = tree.find_path_to_lca(source, target);
            // External transitions and self-transitions exit their source
            // even when source and target are in an ancestor relation; a
            // parallel ancestor means the transition crosses regions, which
            // exits the whole parallel composite.
            let forces_exit = kind == TransitionKind::External && (lca == source || lca == target);
            let crosses_regions = tree.node(lca).child_mode == ChildMode::Parallel;
            if forces_exit || source == target || crosses_regions {
                if let Some(parent) = tree.parent(lca) {
                    lca = parent;
                }
            }
            lca
        } else {
            let targets_lca = tree.find_lca(targets)?;
            if tree.node(targets_lca).child_mode != ChildMode::Parallel {
                return Err(MachineError::LcaNotParallel {
                    lca: tree.label(targets_lca),
                });
            }
            let (pivot, _) = tree.find_path_to_lca(source, targets_lca);
            pivot
        };

        let mut paths = Vec::with_capacity(targets.len());
        for &target in targets {
            if target == pivot {
                paths.push(Vec::new());
                continue;
            }
            let mut path = Vec::new();
            let mut cur = target;
            while cur != pivot {
                path.push(cur);
                match tree.parent(cur) {
                    Some(parent) => cur = parent,
                    None => break,
                }
            }
            path.reverse();
            paths.push(path);
        }
        Ok((pivot, paths))
    }

    /// Record history for every exiting composite that has history
    /// children, while the active flags still reflect the configuration
    /// being left.
    fn record_history(&self, exiting: &[StateId]) {
        let mut tree = self.tree_mut();
        for &state in exiting {
            let history_children: Vec<StateId> = tree
                .node(state)
                .children
                .iter()
                .copied()
                .filter(|c| matches!(tree.node(*c).kind, StateKind::History(_)))
                .collect();
            if history_children.is_empty() {
                continue;
            }
            let shallow: Vec<StateId> = tree
                .node(state)
                .children
                .iter()
                .copied()
                .filter(|c| tree.node(*c).active)
                .collect();
            let deep: Vec<StateId> = tree.active_leaves_under(state);
            for history in history_children {
                let depth = match &tree.node(history).kind {
                    StateKind::History(slot) => slot.depth,
                    _ => continue,
                };
                let record = match depth {
                    crate::core::state::HistoryDepth::Shallow => shallow.clone(),
                    crate::core::state::HistoryDepth::Deep => deep.clone(),
                };
                if record.is_empty() {
                    continue;
                }
                if let StateKind::History(slot) = &mut tree.node_mut(history).kind {
                    slot.recorded = record;
                }
            }
        }
    }

    /// Exit states deepest first, notifying `on_exit` per state, then
    /// clearing flags and rolling each data state's value into its last
    /// slot.
    fn exit_states(&self, exiting: &[StateId], ctx: &EventContext) -> Result<(), MachineError> {
        for &state in exiting {
            if self.shared.status.get() != MachineStatus::Running {
                return Ok(());
            }
            self.notify_state_round(state, |l| l.on_exit(self, state, ctx))?;
            let mut tree = self.tree_mut();
            let node = tree.node_mut(state);
            node.active = false;
            node.finished = false;
            if let StateKind::Data(slot) = &mut node.kind {
                if slot.current.is_some() {
                    slot.last = slot.current.take();
                }
            }
        }
        Ok(())
    }

    /// Enter `state` (flagging, data extraction, notification), then
    /// descend along pinned paths or initial chains.
    fn enter_state(
        &self,
        state: StateId,
        pinned: Vec<Vec<StateId>>,
        ctx: &EventContext,
        entered: &mut Vec<StateId>,
    ) -> Result<(), MachineError> {
        let newly = !self.tree().node(state).active;
        if newly {
            self.populate_data(state, ctx)?;
            {
                let mut tree = self.tree_mut();
                let node = tree.node_mut(state);
                node.active = true;
                node.finished = false;
            }
            entered.push(state);
            self.notify_state_round(state, |l| l.on_entry(self, state, ctx))?;
            if self.shared.status.get() != MachineStatus::Running {
                return Ok(());
            }
        }
        self.enter_under(state, pinned, ctx, entered)
    }

    /// Enter the children of `state`. `pinned` holds paths strictly below
    /// `state`, parent first; children without a pinned path follow their
    /// initial chains (Exclusive) or are all entered (Parallel).
    fn enter_under(
        &self,
        state: StateId,
        pinned: Vec<Vec<StateId>>,
        ctx: &EventContext,
        entered: &mut Vec<StateId>,
    ) -> Result<(), MachineError> {
        let mut groups: Vec<(StateId, Vec<Vec<StateId>>)> = Vec::new();
        for path in pinned {
            let Some((head, rest)) = path.split_first() else {
                continue;
            };
            let rest = rest.to_vec();
            match groups.iter_mut().find(|(h, _)| h == head) {
                Some((_, tails)) => tails.push(rest),
                None => groups.push((*head, vec![rest])),
            }
        }

        let (mode, children, initial) = {
            let tree = self.tree();
            let node = tree.node(state);
            (node.child_mode, node.children.clone(), node.initial)
        };

        match mode {
            ChildMode::Exclusive => {
                if groups.len() > 1 {
                    return Err(MachineError::LcaNotParallel {
                        lca: self.tree().label(state),
                    });
                }
                if let Some((child, tails)) = groups.pop() {
                    self.enter_state(child, tails, ctx, entered)?;
                    return Ok(());
                }
                let has_enterable = {
                    let tree = self.tree();
                    children.iter().any(|c| !tree.node(*c).kind.is_pseudo())
                };
                if !has_enterable {
                    return Ok(());
                }
                let Some(init) = initial else {
                    return Err(MachineError::MissingInitialState {
                        state: self.tree().label(state),
                    });
                };
                // The initial child may itself be a pseudo-state; resolve
                // through it before descending.
                let outcome = self.resolve_redirects(ctx, vec![init])?;
                let mut paths = Vec::new();
                for target in outcome.targets {
                    if target == state {
                        continue;
                    }
                    if !self.tree().is_ancestor(state, target) {
                        return Err(MachineError::NotAChild {
                            parent: self.tree().label(state),
                            child: self.tree().label(target),
                        });
                    }
                    paths.push(self.path_below(state, target));
                }
                if paths.is_empty() {
                    return Ok(());
                }
                self.enter_under(state, paths, ctx, entered)
            }
            ChildMode::Parallel => {
                for child in children {
                    if self.shared.status.get() != MachineStatus::Running {
                        return Ok(());
                    }
                    if self.tree().node(child).kind.is_pseudo() {
                        continue;
                    }
                    let tails = groups
                        .iter()
                        .position(|(h, _)| *h == child)
                        .map(|i| groups.remove(i).1)
                        .unwrap_or_default();
                    self.enter_state(child, tails, ctx, entered)?;
                }
                Ok(())
            }
        }
    }

    fn path_below(&self, ancestor: StateId, target: StateId) -> Vec<StateId> {
        let tree = self.tree();
        let mut path = Vec::new();
        let mut cur = target;
        while cur != ancestor {
            path.push(cur);
            match tree.parent(cur) {
                Some(parent) => cur = parent,
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Fill a data state's value slot on entry: event extraction first,
    /// then the surviving last value, then the default. Entering with none
    /// of the three is a contract violation.
    fn populate_data(&self, state: StateId, ctx: &EventContext) -> Result<(), MachineError> {
        let snapshot = {
            let tree = self.tree();
            match &tree.node(state).kind {
                StateKind::Data(slot) => Some((
                    Rc::clone(&slot.extractor),
                    slot.default.clone(),
                    slot.last.clone(),
                )),
                _ => None,
            }
        };
        let Some((extractor, default, last)) = snapshot else {
            return Ok(());
        };
        let extracted = self.run_hosted(|| extractor(ctx))?;
        let value = extracted.or(last).or_else(|| default.map(|d| d()));
        let Some(value) = value else {
            return Err(MachineError::MissingDataValue {
                state: self.tree().label(state),
            });
        };
        let mut tree = self.tree_mut();
        if let StateKind::Data(slot) = &mut tree.node_mut(state).kind {
            slot.current = Some(value);
        }
        Ok(())
    }

    /// Apply the finish rules to newly entered states and bubble upward:
    /// an Exclusive composite finishes the instant its active child is a
    /// final marker; a Parallel composite finishes once every direct child
    /// is finished.
    fn propagate_finished(
        &self,
        entered: &[StateId],
        ctx: &EventContext,
    ) -> Result<(), MachineError> {
        let newly: Vec<StateId> = {
            let mut tree = self.tree_mut();
            let mut newly = Vec::new();
            let mut queue: VecDeque<StateId> = VecDeque::new();
            for &id in entered {
                if tree.node(id).is_final() && tree.node(id).active && !tree.node(id).finished {
                    tree.node_mut(id).finished = true;
                    queue.push_back(id);
                }
            }
            while let Some(child) = queue.pop_front() {
                let Some(parent) = tree.parent(child) else {
                    continue;
                };
                if tree.node(parent).finished || !tree.node(parent).active {
                    continue;
                }
                let finished = match tree.node(parent).child_mode {
                    ChildMode::Exclusive => tree.node(child).is_final(),
                    ChildMode::Parallel => tree
                        .node(parent)
                        .children
                        .iter()
                        .filter(|c| !tree.node(**c).kind.is_pseudo())
                        .all(|c| tree.node(*c).finished),
                };
                if finished {
                    tree.node_mut(parent).finished = true;
                    newly.push(parent);
                    queue.push_back(parent);
                }
            }
            newly
        };

        for state in newly {
            if self.shared.status.get() != MachineStatus::Running {
                return Ok(());
            }
            self.notify_state_round(state, |l| l.on_finished(self, state, ctx))?;
            let data = {
                let tree = self.tree();
                match &tree.node(state).kind {
                    StateKind::Data(slot) => slot.current.clone().or_else(|| slot.last.clone()),
                    _ => None,
                }
            };
            self.shared.pending.borrow_mut().push_back(QueuedEvent {
                ctx: EventContext::new(FinishedEvent::new(state, data)),
                self_generated: true,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Callback plumbing
    // ------------------------------------------------------------------

    /// Run one callback through the injected host, sequentially.
    pub(crate) fn run_hosted<T>(&self, f: impl FnOnce() -> T) -> Result<T, MachineError> {
        let mut f = Some(f);
        let mut out: Option<T> = None;
        self.shared.config.callback_host.run(&mut || {
            if let Some(f) = f.take() {
                out = Some(f());
            }
        })?;
        out.ok_or(MachineError::CallbackSkipped)
    }

    /// Run a structural callback; a failure is fatal to the machine.
    pub(crate) fn run_structural<T>(
        &self,
        stage: CallbackStage,
        f: impl FnOnce() -> Result<T, CallbackError>,
    ) -> Result<T, MachineError> {
        match self.run_hosted(f) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(cause)) => Err(MachineError::CallbackFailed { stage, cause }),
            Err(host) => Err(host),
        }
    }

    fn machine_listeners(&self) -> Vec<Rc<dyn MachineListener>> {
        self.shared.listeners.borrow().clone()
    }

    /// Deliver one notification round: every listener is called even when
    /// an earlier one fails; the first failure is then handed to the
    /// exception handler, whose default destroys the machine.
    fn deliver_round(
        &self,
        count: usize,
        mut call: impl FnMut(usize) -> Result<(), CallbackError>,
    ) -> Result<(), MachineError> {
        let mut first: Option<MachineError> = None;
        for index in 0..count {
            match self.run_hosted(|| call(index)) {
                Ok(Ok(())) => {}
                Ok(Err(cause)) => {
                    if first.is_none() {
                        first = Some(MachineError::ListenerFailed { cause });
                    }
                }
                Err(host_err) => {
                    if first.is_none() {
                        first = Some(host_err);
                    }
                }
            }
        }
        match first {
            None => Ok(()),
            Some(err) => match self.shared.config.exception_handler.handle(err) {
                Ok(()) => Ok(()),
                Err(fatal) => {
                    self.destroy_now();
                    Err(fatal)
                }
            },
        }
    }

    fn notify_state_round(
        &self,
        state: StateId,
        call: impl Fn(&dyn StateListener) -> Result<(), CallbackError>,
    ) -> Result<(), MachineError> {
        let listeners = self.tree().node(state).listeners.clone();
        self.deliver_round(listeners.len(), |i| call(listeners[i].as_ref()))
    }

    fn notify_machine_round(
        &self,
        call: impl Fn(&dyn MachineListener) -> Result<(), CallbackError>,
    ) -> Result<(), MachineError> {
        let listeners = self.machine_listeners();
        self.deliver_round(listeners.len(), |i| call(listeners[i].as_ref()))
    }

    fn notify_transition_round(
        &self,
        source: StateId,
        index: Option<usize>,
        call: impl Fn(&dyn TransitionListener) -> Result<(), CallbackError>,
    ) -> Result<(), MachineError> {
        let Some(index) = index else { return Ok(()) };
        let listeners = {
            let tree = self.tree();
            tree.node(source)
                .transitions
                .get(index)
                .map(|t| t.listeners.clone())
                .unwrap_or_default()
        };
        self.deliver_round(listeners.len(), |i| call(listeners[i].as_ref()))
    }
}

/// Typed accessor for a data state's value slots.
///
/// Reading the current value while the state is inactive is a contract
/// violation reported as an error, never substituted with a default.
pub struct DataHandle<D> {
    state: StateId,
    _marker: PhantomData<D>,
}

impl<D: 'static> DataHandle<D> {
    pub fn state(&self) -> StateId {
        self.state
    }

    /// The value extracted on the state's most recent entry.
    pub fn get(&self, machine: &StateMachine) -> Result<Rc<D>, MachineError> {
        let tree = machine.tree();
        let node = tree.node(self.state);
        let StateKind::Data(slot) = &node.kind else {
            return Err(MachineError::NotADataState {
                state: tree.label(self.state),
            });
        };
        if !node.active {
            return Err(MachineError::InactiveDataAccess {
                state: tree.label(self.state),
            });
        }
        let value = slot
            .current
            .clone()
            .ok_or_else(|| MachineError::MissingDataValue {
                state: tree.label(self.state),
            })?;
        downcast_value(value, || tree.label(self.state))
    }

    /// The value that survived the state's last exit, if any.
    pub fn last(&self, machine: &StateMachine) -> Result<Option<Rc<D>>, MachineError> {
        let tree = machine.tree();
        let StateKind::Data(slot) = &tree.node(self.state).kind else {
            return Err(MachineError::NotADataState {
                state: tree.label(self.state),
            });
        };
        match slot.last.clone() {
            None => Ok(None),
            Some(value) => downcast_value(value, || tree.label(self.state)).map(Some),
        }
    }
}

fn downcast_value<D: 'static>(
    value: Rc<dyn Any>,
    label: impl Fn() -> String,
) -> Result<Rc<D>, MachineError> {
    value
        .downcast::<D>()
        .map_err(|_| MachineError::DataTypeMismatch { state: label() })
}
