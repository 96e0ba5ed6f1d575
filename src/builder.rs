//! Fluent construction surface: machine configuration plus the state and
//! transition descriptors consumed by the machine's mutation methods.
//!
//! This is the minimal layer a declaration DSL calls into; the engine
//! itself only ever sees the finished tree shape.

use std::any::Any;
use std::rc::Rc;

use crate::core::event::{Event, EventContext, EventMatcher};
use crate::core::state::{ChildMode, HistoryDepth, HistorySlot, StateId, StateKind};
use crate::core::state::DataSlot;
use crate::core::transition::{DirectionFn, GuardFn, TransitionDirection, TransitionKind};
use crate::error::CallbackError;
use crate::machine::config::{
    CallbackHost, ExceptionHandler, MachineConfig, MachineLogger, PendingPolicy, ResolutionPolicy,
};
use crate::machine::listener::TransitionListener;
use crate::machine::StateMachine;

/// Describes a state to be added with
/// [`StateMachine::add_state`](crate::machine::StateMachine::add_state).
pub struct StateSpec {
    pub(crate) name: Option<String>,
    pub(crate) child_mode: ChildMode,
    pub(crate) kind: StateKind,
}

impl StateSpec {
    /// An ordinary composite state in Exclusive child mode.
    pub fn plain() -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::Plain,
        }
    }

    /// A state whose children are all active together.
    pub fn parallel() -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Parallel,
            kind: StateKind::Plain,
        }
    }

    /// A terminal marker; entering it finishes the parent.
    pub fn final_state() -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::Final,
        }
    }

    /// A data state extracting its value of type `D` from incoming events.
    ///
    /// The extractor sees the event with any undo wrapper removed, so
    /// values restored by undo come from the event that originally
    /// produced them.
    pub fn data<D, F>(extract: F) -> Self
    where
        D: 'static,
        F: Fn(&dyn Event) -> Option<D> + 'static,
    {
        let extractor = Rc::new(move |ctx: &EventContext| {
            extract(ctx.unwrapped_event()).map(|value| Rc::new(value) as Rc<dyn Any>)
        });
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::Data(DataSlot::new(extractor, None)),
        }
    }

    /// A data state with a default used when neither the event nor a last
    /// value provides one.
    pub fn data_with_default<D, F, G>(extract: F, default: G) -> Self
    where
        D: 'static,
        F: Fn(&dyn Event) -> Option<D> + 'static,
        G: Fn() -> D + 'static,
    {
        let extractor = Rc::new(move |ctx: &EventContext| {
            extract(ctx.unwrapped_event()).map(|value| Rc::new(value) as Rc<dyn Any>)
        });
        let default = Rc::new(move || Rc::new(default()) as Rc<dyn Any>);
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::Data(DataSlot::new(extractor, Some(default))),
        }
    }

    /// A choice pseudo-state; the function picks the target when traversal
    /// reaches it.
    pub fn choice(
        f: impl Fn(&EventContext) -> Result<StateId, CallbackError> + 'static,
    ) -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::Choice(Rc::new(f)),
        }
    }

    /// A shallow history pseudo-state remembering the parent's immediate
    /// active child at last exit.
    pub fn shallow_history() -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::History(HistorySlot::new(HistoryDepth::Shallow, None)),
        }
    }

    /// A deep history pseudo-state remembering the full active leaf path
    /// at last exit.
    pub fn deep_history() -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::History(HistorySlot::new(HistoryDepth::Deep, None)),
        }
    }

    /// State entered before any exit has been recorded. Must be a sibling
    /// of the history state; without one, the parent's designated initial
    /// child is used.
    pub fn history_default(mut self, default: StateId) -> Self {
        if let StateKind::History(slot) = &mut self.kind {
            slot.default = Some(default);
        }
        self
    }

    /// An undo pseudo-state redirecting through the machine's undo stack.
    /// Requires undo to have been enabled at construction.
    pub fn undo() -> Self {
        Self {
            name: None,
            child_mode: ChildMode::Exclusive,
            kind: StateKind::Undo,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Describes a transition to be added with
/// [`StateMachine::add_transition`](crate::machine::StateMachine::add_transition).
pub struct TransitionSpec {
    pub(crate) name: Option<String>,
    pub(crate) matcher: EventMatcher,
    pub(crate) guard: Option<GuardFn>,
    pub(crate) direction: Option<DirectionFn>,
    pub(crate) kind: TransitionKind,
    pub(crate) listeners: Vec<Rc<dyn TransitionListener>>,
    pub(crate) static_target: Option<StateId>,
}

impl TransitionSpec {
    /// Match events of the concrete type `E`.
    pub fn on<E: Event>() -> Self {
        Self::with_matcher(EventMatcher::of::<E>())
    }

    /// Match every event.
    pub fn on_any() -> Self {
        Self::with_matcher(EventMatcher::any())
    }

    /// Match with a custom predicate.
    pub fn on_matching(f: impl Fn(&dyn Event) -> bool + 'static) -> Self {
        Self::with_matcher(EventMatcher::new(f))
    }

    fn with_matcher(matcher: EventMatcher) -> Self {
        Self {
            name: None,
            matcher,
            guard: None,
            direction: None,
            kind: TransitionKind::Local,
            listeners: Vec::new(),
            static_target: None,
        }
    }

    /// Name the transition; names are unique among one state's
    /// transitions.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Guard predicate; returning `false` withdraws the transition.
    pub fn guard(mut self, f: impl Fn(&EventContext) -> bool + 'static) -> Self {
        self.guard = Some(Rc::new(move |ctx| Ok(f(ctx))));
        self
    }

    /// Fallible guard; a failure destroys the machine.
    pub fn guard_fallible(
        mut self,
        f: impl Fn(&EventContext) -> Result<bool, CallbackError> + 'static,
    ) -> Self {
        self.guard = Some(Rc::new(f));
        self
    }

    /// Unconditional single target.
    pub fn to(mut self, target: StateId) -> Self {
        self.direction = Some(Rc::new(move |_| Ok(TransitionDirection::Target(target))));
        self.static_target = Some(target);
        self
    }

    /// Unconditional multi-target; the targets' lowest common ancestor
    /// must be a parallel state.
    pub fn to_each(mut self, targets: Vec<StateId>) -> Self {
        self.direction = Some(Rc::new(move |_| {
            Ok(TransitionDirection::Targets(targets.clone()))
        }));
        self.static_target = None;
        self
    }

    /// Fire without leaving the source state.
    pub fn stay(mut self) -> Self {
        self.direction = Some(Rc::new(|_| Ok(TransitionDirection::Stay)));
        self.static_target = None;
        self
    }

    /// Produce the direction per event; may return
    /// [`TransitionDirection::NoTransition`] to withdraw.
    pub fn direction(
        mut self,
        f: impl Fn(&EventContext) -> Result<TransitionDirection, CallbackError> + 'static,
    ) -> Self {
        self.direction = Some(Rc::new(f));
        self.static_target = None;
        self
    }

    /// Force exit and re-entry of the source even when the target is a
    /// descendant or ancestor.
    pub fn external(mut self) -> Self {
        self.kind = TransitionKind::External;
        self
    }

    pub fn listener(mut self, listener: Rc<dyn TransitionListener>) -> Self {
        self.listeners.push(listener);
        self
    }
}

/// Builds a configured, not-yet-started machine.
pub struct MachineBuilder {
    config: MachineConfig,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self {
            config: MachineConfig::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn resolution_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.config.resolution_policy = policy;
        self
    }

    pub fn pending_policy(mut self, policy: PendingPolicy) -> Self {
        self.config.pending_policy = policy;
        self
    }

    /// Track completed transitions so [`StateMachine::undo`] and undo
    /// states work.
    ///
    /// [`StateMachine::undo`]: crate::machine::StateMachine::undo
    pub fn enable_undo(mut self) -> Self {
        self.config.undo_enabled = true;
        self
    }

    pub fn logger(mut self, logger: Rc<dyn MachineLogger>) -> Self {
        self.config.logger = logger;
        self
    }

    /// Called when an event matches no transition in the active chain.
    pub fn on_ignored_event(mut self, f: impl Fn(&EventContext) + 'static) -> Self {
        self.config.ignored_event_handler = Some(Rc::new(f));
        self
    }

    pub fn exception_handler(mut self, handler: Rc<dyn ExceptionHandler>) -> Self {
        self.config.exception_handler = handler;
        self
    }

    pub fn callback_host(mut self, host: Rc<dyn CallbackHost>) -> Self {
        self.config.callback_host = host;
        self
    }

    pub fn build(self) -> StateMachine {
        StateMachine::new(self.config)
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MachineError;

    #[derive(Debug)]
    struct GoEvent;
    impl Event for GoEvent {}

    #[test]
    fn missing_initial_state_fails_at_start() {
        let machine = MachineBuilder::new().build();
        let child = machine
            .add_state(machine.root(), StateSpec::plain().named("only"))
            .unwrap();
        let err = machine.start().unwrap_err();
        assert!(matches!(err, MachineError::MissingInitialState { .. }));
        // The machine stays usable: designate the initial child and retry.
        machine.set_initial_state(machine.root(), child).unwrap();
        machine.start().unwrap();
    }

    #[test]
    fn duplicate_transition_names_are_rejected() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        let b = machine
            .add_state(machine.root(), StateSpec::plain().named("b"))
            .unwrap();
        machine.set_initial_state(machine.root(), a).unwrap();
        machine
            .add_transition(a, TransitionSpec::on::<GoEvent>().named("go").to(b))
            .unwrap();
        let err = machine
            .add_transition(a, TransitionSpec::on::<GoEvent>().named("go").to(b))
            .unwrap_err();
        assert!(matches!(err, MachineError::DuplicateTransitionName { .. }));
    }

    #[test]
    fn duplicate_sibling_state_names_are_rejected() {
        let machine = MachineBuilder::new().build();
        machine
            .add_state(machine.root(), StateSpec::plain().named("twin"))
            .unwrap();
        let err = machine
            .add_state(machine.root(), StateSpec::plain().named("twin"))
            .unwrap_err();
        assert!(matches!(err, MachineError::DuplicateStateName { .. }));
    }

    #[test]
    fn transitions_without_a_direction_are_rejected() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        let err = machine
            .add_transition(a, TransitionSpec::on::<GoEvent>())
            .unwrap_err();
        assert!(matches!(err, MachineError::MissingDirection { .. }));
    }

    #[test]
    fn parallel_states_reject_initial_children() {
        let machine = MachineBuilder::new().build();
        let region = machine
            .add_state(machine.root(), StateSpec::parallel().named("regions"))
            .unwrap();
        let inner = machine.add_state(region, StateSpec::plain().named("one")).unwrap();
        let err = machine.set_initial_state(region, inner).unwrap_err();
        assert!(matches!(err, MachineError::InitialOnParallel { .. }));
    }

    #[test]
    fn initial_state_must_be_a_child() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        let stranger = machine.add_state(a, StateSpec::plain().named("inner")).unwrap();
        let err = machine
            .set_initial_state(machine.root(), stranger)
            .unwrap_err();
        assert!(matches!(err, MachineError::NotAChild { .. }));
    }

    #[test]
    fn tree_mutation_after_start_is_rejected() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        machine.set_initial_state(machine.root(), a).unwrap();
        machine.start().unwrap();
        let err = machine
            .add_state(machine.root(), StateSpec::plain().named("late"))
            .unwrap_err();
        assert!(matches!(err, MachineError::MutationAfterStart));
        // Stopping does not reopen the tree for mutation.
        machine.stop().unwrap();
        let err = machine
            .add_state(machine.root(), StateSpec::plain().named("later"))
            .unwrap_err();
        assert!(matches!(err, MachineError::MutationAfterStart));
    }

    #[test]
    fn pseudo_states_reject_transitions_children_and_listeners() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        let choice = machine
            .add_state(
                machine.root(),
                StateSpec::choice(move |_| Ok(a)).named("pick"),
            )
            .unwrap();
        assert!(matches!(
            machine.add_transition(choice, TransitionSpec::on::<GoEvent>().to(a)),
            Err(MachineError::PseudoStateMisuse { .. })
        ));
        assert!(matches!(
            machine.add_state(choice, StateSpec::plain()),
            Err(MachineError::PseudoStateMisuse { .. })
        ));
        assert!(matches!(
            machine.add_state_listener(choice, crate::machine::listener::on_entry(|_, _, _| {})),
            Err(MachineError::PseudoStateMisuse { .. })
        ));
    }

    #[test]
    fn final_states_reject_outgoing_transitions() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        let done = machine
            .add_state(machine.root(), StateSpec::final_state().named("done"))
            .unwrap();
        let err = machine
            .add_transition(done, TransitionSpec::on::<GoEvent>().to(a))
            .unwrap_err();
        assert!(matches!(err, MachineError::TransitionFromFinal { .. }));
    }

    #[test]
    fn undo_states_require_undo_enabled() {
        let machine = MachineBuilder::new().build();
        let err = machine
            .add_state(machine.root(), StateSpec::undo().named("back"))
            .unwrap_err();
        assert!(matches!(err, MachineError::UndoDisabled));

        let with_undo = MachineBuilder::new().enable_undo().build();
        assert!(with_undo
            .add_state(with_undo.root(), StateSpec::undo().named("back"))
            .is_ok());
    }

    #[test]
    fn history_default_must_be_a_sibling() {
        let machine = MachineBuilder::new().build();
        let outer = machine
            .add_state(machine.root(), StateSpec::plain().named("outer"))
            .unwrap();
        let elsewhere = machine
            .add_state(machine.root(), StateSpec::plain().named("elsewhere"))
            .unwrap();
        let err = machine
            .add_state(
                outer,
                StateSpec::shallow_history()
                    .history_default(elsewhere)
                    .named("hist"),
            )
            .unwrap_err();
        assert!(matches!(err, MachineError::HistoryDefaultNotSibling { .. }));
    }
}
