//! Listener traits and the notification payloads they receive.
//!
//! Listener failures are caught per listener and routed through the
//! machine's exception handler; they never unwind through the engine.

use std::rc::Rc;

use crate::core::event::EventContext;
use crate::core::state::StateId;
use crate::error::CallbackError;
use crate::machine::StateMachine;

/// Details of a firing transition, passed to transition and machine
/// listeners.
#[derive(Clone, Debug)]
pub struct TransitionNotification {
    /// State the transition is declared on.
    pub source: StateId,
    /// Transition name, when one was declared.
    pub name: Option<String>,
    /// Targets after pseudo-state redirection; empty for a stay transition.
    pub targets: Vec<StateId>,
    /// The event and argument that triggered the transition.
    pub context: EventContext,
}

/// Observes one state's lifecycle.
///
/// All methods default to no-ops so implementors override only what they
/// need.
pub trait StateListener {
    fn on_entry(
        &self,
        machine: &StateMachine,
        state: StateId,
        context: &EventContext,
    ) -> Result<(), CallbackError> {
        let _ = (machine, state, context);
        Ok(())
    }

    fn on_exit(
        &self,
        machine: &StateMachine,
        state: StateId,
        context: &EventContext,
    ) -> Result<(), CallbackError> {
        let _ = (machine, state, context);
        Ok(())
    }

    /// The state's finished flag just turned on.
    fn on_finished(
        &self,
        machine: &StateMachine,
        state: StateId,
        context: &EventContext,
    ) -> Result<(), CallbackError> {
        let _ = (machine, state, context);
        Ok(())
    }

    /// One-time hook run when the owning machine is destroyed.
    fn on_cleanup(&self, state: StateId) {
        let _ = state;
    }
}

/// Observes one transition.
pub trait TransitionListener {
    /// The transition was selected, before any exit or entry.
    fn on_triggered(
        &self,
        machine: &StateMachine,
        notification: &TransitionNotification,
    ) -> Result<(), CallbackError> {
        let _ = (machine, notification);
        Ok(())
    }

    /// Exit/entry finished; `active_leaves` is the resulting configuration.
    fn on_complete(
        &self,
        machine: &StateMachine,
        notification: &TransitionNotification,
        active_leaves: &[StateId],
    ) -> Result<(), CallbackError> {
        let _ = (machine, notification, active_leaves);
        Ok(())
    }
}

/// Observes the machine as a whole.
pub trait MachineListener {
    fn on_started(&self, machine: &StateMachine) -> Result<(), CallbackError> {
        let _ = machine;
        Ok(())
    }

    fn on_stopped(&self, machine: &StateMachine) -> Result<(), CallbackError> {
        let _ = machine;
        Ok(())
    }

    fn on_destroyed(&self, machine: &StateMachine) -> Result<(), CallbackError> {
        let _ = machine;
        Ok(())
    }

    /// A transition was selected for an event, before any exit or entry.
    fn on_transition(
        &self,
        machine: &StateMachine,
        notification: &TransitionNotification,
    ) -> Result<(), CallbackError> {
        let _ = (machine, notification);
        Ok(())
    }

    /// A transition finished; `active_leaves` is the resulting
    /// configuration.
    fn on_transition_complete(
        &self,
        machine: &StateMachine,
        notification: &TransitionNotification,
        active_leaves: &[StateId],
    ) -> Result<(), CallbackError> {
        let _ = (machine, notification, active_leaves);
        Ok(())
    }
}

struct EntryFn<F>(F);

impl<F> StateListener for EntryFn<F>
where
    F: Fn(&StateMachine, StateId, &EventContext),
{
    fn on_entry(
        &self,
        machine: &StateMachine,
        state: StateId,
        context: &EventContext,
    ) -> Result<(), CallbackError> {
        (self.0)(machine, state, context);
        Ok(())
    }
}

struct ExitFn<F>(F);

impl<F> StateListener for ExitFn<F>
where
    F: Fn(&StateMachine, StateId, &EventContext),
{
    fn on_exit(
        &self,
        machine: &StateMachine,
        state: StateId,
        context: &EventContext,
    ) -> Result<(), CallbackError> {
        (self.0)(machine, state, context);
        Ok(())
    }
}

struct FinishedFn<F>(F);

impl<F> StateListener for FinishedFn<F>
where
    F: Fn(&StateMachine, StateId, &EventContext),
{
    fn on_finished(
        &self,
        machine: &StateMachine,
        state: StateId,
        context: &EventContext,
    ) -> Result<(), CallbackError> {
        (self.0)(machine, state, context);
        Ok(())
    }
}

/// Wrap a closure as an entry listener.
pub fn on_entry(f: impl Fn(&StateMachine, StateId, &EventContext) + 'static) -> Rc<dyn StateListener> {
    Rc::new(EntryFn(f))
}

/// Wrap a closure as an exit listener.
pub fn on_exit(f: impl Fn(&StateMachine, StateId, &EventContext) + 'static) -> Rc<dyn StateListener> {
    Rc::new(ExitFn(f))
}

/// Wrap a closure as a finished listener.
pub fn on_finished(
    f: impl Fn(&StateMachine, StateId, &EventContext) + 'static,
) -> Rc<dyn StateListener> {
    Rc::new(FinishedFn(f))
}
