//! Transitions: event matcher, guard, direction producer, and locality.

use serde::{Deserialize, Serialize};
use std::rc::Rc;

use crate::core::event::{EventContext, EventMatcher};
use crate::core::state::StateId;
use crate::error::CallbackError;
use crate::machine::listener::TransitionListener;

/// What a transition's direction producer decided for an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionDirection {
    /// Fire without leaving the source state; no exit or entry happens.
    Stay,
    /// Behave as if the transition had not matched at all.
    NoTransition,
    /// Move to a single target.
    Target(StateId),
    /// Move to several targets under a parallel ancestor.
    Targets(Vec<StateId>),
}

impl TransitionDirection {
    pub(crate) fn target_ids(&self) -> Vec<StateId> {
        match self {
            Self::Target(id) => vec![*id],
            Self::Targets(ids) => ids.clone(),
            Self::Stay | Self::NoTransition => Vec::new(),
        }
    }
}

/// Transition locality.
///
/// `External` forces exit and re-entry of the source even when the target
/// is a descendant or ancestor of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    #[default]
    Local,
    External,
}

/// Guard over the event/argument pair; `false` withdraws the transition.
pub type GuardFn = Rc<dyn Fn(&EventContext) -> Result<bool, CallbackError>>;

/// Produces the transition's direction for an accepted event.
pub type DirectionFn = Rc<dyn Fn(&EventContext) -> Result<TransitionDirection, CallbackError>>;

/// An outgoing transition owned by its source state.
pub(crate) struct Transition {
    pub(crate) name: Option<String>,
    pub(crate) matcher: EventMatcher,
    pub(crate) guard: Option<GuardFn>,
    pub(crate) direction: DirectionFn,
    pub(crate) kind: TransitionKind,
    pub(crate) listeners: Vec<Rc<dyn TransitionListener>>,
    /// Target known without evaluating the direction producer; lets export
    /// visitors enumerate unconditional targets statically.
    pub(crate) static_target: Option<StateId>,
}
