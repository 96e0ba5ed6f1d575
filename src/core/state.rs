//! State tree nodes: kinds, child modes, and per-node bookkeeping.
//!
//! Nodes live in an arena owned by the tree (see
//! [`StateTree`](crate::core::tree::StateTree)) and are addressed by
//! copyable [`StateId`] handles; parent and owner references are ids, never
//! pointers.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::rc::Rc;

use crate::core::event::EventContext;
use crate::core::transition::Transition;
use crate::error::CallbackError;
use crate::machine::listener::StateListener;

/// Stable handle for a state in its machine's tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub(crate) usize);

/// How a state's children are activated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildMode {
    /// Exactly one child active at a time; requires a designated initial
    /// child before the machine starts.
    #[default]
    Exclusive,
    /// All children active together; has no initial-child concept.
    Parallel,
}

/// How much of the active configuration a history state remembers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryDepth {
    /// Only the immediate active child of the parent at last exit.
    Shallow,
    /// The full active leaf path under the parent at last exit.
    Deep,
}

/// Redirect function evaluated when traversal reaches a choice state.
pub type ChoiceFn = Rc<dyn Fn(&EventContext) -> Result<StateId, CallbackError>>;

/// Extracts a data state's value from an incoming event.
pub type DataExtractor = Rc<dyn Fn(&EventContext) -> Option<Rc<dyn Any>>>;

/// Produces a data state's default value when no event or last value applies.
pub type DataDefault = Rc<dyn Fn() -> Rc<dyn Any>>;

/// Value slots of a data state.
///
/// `current` is populated only while the state is active; `last` survives
/// exit and backs re-entry without fresh event data.
pub(crate) struct DataSlot {
    pub(crate) extractor: DataExtractor,
    pub(crate) default: Option<DataDefault>,
    pub(crate) current: Option<Rc<dyn Any>>,
    pub(crate) last: Option<Rc<dyn Any>>,
}

impl DataSlot {
    pub(crate) fn new(extractor: DataExtractor, default: Option<DataDefault>) -> Self {
        Self {
            extractor,
            default,
            current: None,
            last: None,
        }
    }
}

/// Per-region memory of a history pseudo-state.
pub(crate) struct HistorySlot {
    pub(crate) depth: HistoryDepth,
    /// Sibling entered before any exit has been recorded. Falls back to the
    /// parent's designated initial child when unset.
    pub(crate) default: Option<StateId>,
    pub(crate) recorded: Vec<StateId>,
}

impl HistorySlot {
    pub(crate) fn new(depth: HistoryDepth, default: Option<StateId>) -> Self {
        Self {
            depth,
            default,
            recorded: Vec::new(),
        }
    }
}

/// The kind of a tree node, with pseudo-state payloads inline.
pub(crate) enum StateKind {
    Plain,
    /// Terminal marker; entering it finishes the parent.
    Final,
    Data(DataSlot),
    Choice(ChoiceFn),
    History(HistorySlot),
    /// Redirects through the machine's undo stack.
    Undo,
}

impl StateKind {
    /// Pseudo-states cannot be entered or exited directly, hold no
    /// listeners, and own no children or transitions.
    pub(crate) fn is_pseudo(&self) -> bool {
        matches!(self, Self::Choice(_) | Self::History(_) | Self::Undo)
    }
}

/// One node of the state tree.
pub(crate) struct StateNode {
    pub(crate) name: Option<String>,
    pub(crate) parent: Option<StateId>,
    pub(crate) children: Vec<StateId>,
    pub(crate) child_mode: ChildMode,
    pub(crate) initial: Option<StateId>,
    pub(crate) active: bool,
    pub(crate) finished: bool,
    pub(crate) kind: StateKind,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) listeners: Vec<Rc<dyn StateListener>>,
}

impl StateNode {
    pub(crate) fn new(name: Option<String>, child_mode: ChildMode, kind: StateKind) -> Self {
        Self {
            name,
            parent: None,
            children: Vec::new(),
            child_mode,
            initial: None,
            active: false,
            finished: false,
            kind,
            transitions: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Display label: the name when present, otherwise the id.
    pub(crate) fn label(&self, id: StateId) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("<state {}>", id.0),
        }
    }

    pub(crate) fn is_final(&self) -> bool {
        matches!(self.kind, StateKind::Final)
    }
}
