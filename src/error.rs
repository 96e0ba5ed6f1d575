//! Error types for machine construction and event processing.

use crate::core::state::StateId;
use crate::machine::MachineStatus;
use std::fmt;
use thiserror::Error;

/// Failure raised by a user-supplied callback (guard, choice function,
/// data extractor, or listener).
pub type CallbackError = Box<dyn std::error::Error + 'static>;

/// Which structural callback failed.
///
/// Failures in these callbacks happen while the transition path is being
/// resolved, before the tree has been mutated, and are not recoverable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackStage {
    Guard,
    Direction,
    Choice,
    DataExtractor,
}

impl fmt::Display for CallbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Guard => "guard",
            Self::Direction => "direction producer",
            Self::Choice => "choice function",
            Self::DataExtractor => "data extractor",
        };
        f.write_str(name)
    }
}

/// Errors raised by machine construction, lifecycle, and event processing.
///
/// Configuration errors are raised synchronously at the offending call and
/// leave the machine usable when raised before `start`. Callback failures
/// follow the containment rules described on
/// [`StateMachine`](crate::machine::StateMachine).
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("machine has not been started")]
    NotStarted,

    #[error("machine is not running (status: {status:?})")]
    NotRunning { status: MachineStatus },

    #[error("machine is already running")]
    AlreadyRunning,

    #[error("machine was destroyed")]
    Destroyed,

    #[error("unknown state id {0:?}")]
    UnknownState(StateId),

    #[error("state `{state}` has children but no designated initial child")]
    MissingInitialState { state: String },

    #[error("`{child}` is not a child of `{parent}`")]
    NotAChild { parent: String, child: String },

    #[error("parallel state `{state}` cannot designate an initial child")]
    InitialOnParallel { state: String },

    #[error("the state tree cannot be modified after the machine has started")]
    MutationAfterStart,

    #[error("state `{state}` cannot {operation}")]
    PseudoStateMisuse {
        state: String,
        operation: &'static str,
    },

    #[error("final state `{state}` cannot have outgoing transitions")]
    TransitionFromFinal { state: String },

    #[error("duplicate sibling name `{name}` under `{parent}`")]
    DuplicateStateName { parent: String, name: String },

    #[error("duplicate transition name `{name}` on state `{state}`")]
    DuplicateTransitionName { state: String, name: String },

    #[error("transition on `{state}` declares no direction")]
    MissingDirection { state: String },

    #[error("history default `{default}` is not a sibling of `{state}`")]
    HistoryDefaultNotSibling { state: String, default: String },

    #[error("event matched conflicting transitions on `{first}` and `{second}`")]
    TransitionConflict { first: String, second: String },

    #[error("event processing is already in flight; the pending event was rejected")]
    PendingEventRejected,

    #[error("data state `{state}` holds no value while inactive")]
    InactiveDataAccess { state: String },

    #[error("data state `{state}` was entered without a value, last value, or default")]
    MissingDataValue { state: String },

    #[error("data state `{state}` holds a value of a different type")]
    DataTypeMismatch { state: String },

    #[error("`{state}` is not a data state")]
    NotADataState { state: String },

    #[error("undo was not enabled for this machine")]
    UndoDisabled,

    #[error("cannot compute an ancestor of an empty state set")]
    EmptyStateSet,

    #[error("multi-target transition requires a parallel lowest common ancestor, found `{lca}`")]
    LcaNotParallel { lca: String },

    #[error("{stage} callback failed: {cause}")]
    CallbackFailed {
        stage: CallbackStage,
        cause: CallbackError,
    },

    #[error("listener notification failed: {cause}")]
    ListenerFailed { cause: CallbackError },

    #[error("callback host returned without invoking the callback")]
    CallbackSkipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_readable_messages() {
        let err = MachineError::MissingInitialState {
            state: "outer".to_string(),
        };
        assert!(err.to_string().contains("outer"));

        let err = MachineError::TransitionConflict {
            first: "a".to_string(),
            second: "b".to_string(),
        };
        assert!(err.to_string().contains("a"));
        assert!(err.to_string().contains("b"));
    }

    #[test]
    fn callback_stage_displays_name() {
        assert_eq!(CallbackStage::Guard.to_string(), "guard");
        assert_eq!(CallbackStage::Choice.to_string(), "choice function");
    }
}
