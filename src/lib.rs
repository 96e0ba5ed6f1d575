//! Canopy: a hierarchical, parallel-region state machine execution engine.
//!
//! Given a tree of states (composite, parallel, pseudo, data-bearing) and
//! a set of event-triggered transitions, the engine resolves on every
//! incoming event which transition fires, computes the exit/entry path
//! through the tree, mutates the active configuration, and emits ordered
//! lifecycle notifications, with single-flight event processing,
//! consistent finished/undo/history bookkeeping, and containment of
//! listener failures.
//!
//! # Core Concepts
//!
//! - **State tree**: an arena of nodes in Exclusive or Parallel child mode,
//!   addressed by [`StateId`] handles
//! - **Transitions**: event matcher + guard + direction producer, resolved
//!   bottom-up from the active leaves
//! - **Pseudo-states**: choice, shallow/deep history, and undo nodes that
//!   redirect traversal instead of being entered
//! - **Data states**: per-state typed values extracted from events
//!
//! # Example
//!
//! ```rust
//! use canopy::{Event, MachineBuilder, ProcessingResult, StateSpec, TransitionSpec};
//!
//! #[derive(Debug)]
//! struct SwitchEvent;
//! impl Event for SwitchEvent {}
//!
//! # fn main() -> Result<(), canopy::MachineError> {
//! let machine = MachineBuilder::new().named("light").build();
//! let green = machine.add_state(machine.root(), StateSpec::plain().named("green"))?;
//! let red = machine.add_state(machine.root(), StateSpec::plain().named("red"))?;
//! machine.set_initial_state(machine.root(), green)?;
//! machine.add_transition(green, TransitionSpec::on::<SwitchEvent>().to(red))?;
//!
//! machine.start()?;
//! assert!(machine.is_active(green));
//!
//! assert_eq!(machine.process_event(SwitchEvent)?, ProcessingResult::Processed);
//! assert!(machine.is_active(red));
//! assert!(!machine.is_active(green));
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod core;
pub mod error;
pub mod machine;
pub mod record;
pub mod visit;

pub use crate::builder::{MachineBuilder, StateSpec, TransitionSpec};
pub use crate::core::{
    ChildMode, Event, EventContext, EventMatcher, FinishedEvent, HistoryDepth, StartEvent,
    StateId, TransitionDirection, TransitionKind, UndoEvent, UndoneEvent,
};
pub use crate::error::{CallbackError, CallbackStage, MachineError};
pub use crate::machine::{
    CallbackHost, DataHandle, ExceptionHandler, FacadeLogger, InlineHost, MachineConfig,
    MachineListener, MachineLogger, MachineStatus, NullLogger, PendingPolicy, ProcessingResult,
    ResolutionPolicy, RethrowHandler, StateListener, StateMachine, SwallowHandler,
    TransitionListener, TransitionNotification,
};
pub use crate::record::{
    restore_from_recorded_events, summarize_record, EventLogSummary, RecordedEvent,
    RecordedEventSummary,
};
pub use crate::visit::{StateInfo, TransitionInfo};
