//! Machine construction arguments: resolution and pending-event policies,
//! the diagnostic log sink, exception handling, and the callback host.

use serde::{Deserialize, Serialize};
use std::rc::Rc;

use crate::core::event::EventContext;
use crate::error::MachineError;

/// Lifecycle of a machine: `NotStarted → Running ⇄ Stopped → Destroyed`.
///
/// `Destroyed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatus {
    NotStarted,
    Running,
    Stopped,
    Destroyed,
}

/// Outcome of submitting an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingResult {
    /// A transition fired.
    Processed,
    /// No transition matched anywhere in the active chain, or the machine
    /// has finished.
    Ignored,
    /// Processing was in flight; the event was queued for execution right
    /// after the current call completes.
    Pending,
}

/// What to do when one event matches transitions on more than one state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionPolicy {
    /// Report the ambiguity as an error.
    #[default]
    RaiseOnConflict,
    /// Take the first match in depth-first, leaf-to-root order.
    FirstMatchWins,
}

/// What to do with an event submitted while another is being processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingPolicy {
    /// Fail the reentrant call loudly.
    #[default]
    Reject,
    /// Queue it (FIFO) for execution after the in-flight call completes.
    Queue,
}

/// Diagnostic sink. Messages are built lazily and are never required for
/// correctness.
pub trait MachineLogger {
    fn log(&self, message: &dyn Fn() -> String);
}

/// Discards all messages; the default sink.
pub struct NullLogger;

impl MachineLogger for NullLogger {
    fn log(&self, _message: &dyn Fn() -> String) {}
}

/// Forwards messages to the `log` facade at debug level, so hosts with a
/// subscriber installed see engine diagnostics.
pub struct FacadeLogger;

impl MachineLogger for FacadeLogger {
    fn log(&self, message: &dyn Fn() -> String) {
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("{}", message());
        }
    }
}

/// Decides whether a listener failure is fatal.
///
/// `Ok` swallows the failure and processing continues; `Err` destroys the
/// machine and surfaces the error to the caller. Structural failures
/// (guards, choice functions, path resolution) never reach the handler.
pub trait ExceptionHandler {
    fn handle(&self, error: MachineError) -> Result<(), MachineError>;
}

/// Default handler: every listener failure destroys the machine.
pub struct RethrowHandler;

impl ExceptionHandler for RethrowHandler {
    fn handle(&self, error: MachineError) -> Result<(), MachineError> {
        Err(error)
    }
}

/// Swallows listener failures; the machine keeps running.
pub struct SwallowHandler;

impl ExceptionHandler for SwallowHandler {
    fn handle(&self, _error: MachineError) -> Result<(), MachineError> {
        Ok(())
    }
}

/// Injected await capability for guards, direction producers, and
/// listeners.
///
/// The engine hands every callback to the host one at a time and requires
/// only sequential completion. A host may run the callback on its own
/// schedule (blocking on async work, instrumenting it) or refuse by
/// returning an error, which the engine treats as a failed callback.
pub trait CallbackHost {
    fn run(&self, callback: &mut dyn FnMut()) -> Result<(), MachineError>;
}

/// Runs callbacks inline; the default host.
pub struct InlineHost;

impl CallbackHost for InlineHost {
    fn run(&self, callback: &mut dyn FnMut()) -> Result<(), MachineError> {
        callback();
        Ok(())
    }
}

/// Called when an event matches no transition anywhere in the active chain.
pub type IgnoredEventHandler = Rc<dyn Fn(&EventContext)>;

/// Construction arguments for a machine.
///
/// The defaults are the strict ones: conflicts raise, reentrant events are
/// rejected, undo is off, diagnostics are discarded.
pub struct MachineConfig {
    pub name: Option<String>,
    pub resolution_policy: ResolutionPolicy,
    pub pending_policy: PendingPolicy,
    pub undo_enabled: bool,
    pub logger: Rc<dyn MachineLogger>,
    pub ignored_event_handler: Option<IgnoredEventHandler>,
    pub exception_handler: Rc<dyn ExceptionHandler>,
    pub callback_host: Rc<dyn CallbackHost>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: None,
            resolution_policy: ResolutionPolicy::default(),
            pending_policy: PendingPolicy::default(),
            undo_enabled: false,
            logger: Rc::new(NullLogger),
            ignored_event_handler: None,
            exception_handler: Rc::new(RethrowHandler),
            callback_host: Rc::new(InlineHost),
        }
    }
}
