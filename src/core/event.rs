//! Events, event matchers, and the event-plus-argument pair handed to
//! guards, direction producers, and listeners.
//!
//! Events are matched by type identity, so each distinct occurrence kind is
//! its own Rust type implementing the [`Event`] marker trait.

use std::any::{Any, TypeId};
use std::fmt;
use std::rc::Rc;

use crate::core::state::StateId;

/// Marker trait for types that can be submitted to a machine.
///
/// # Example
///
/// ```rust
/// use canopy::Event;
///
/// #[derive(Debug)]
/// struct SwitchEvent;
///
/// impl Event for SwitchEvent {}
/// ```
pub trait Event: Any + fmt::Debug {}

impl dyn Event {
    /// Downcast to a concrete event type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        let any: &dyn Any = self;
        any.downcast_ref::<E>()
    }

    /// Whether this event is of the concrete type `E`.
    pub fn is<E: Event>(&self) -> bool {
        self.type_id() == TypeId::of::<E>()
    }
}

/// An event together with its optional argument.
///
/// The pair travels through resolution and notification unchanged; the
/// argument is an opaque value the host attaches per submission.
#[derive(Clone)]
pub struct EventContext {
    event: Rc<dyn Event>,
    argument: Option<Rc<dyn Any>>,
}

impl EventContext {
    pub fn new<E: Event>(event: E) -> Self {
        Self {
            event: Rc::new(event),
            argument: None,
        }
    }

    pub fn with_argument<E: Event, A: 'static>(event: E, argument: A) -> Self {
        Self {
            event: Rc::new(event),
            argument: Some(Rc::new(argument)),
        }
    }

    pub(crate) fn from_parts(event: Rc<dyn Event>, argument: Option<Rc<dyn Any>>) -> Self {
        Self { event, argument }
    }

    pub fn event(&self) -> &dyn Event {
        self.event.as_ref()
    }

    pub(crate) fn event_rc(&self) -> Rc<dyn Event> {
        Rc::clone(&self.event)
    }

    pub fn argument(&self) -> Option<&dyn Any> {
        self.argument.as_deref()
    }

    pub(crate) fn argument_rc(&self) -> Option<Rc<dyn Any>> {
        self.argument.clone()
    }

    pub fn argument_as<A: 'static>(&self) -> Option<&A> {
        self.argument.as_deref().and_then(|a| a.downcast_ref())
    }

    /// Downcast the event to a concrete type.
    pub fn event_as<E: Event>(&self) -> Option<&E> {
        self.event.as_ref().downcast_ref::<E>()
    }

    /// The event with any [`UndoneEvent`] wrapper removed.
    ///
    /// Data extractors read through the wrapper so values restored by undo
    /// come from the event that originally produced them.
    pub fn unwrapped_event(&self) -> &dyn Event {
        match self.event_as::<UndoneEvent>() {
            Some(undone) => undone.original.event(),
            None => self.event(),
        }
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("event", &self.event)
            .field("argument", &self.argument.as_ref().map(|_| "<argument>"))
            .finish()
    }
}

/// Predicate over event identity used to select transitions.
#[derive(Clone)]
pub struct EventMatcher {
    predicate: Rc<dyn Fn(&dyn Event) -> bool>,
}

impl EventMatcher {
    /// Match events of the concrete type `E`.
    pub fn of<E: Event>() -> Self {
        Self {
            predicate: Rc::new(|event| event.is::<E>()),
        }
    }

    /// Match every event.
    pub fn any() -> Self {
        Self {
            predicate: Rc::new(|_| true),
        }
    }

    /// Match with a custom predicate.
    pub fn new(predicate: impl Fn(&dyn Event) -> bool + 'static) -> Self {
        Self {
            predicate: Rc::new(predicate),
        }
    }

    pub fn accepts(&self, event: &dyn Event) -> bool {
        (self.predicate)(event)
    }
}

/// Synthesized when a machine starts; drives the initial entry chain.
#[derive(Debug)]
pub struct StartEvent;

impl Event for StartEvent {}

/// Synthesized when a state finishes, carrying the finishing state and its
/// last extracted data. Matches ordinary transitions elsewhere in the tree.
pub struct FinishedEvent {
    state: StateId,
    data: Option<Rc<dyn Any>>,
}

impl FinishedEvent {
    pub(crate) fn new(state: StateId, data: Option<Rc<dyn Any>>) -> Self {
        Self { state, data }
    }

    /// The state that finished.
    pub fn state(&self) -> StateId {
        self.state
    }

    /// The finishing state's last extracted data, if it was a data state.
    pub fn data(&self) -> Option<&dyn Any> {
        self.data.as_deref()
    }

    pub fn data_as<D: 'static>(&self) -> Option<&D> {
        self.data.as_deref().and_then(|d| d.downcast_ref())
    }
}

impl fmt::Debug for FinishedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinishedEvent")
            .field("state", &self.state)
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

impl Event for FinishedEvent {}

/// Submitted by [`StateMachine::undo`](crate::machine::StateMachine::undo)
/// to request a move back to the previously active state.
#[derive(Debug)]
pub struct UndoEvent;

impl Event for UndoEvent {}

/// Wraps the event that originally entered a state when undo restores it.
#[derive(Debug)]
pub struct UndoneEvent {
    original: EventContext,
}

impl UndoneEvent {
    pub(crate) fn new(original: EventContext) -> Self {
        Self { original }
    }

    /// The event and argument that originally triggered entry to the
    /// restored state.
    pub fn original(&self) -> &EventContext {
        &self.original
    }
}

impl Event for UndoneEvent {}
