//! Transition resolution: which transition fires for an incoming event,
//! and how pseudo-states redirect the chosen target.
//!
//! Resolution starts from the active leaves and walks each ancestor chain
//! upward. A result on a descendant shadows every transition on its
//! ancestors; two surviving results from distinct branches are a conflict
//! unless the machine was configured for first-match-wins.

use std::collections::HashSet;
use std::rc::Rc;

use crate::core::event::{EventContext, UndoneEvent};
use crate::core::state::{StateId, StateKind};
use crate::core::transition::{TransitionDirection, TransitionKind};
use crate::error::{CallbackStage, MachineError};
use crate::machine::config::ResolutionPolicy;
use crate::machine::StateMachine;

/// A transition selected for an event, with its produced direction.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedTransition {
    pub(crate) source: StateId,
    /// Position in the source's transition list; `None` for synthesized
    /// transitions, which have no listener set.
    pub(crate) index: Option<usize>,
    pub(crate) name: Option<String>,
    pub(crate) direction: TransitionDirection,
    pub(crate) kind: TransitionKind,
}

/// Result of chasing redirects from the resolved targets down to concrete
/// states.
pub(crate) struct RedirectOutcome {
    /// Concrete, enterable targets. Empty when a redirect produced nothing
    /// (an undo state with nothing to undo), in which case the event is
    /// ignored.
    pub(crate) targets: Vec<StateId>,
    /// Replacement context when an undo state replayed an earlier event.
    pub(crate) context_override: Option<EventContext>,
}

impl StateMachine {
    /// Find the unique transition matching `ctx` in the active
    /// configuration, or `None` when the event matches nothing.
    pub(crate) fn resolve_transition(
        &self,
        ctx: &EventContext,
    ) -> Result<Option<ResolvedTransition>, MachineError> {
        let chains: Vec<Vec<StateId>> = {
            let tree = self.tree();
            tree.active_leaves()
                .into_iter()
                .map(|leaf| tree.chain_to_root(leaf))
                .collect()
        };

        let mut visited: HashSet<StateId> = HashSet::new();
        let mut candidates: Vec<ResolvedTransition> = Vec::new();

        for chain in &chains {
            for &state in chain {
                if !visited.insert(state) {
                    // This state and all its ancestors were already
                    // consulted via an earlier chain.
                    break;
                }
                let matches = self.matches_on_state(state, ctx)?;
                if matches.is_empty() {
                    continue;
                }
                let resolved = self.pick_on_state(matches)?;
                candidates.push(resolved);
                // A result here shadows this chain's ancestors.
                break;
            }
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        // Cross-branch shadowing: a result on an ancestor of another
        // result's state was only reachable through a sibling branch and
        // is overridden by the deeper one.
        if candidates.len() > 1 {
            let sources: Vec<StateId> = candidates.iter().map(|c| c.source).collect();
            let keep = self.tree().drop_shadowed(&sources);
            let mut kept = Vec::with_capacity(keep.len());
            for (i, candidate) in candidates.into_iter().enumerate() {
                if keep.contains(&i) {
                    kept.push(candidate);
                }
            }
            candidates = kept;
        }

        match candidates.len() {
            1 => Ok(candidates.pop()),
            _ => match self.config().resolution_policy {
                ResolutionPolicy::FirstMatchWins => Ok(candidates.into_iter().next()),
                ResolutionPolicy::RaiseOnConflict => {
                    let first = self.transition_label(&candidates[0]);
                    let second = self.transition_label(&candidates[1]);
                    Err(MachineError::TransitionConflict { first, second })
                }
            },
        }
    }

    /// Evaluate all transitions declared on one state against the event.
    fn matches_on_state(
        &self,
        state: StateId,
        ctx: &EventContext,
    ) -> Result<Vec<ResolvedTransition>, MachineError> {
        // Snapshot the callbacks so no tree borrow is held while they run.
        let snapshot: Vec<_> = {
            let tree = self.tree();
            tree.node(state)
                .transitions
                .iter()
                .enumerate()
                .map(|(index, t)| {
                    (
                        index,
                        t.matcher.clone(),
                        t.guard.clone(),
                        Rc::clone(&t.direction),
                        t.name.clone(),
                        t.kind,
                    )
                })
                .collect()
        };

        let mut matches = Vec::new();
        for (index, matcher, guard, direction, name, kind) in snapshot {
            if !matcher.accepts(ctx.event()) {
                continue;
            }
            if let Some(guard) = guard {
                let pass = self.run_structural(CallbackStage::Guard, || guard(ctx))?;
                if !pass {
                    continue;
                }
            }
            let direction = self.run_structural(CallbackStage::Direction, || direction(ctx))?;
            if direction == TransitionDirection::NoTransition {
                continue;
            }
            matches.push(ResolvedTransition {
                source: state,
                index: Some(index),
                name,
                direction,
                kind,
            });
        }
        Ok(matches)
    }

    fn pick_on_state(
        &self,
        mut matches: Vec<ResolvedTransition>,
    ) -> Result<ResolvedTransition, MachineError> {
        if matches.len() == 1 {
            return Ok(matches.remove(0));
        }
        match self.config().resolution_policy {
            ResolutionPolicy::FirstMatchWins => Ok(matches.remove(0)),
            ResolutionPolicy::RaiseOnConflict => {
                let first = self.transition_label(&matches[0]);
                let second = self.transition_label(&matches[1]);
                Err(MachineError::TransitionConflict { first, second })
            }
        }
    }

    fn transition_label(&self, resolved: &ResolvedTransition) -> String {
        let state = self.tree().label(resolved.source);
        match &resolved.name {
            Some(name) => format!("{state}/{name}"),
            None => state,
        }
    }

    /// Chase pseudo-state redirects from each resolved target down to
    /// concrete states.
    ///
    /// A choice state's function result, a history state's stored-or-default
    /// states, and an undo state's popped entry each redirect again, and a
    /// composite whose initial descendant is a pseudo-state resolves
    /// through it transparently. The chain strictly narrows toward leaves,
    /// so it terminates.
    pub(crate) fn resolve_redirects(
        &self,
        ctx: &EventContext,
        targets: Vec<StateId>,
    ) -> Result<RedirectOutcome, MachineError> {
        let mut outcome = RedirectOutcome {
            targets: Vec::new(),
            context_override: None,
        };
        for target in targets {
            self.resolve_redirect_chain(ctx, target, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn resolve_redirect_chain(
        &self,
        ctx: &EventContext,
        start: StateId,
        outcome: &mut RedirectOutcome,
    ) -> Result<(), MachineError> {
        enum Hop {
            Concrete,
            Choice(crate::core::state::ChoiceFn),
            History(Vec<StateId>),
            Undo,
            Descend(StateId),
        }

        let mut id = start;
        loop {
            let hop = {
                let tree = self.tree();
                if !tree.contains(id) {
                    return Err(MachineError::UnknownState(id));
                }
                let node = tree.node(id);
                match &node.kind {
                    StateKind::Choice(f) => Hop::Choice(Rc::clone(f)),
                    StateKind::History(slot) => {
                        if slot.recorded.is_empty() {
                            let fallback = slot
                                .default
                                .or_else(|| node.parent.and_then(|p| tree.node(p).initial));
                            match fallback {
                                Some(d) => Hop::History(vec![d]),
                                None => {
                                    let parent = node
                                        .parent
                                        .map(|p| tree.label(p))
                                        .unwrap_or_else(|| tree.label(id));
                                    return Err(MachineError::MissingInitialState {
                                        state: parent,
                                    });
                                }
                            }
                        } else {
                            Hop::History(slot.recorded.clone())
                        }
                    }
                    StateKind::Undo => Hop::Undo,
                    _ => match node.initial {
                        Some(init) if tree.node(init).kind.is_pseudo() => Hop::Descend(init),
                        _ => Hop::Concrete,
                    },
                }
            };

            match hop {
                Hop::Concrete => {
                    outcome.targets.push(id);
                    return Ok(());
                }
                Hop::Choice(f) => {
                    id = self.run_structural(CallbackStage::Choice, || f(ctx))?;
                }
                Hop::History(stored) => {
                    if stored.len() == 1 {
                        id = stored[0];
                    } else {
                        for state in stored {
                            self.resolve_redirect_chain(ctx, state, outcome)?;
                        }
                        return Ok(());
                    }
                }
                Hop::Undo => {
                    match self.pop_undo_entry()? {
                        Some((state, original)) => {
                            let argument = original.argument_rc();
                            outcome.context_override = Some(EventContext::from_parts(
                                Rc::new(UndoneEvent::new(original)),
                                argument,
                            ));
                            id = state;
                        }
                        // Nothing to undo; the redirect yields no target.
                        None => return Ok(()),
                    }
                }
                Hop::Descend(init) => {
                    id = init;
                }
            }
        }
    }
}
