//! Read-only traversal contract for export visitors.
//!
//! Diagram renderers enumerate the tree and its transitions statically,
//! without driving events. Everything they need is copied out of the tree
//! so callbacks never observe a live borrow.

use crate::core::state::{ChildMode, StateId, StateKind};
use crate::core::transition::TransitionKind;
use crate::error::MachineError;
use crate::machine::StateMachine;

/// Static description of one state.
#[derive(Clone, Debug)]
pub struct StateInfo {
    pub id: StateId,
    pub name: Option<String>,
    pub parent: Option<StateId>,
    pub child_mode: ChildMode,
    pub initial: Option<StateId>,
    pub is_final: bool,
    pub is_pseudo: bool,
}

/// Static description of one transition.
#[derive(Clone, Debug)]
pub struct TransitionInfo {
    pub source: StateId,
    /// Position in the source's transition list.
    pub index: usize,
    pub name: Option<String>,
    pub kind: TransitionKind,
    /// Target declared without a direction producer, before redirect
    /// resolution. `None` for conditional transitions.
    pub static_target: Option<StateId>,
}

impl StateMachine {
    /// Static description of `state`.
    pub fn state_info(&self, state: StateId) -> Result<StateInfo, MachineError> {
        let tree = self.tree();
        if !tree.contains(state) {
            return Err(MachineError::UnknownState(state));
        }
        let node = tree.node(state);
        Ok(StateInfo {
            id: state,
            name: node.name.clone(),
            parent: node.parent,
            child_mode: node.child_mode,
            initial: node.initial,
            is_final: node.is_final(),
            is_pseudo: node.kind.is_pseudo(),
        })
    }

    /// Visit each direct child of `parent` in declaration order.
    pub fn for_each_child_state(
        &self,
        parent: StateId,
        mut visit: impl FnMut(&StateInfo),
    ) -> Result<(), MachineError> {
        let children: Vec<StateId> = {
            let tree = self.tree();
            if !tree.contains(parent) {
                return Err(MachineError::UnknownState(parent));
            }
            tree.node(parent).children.clone()
        };
        for child in children {
            let info = self.state_info(child)?;
            visit(&info);
        }
        Ok(())
    }

    /// Visit each transition declared on `state` in declaration order.
    pub fn for_each_transition(
        &self,
        state: StateId,
        mut visit: impl FnMut(&TransitionInfo),
    ) -> Result<(), MachineError> {
        let infos: Vec<TransitionInfo> = {
            let tree = self.tree();
            if !tree.contains(state) {
                return Err(MachineError::UnknownState(state));
            }
            tree.node(state)
                .transitions
                .iter()
                .enumerate()
                .map(|(index, t)| TransitionInfo {
                    source: state,
                    index,
                    name: t.name.clone(),
                    kind: t.kind,
                    static_target: t.static_target,
                })
                .collect()
        };
        for info in &infos {
            visit(info);
        }
        Ok(())
    }

    /// Resolve a transition's unconditional target through static
    /// redirects: a history state resolves to its default, a composite
    /// with a pseudo initial child resolves through it. Returns `None` for
    /// conditional transitions and for redirects that depend on runtime
    /// state (choice functions, undo stacks).
    pub fn resolved_static_target_of(&self, transition: &TransitionInfo) -> Option<StateId> {
        let mut id = transition.static_target?;
        loop {
            enum Hop {
                Done(StateId),
                Dynamic,
                Next(StateId),
            }
            let hop = {
                let tree = self.tree();
                if !tree.contains(id) {
                    return None;
                }
                let node = tree.node(id);
                match &node.kind {
                    StateKind::Choice(_) | StateKind::Undo => Hop::Dynamic,
                    StateKind::History(slot) => {
                        let fallback = slot
                            .default
                            .or_else(|| node.parent.and_then(|p| tree.node(p).initial));
                        match fallback {
                            Some(next) => Hop::Next(next),
                            None => Hop::Dynamic,
                        }
                    }
                    _ => match node.initial {
                        Some(init) if tree.node(init).kind.is_pseudo() => Hop::Next(init),
                        _ => Hop::Done(id),
                    },
                }
            };
            match hop {
                Hop::Done(id) => return Some(id),
                Hop::Dynamic => return None,
                Hop::Next(next) => id = next,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::{MachineBuilder, StateSpec, TransitionSpec};
    use crate::core::event::Event;
    use crate::core::transition::TransitionKind;

    #[derive(Debug)]
    struct GoEvent;
    impl Event for GoEvent {}

    #[test]
    fn children_and_transitions_are_enumerable() {
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

        let mut names = Vec::new();
        machine
            .for_each_child_state(machine.root(), |info| {
                names.push(info.name.clone().unwrap_or_default());
            })
            .unwrap();
        assert_eq!(names, ["a", "b"]);

        let mut transitions = Vec::new();
        machine
            .for_each_transition(a, |info| {
                transitions.push((info.name.clone(), info.kind, info.static_target));
            })
            .unwrap();
        assert_eq!(
            transitions,
            [(Some("go".to_string()), TransitionKind::Local, Some(b))]
        );
    }

    #[test]
    fn static_targets_resolve_through_history_defaults() {
        let machine = MachineBuilder::new().build();
        let home = machine
            .add_state(machine.root(), StateSpec::plain().named("home"))
            .unwrap();
        let outer = machine
            .add_state(machine.root(), StateSpec::plain().named("outer"))
            .unwrap();
        let inner1 = machine.add_state(outer, StateSpec::plain().named("inner1")).unwrap();
        let inner2 = machine.add_state(outer, StateSpec::plain().named("inner2")).unwrap();
        let hist = machine
            .add_state(
                outer,
                StateSpec::shallow_history().history_default(inner2).named("hist"),
            )
            .unwrap();
        machine.set_initial_state(machine.root(), home).unwrap();
        machine.set_initial_state(outer, inner1).unwrap();
        machine
            .add_transition(home, TransitionSpec::on::<GoEvent>().to(hist))
            .unwrap();

        let mut resolved = None;
        machine
            .for_each_transition(home, |info| {
                resolved = machine.resolved_static_target_of(info);
            })
            .unwrap();
        assert_eq!(resolved, Some(inner2));
    }

    #[test]
    fn conditional_transitions_have_no_static_target() {
        let machine = MachineBuilder::new().build();
        let a = machine
            .add_state(machine.root(), StateSpec::plain().named("a"))
            .unwrap();
        let b = machine
            .add_state(machine.root(), StateSpec::plain().named("b"))
            .unwrap();
        machine.set_initial_state(machine.root(), a).unwrap();
        machine
            .add_transition(
                a,
                TransitionSpec::on::<GoEvent>().direction(move |_| {
                    Ok(crate::core::transition::TransitionDirection::Target(b))
                }),
            )
            .unwrap();

        let mut static_target = Some(a);
        machine
            .for_each_transition(a, |info| {
                static_target = info.static_target;
            })
            .unwrap();
        assert_eq!(static_target, None);
    }
}
