//! Arena-indexed state tree and the path algorithms transitions rely on.
//!
//! Every transition pivots on a lowest common ancestor: the tree exits up
//! to it and re-enters down from it. The algorithms here are pure over the
//! node arena; all mutation policy (who may add what, and when) lives in
//! the machine layer.

use std::collections::HashSet;

use crate::core::state::{ChildMode, StateId, StateKind, StateNode};
use crate::error::MachineError;

/// Owns every node of one machine's tree.
///
/// Node 0 is always the root. Ids are never reused; nodes live until the
/// owning machine is destroyed.
pub(crate) struct StateTree {
    nodes: Vec<StateNode>,
}

impl StateTree {
    pub(crate) fn new(root_name: Option<String>) -> Self {
        let root = StateNode::new(root_name, ChildMode::Exclusive, StateKind::Plain);
        Self { nodes: vec![root] }
    }

    pub(crate) fn root(&self) -> StateId {
        StateId(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn contains(&self, id: StateId) -> bool {
        id.0 < self.nodes.len()
    }

    pub(crate) fn node(&self, id: StateId) -> &StateNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: StateId) -> &mut StateNode {
        &mut self.nodes[id.0]
    }

    pub(crate) fn label(&self, id: StateId) -> String {
        self.node(id).label(id)
    }

    /// Add a node under `parent`. The node is parented exactly once, here.
    pub(crate) fn add_child(&mut self, parent: StateId, mut node: StateNode) -> StateId {
        let id = StateId(self.nodes.len());
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    pub(crate) fn parent(&self, id: StateId) -> Option<StateId> {
        self.node(id).parent
    }

    pub(crate) fn depth(&self, id: StateId) -> usize {
        let mut depth = 0;
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            depth += 1;
            current = parent;
        }
        depth
    }

    /// Whether `ancestor` is a proper ancestor of `id`.
    pub(crate) fn is_ancestor(&self, ancestor: StateId, id: StateId) -> bool {
        let mut current = self.parent(id);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.parent(c);
        }
        false
    }

    /// `id` and its ancestors, nearest first, ending at the root.
    pub(crate) fn chain_to_root(&self, id: StateId) -> Vec<StateId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Lowest common ancestor of `source` and `target`, plus the path from
    /// `target` up to (excluding) the ancestor, target first.
    ///
    /// Depths are equalized by climbing the deeper side, recording
    /// target-side ancestors, then both climb in lock-step until they
    /// coincide. Terminates because all states share the root.
    pub(crate) fn find_path_to_lca(
        &self,
        source: StateId,
        target: StateId,
    ) -> (StateId, Vec<StateId>) {
        let mut s = source;
        let mut t = target;
        let mut path = Vec::new();
        let mut ds = self.depth(s);
        let mut dt = self.depth(t);
        while ds > dt {
            let Some(parent) = self.parent(s) else { break };
            s = parent;
            ds -= 1;
        }
        while dt > ds {
            path.push(t);
            let Some(parent) = self.parent(t) else { break };
            t = parent;
            dt -= 1;
        }
        while s != t {
            path.push(t);
            let (Some(ps), Some(pt)) = (self.parent(s), self.parent(t)) else {
                break;
            };
            s = ps;
            t = pt;
        }
        (s, path)
    }

    /// Lowest common ancestor of a set of states.
    ///
    /// Each cursor is depth-balanced to the shallowest member, then all
    /// climb in lock-step until they coincide. Errors on an empty set.
    pub(crate) fn find_lca(&self, states: &[StateId]) -> Result<StateId, MachineError> {
        if states.is_empty() {
            return Err(MachineError::EmptyStateSet);
        }
        let mut cursors: Vec<StateId> = states.to_vec();
        let min_depth = cursors
            .iter()
            .map(|id| self.depth(*id))
            .min()
            .unwrap_or(0);
        for cursor in cursors.iter_mut() {
            let mut depth = self.depth(*cursor);
            while depth > min_depth {
                let Some(parent) = self.parent(*cursor) else { break };
                *cursor = parent;
                depth -= 1;
            }
        }
        let mut lca = cursors[0];
        while cursors.iter().any(|c| *c != lca) {
            for cursor in cursors.iter_mut() {
                let Some(parent) = self.parent(*cursor) else {
                    return Ok(self.root());
                };
                *cursor = parent;
            }
            lca = cursors[0];
        }
        Ok(lca)
    }

    /// Active states with no active child, in depth-first child order.
    ///
    /// This order is what gives first-match-wins resolution its
    /// deterministic leaf-to-root precedence.
    pub(crate) fn active_leaves(&self) -> Vec<StateId> {
        let mut leaves = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if !node.active {
                continue;
            }
            let active_children: Vec<StateId> = node
                .children
                .iter()
                .copied()
                .filter(|c| self.node(*c).active)
                .collect();
            if active_children.is_empty() {
                leaves.push(id);
            } else {
                for child in active_children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        leaves
    }

    /// All active states, root first in depth-first order.
    pub(crate) fn active_states(&self) -> Vec<StateId> {
        let mut states = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if !node.active {
                continue;
            }
            states.push(id);
            for child in node.children.iter().rev() {
                stack.push(*child);
            }
        }
        states
    }

    /// Active descendants of `root` (excluding it), deepest first, so the
    /// result can be exited in order.
    pub(crate) fn active_subtree_post_order(&self, root: StateId) -> Vec<StateId> {
        let mut pre = Vec::new();
        let mut stack: Vec<StateId> = self
            .node(root)
            .children
            .iter()
            .copied()
            .filter(|c| self.node(*c).active)
            .collect();
        while let Some(id) = stack.pop() {
            pre.push(id);
            for child in &self.node(id).children {
                if self.node(*child).active {
                    stack.push(*child);
                }
            }
        }
        pre.reverse();
        pre
    }

    /// Active leaves strictly below `root`, in depth-first child order.
    pub(crate) fn active_leaves_under(&self, root: StateId) -> Vec<StateId> {
        self.active_leaves()
            .into_iter()
            .filter(|leaf| self.is_ancestor(root, *leaf))
            .collect()
    }

    /// Deactivate every node without notifications, rolling data-state
    /// values into their last slots. Used by `stop`.
    pub(crate) fn deactivate_all(&mut self) {
        for node in &mut self.nodes {
            node.active = false;
            node.finished = false;
            if let StateKind::Data(slot) = &mut node.kind {
                if slot.current.is_some() {
                    slot.last = slot.current.take();
                }
            }
        }
    }

    /// One-time cleanup when the owning machine is destroyed: clears
    /// flags, data slots, and history records.
    pub(crate) fn reset_all(&mut self) {
        for node in &mut self.nodes {
            node.active = false;
            node.finished = false;
            match &mut node.kind {
                StateKind::Data(slot) => {
                    slot.current = None;
                    slot.last = None;
                }
                StateKind::History(slot) => slot.recorded.clear(),
                _ => {}
            }
        }
    }

    /// Sibling-name uniqueness check used by the mutation surface.
    pub(crate) fn sibling_name_taken(&self, parent: StateId, name: &str) -> bool {
        self.node(parent)
            .children
            .iter()
            .any(|c| self.node(*c).name.as_deref() == Some(name))
    }

    /// Drop candidate ids whose state is a proper ancestor of another
    /// candidate's state (descendants shadow ancestors).
    pub(crate) fn drop_shadowed(&self, candidates: &[StateId]) -> Vec<usize> {
        let set: HashSet<StateId> = candidates.iter().copied().collect();
        candidates
            .iter()
            .enumerate()
            .filter(|(_, id)| {
                !set.iter().any(|other| *other != **id && self.is_ancestor(**id, *other))
            })
            .map(|(i, _)| i)
            .collect()
    }
}
