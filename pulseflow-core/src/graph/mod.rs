//! Operator Graph
//!
//! This module owns the operators of one dataflow and the edges between them.
//!
//! # Overview
//!
//! The graph is a directed acyclic graph where:
//!
//! - Nodes are operators, stored in an arena and addressed by [`OpId`]
//! - An edge `a -> b` means `b` reads `a`'s value or pulse
//!
//! Every operator carries a [`Rank`]. The scheduler evaluates dirty operators
//! lowest rank first, which is only correct while `rank(a) < rank(b)` holds
//! for every edge. Registration assigns ranks that satisfy this directly;
//! edges added later may require a re-ranking walk (see [`rank`]).
//!
//! # Design Decisions
//!
//! 1. Ids index a `Vec` and are never reused. A removed operator leaves an
//!    empty slot behind, so stale ids fail lookups instead of aliasing.
//!
//! 2. Both directions of every edge are stored, so the scheduler can walk
//!    targets and the ranker can inspect sources without a search.
//!
//! 3. Removing an operator detaches its edges but leaves dependents' ranks
//!    alone. Ranks are a partial order and need not be dense.

mod node;
pub(crate) mod rank;

pub use node::{Node, OpId, Rank};
pub(crate) use node::AsyncState;

use std::collections::{HashSet, VecDeque};

use crate::error::ConfigError;

/// Arena of operators and their edges.
#[derive(Debug, Default)]
pub struct OperatorGraph {
    nodes: Vec<Option<Node>>,
    live: usize,
}

impl OperatorGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operator, validating its parameters and wiring an edge from
    /// every operator it references.
    ///
    /// The new operator's rank is one more than the highest rank among its
    /// dependencies, or zero if it has none.
    pub(crate) fn insert(&mut self, mut node: Node) -> Result<OpId, ConfigError> {
        match &node.operator {
            Some(op) => {
                node.params
                    .validate(&node.kind, op.definition().params(), |id| self.contains(id))?;
            }
            None => {
                node.params.validate(&node.kind, &[], |id| self.contains(id))?;
            }
        }

        Ok(self.attach(node))
    }

    /// Add an operator whose parameters are already known to be valid.
    pub(crate) fn attach(&mut self, mut node: Node) -> OpId {
        let id = OpId::from(self.nodes.len());
        let dependencies = node.params.dependencies();
        node.rank = dependencies
            .iter()
            .filter_map(|dep| self.rank(*dep))
            .map(|rank| rank.next())
            .max()
            .unwrap_or_default();
        node.sources = dependencies.iter().copied().collect();

        for dep in &dependencies {
            if let Some(source) = self.node_mut(*dep) {
                source.targets.push(id);
            }
        }

        self.nodes.push(Some(node));
        self.live += 1;
        id
    }

    /// Add an edge after registration, re-ranking downstream operators if
    /// the edge would break rank order.
    ///
    /// Fails without changing the graph if the edge would close a cycle.
    pub fn connect(&mut self, source: OpId, target: OpId) -> Result<(), ConfigError> {
        for id in [source, target] {
            if !self.contains(id) {
                return Err(ConfigError::UnknownOperator(id));
            }
        }
        if source == target {
            return Err(ConfigError::Cycle {
                from: source,
                to: target,
                through: source,
            });
        }
        if self.targets(source).contains(&target) {
            return Ok(());
        }

        self.link(source, target);

        let out_of_order = match (self.rank(source), self.rank(target)) {
            (Some(s), Some(t)) => t <= s,
            _ => false,
        };
        if out_of_order {
            if let Err(err) = rank::rerank(self, source, target) {
                self.unlink(source, target);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Remove an edge. Returns whether it existed.
    pub fn disconnect(&mut self, source: OpId, target: OpId) -> bool {
        let existed = self.targets(source).contains(&target);
        self.unlink(source, target);
        existed
    }

    /// Detach and remove an operator.
    pub(crate) fn remove(&mut self, id: OpId) -> Option<Node> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.live -= 1;
        for source in &node.sources {
            if let Some(upstream) = self.node_mut(*source) {
                upstream.targets.retain(|t| *t != id);
            }
        }
        for target in &node.targets {
            if let Some(downstream) = self.node_mut(*target) {
                downstream.sources.retain(|s| *s != id);
            }
        }
        Some(node)
    }

    fn link(&mut self, source: OpId, target: OpId) {
        if let Some(node) = self.node_mut(source) {
            node.targets.push(target);
        }
        if let Some(node) = self.node_mut(target) {
            if !node.sources.contains(&source) {
                node.sources.push(source);
            }
        }
    }

    fn unlink(&mut self, source: OpId, target: OpId) {
        if let Some(node) = self.node_mut(source) {
            node.targets.retain(|t| *t != target);
        }
        if let Some(node) = self.node_mut(target) {
            node.sources.retain(|s| *s != source);
        }
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.node(id).is_some()
    }

    pub fn node(&self, id: OpId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub(crate) fn node_mut(&mut self, id: OpId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn rank(&self, id: OpId) -> Option<Rank> {
        self.node(id).map(Node::rank)
    }

    /// Outgoing edges. Empty for unknown ids.
    pub fn targets(&self, id: OpId) -> &[OpId] {
        self.node(id).map(Node::targets).unwrap_or_default()
    }

    /// Incoming edges. Empty for unknown ids.
    pub fn sources(&self, id: OpId) -> &[OpId] {
        self.node(id).map(Node::sources).unwrap_or_default()
    }

    /// Ids of all live operators, in registration order.
    pub fn ids(&self) -> impl Iterator<Item = OpId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| OpId::from(index))
    }

    /// Number of live operators.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Operators transitively downstream of `start`, excluding `start`.
    pub fn downstream(&self, start: OpId) -> HashSet<OpId> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<OpId> = self.targets(start).iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if id != start && visited.insert(id) {
                queue.extend(self.targets(id).iter().copied());
            }
        }
        visited
    }

    /// All live operators ordered by rank, ties broken by id.
    pub fn topological_order(&self) -> Vec<OpId> {
        let mut ids: Vec<OpId> = self.ids().collect();
        ids.sort_by_key(|id| (self.rank(*id).unwrap_or_default(), *id));
        ids
    }

    /// Edges that violate rank order. Empty whenever the graph is settled.
    pub fn rank_violations(&self) -> Vec<(OpId, OpId)> {
        rank::violations(self)
    }
}
