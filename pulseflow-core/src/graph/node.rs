//! Graph Nodes
//!
//! This module defines the identifiers and per-operator bookkeeping that live
//! in the operator graph.

use std::fmt;

use smallvec::SmallVec;

use crate::data::Value;
use crate::operator::{Operator, Params};
use crate::pulse::{Pulse, Stamp};

/// Identifier of an operator within one graph.
///
/// Ids index the graph's arena and are never reused, even after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(usize);

impl OpId {
    /// Get the raw arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for OpId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Topological position of an operator.
///
/// For every edge `a -> b`, `rank(a) < rank(b)`. Ranks are not dense.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(u32);

impl Rank {
    pub const ZERO: Rank = Rank(0);

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The rank immediately after this one.
    pub fn next(&self) -> Rank {
        Rank(self.0.saturating_add(1))
    }
}

impl From<u32> for Rank {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an operator has a deferred evaluation outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AsyncState {
    Idle,
    Pending,
    /// Triggered again while pending: evaluate once more after it settles.
    PendingRerun,
}

/// One operator in the graph.
pub struct Node {
    pub(crate) kind: String,

    /// The evaluate step. `None` for value-only operators.
    pub(crate) operator: Option<Box<dyn Operator>>,

    /// Whether the operator is a transform.
    pub(crate) pulse_aware: bool,

    pub(crate) rank: Rank,

    /// Validated registration parameters.
    pub(crate) params: Params,

    /// Operators this one depends on (incoming edges).
    pub(crate) sources: SmallVec<[OpId; 4]>,

    /// Operators that depend on this one (outgoing edges).
    pub(crate) targets: SmallVec<[OpId; 4]>,

    pub(crate) value: Value,

    /// Pulse produced (or passed through) in the last round the operator ran.
    pub(crate) pulse: Option<Pulse>,

    /// Last round the operator was scheduled in.
    pub(crate) stamp: Stamp,

    /// Sitting in the round queue or parked.
    pub(crate) queued: bool,

    pub(crate) modified_at: Stamp,

    pub(crate) async_state: AsyncState,

    /// Lifetime evaluation count.
    pub(crate) evaluations: u64,

    /// A value-only operator received a new value through `update`.
    pub(crate) pending_value: bool,
}

impl Node {
    pub(crate) fn new(
        kind: impl Into<String>,
        operator: Option<Box<dyn Operator>>,
        params: Params,
        value: Value,
    ) -> Self {
        let pulse_aware = operator
            .as_ref()
            .is_some_and(|op| op.definition().is_transform());
        Self {
            kind: kind.into(),
            pending_value: operator.is_none(),
            operator,
            pulse_aware,
            rank: Rank::ZERO,
            params,
            sources: SmallVec::new(),
            targets: SmallVec::new(),
            value,
            pulse: None,
            stamp: 0,
            queued: false,
            modified_at: 0,
            async_state: AsyncState::Idle,
            evaluations: 0,
        }
    }

    /// Operator kind name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_transform(&self) -> bool {
        self.pulse_aware
    }

    /// Value-only operators have no evaluate step.
    pub fn is_value(&self) -> bool {
        self.operator.is_none()
    }

    pub fn sources(&self) -> &[OpId] {
        &self.sources
    }

    pub fn targets(&self) -> &[OpId] {
        &self.targets
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("sources", &self.sources)
            .field("targets", &self.targets)
            .field("value", &self.value)
            .field("stamp", &self.stamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::func;

    #[test]
    fn ids_and_ranks_display() {
        assert_eq!(OpId::from(4).to_string(), "op#4");
        assert_eq!(OpId::from(4).index(), 4);
        assert_eq!(Rank::from(2).next(), Rank::from(3));
        assert!(Rank::ZERO < Rank::from(1));
        assert_eq!(Rank::from(7).to_string(), "7");
    }

    #[test]
    fn value_nodes_start_pending() {
        let node = Node::new("value", None, Params::new(), Value::from(1.0));
        assert!(node.is_value());
        assert!(node.pending_value);
        assert!(!node.is_transform());
    }

    #[test]
    fn transform_nodes_are_pulse_aware() {
        let op = func::transform("t", |_, p| Ok(crate::operator::Output::pulse(p.clone())));
        let node = Node::new("t", Some(Box::new(op)), Params::new(), Value::Null);
        assert!(node.is_transform());
        assert!(!node.pending_value);
    }
}
