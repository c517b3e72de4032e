//! Re-ranking
//!
//! When an edge `a -> b` is added with `rank(b) <= rank(a)`, every operator
//! reachable from `a` may need a higher rank. The walk uses an explicit stack
//! and a visiting marker per operator, so deep graphs cannot overflow the call
//! stack and a cycle surfaces as an ordinary error.
//!
//! New ranks are computed into a scratch map and committed only when the walk
//! finishes without finding a cycle.

use std::collections::HashMap;

use super::{OpId, OperatorGraph, Rank};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Operators reachable from `start` (inclusive), in topological order.
///
/// Fails with the first operator found on a back edge.
pub(crate) fn reachable_order(graph: &OperatorGraph, start: OpId) -> Result<Vec<OpId>, OpId> {
    let mut marks: HashMap<OpId, Mark> = HashMap::new();
    let mut post_order = Vec::new();
    let mut stack: Vec<(OpId, usize)> = vec![(start, 0)];
    marks.insert(start, Mark::Visiting);

    while let Some(&(node, child)) = stack.last() {
        let next = graph.targets(node).get(child).copied();
        match next {
            Some(target) => {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match marks.get(&target) {
                    Some(Mark::Visiting) => return Err(target),
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(target, Mark::Visiting);
                        stack.push((target, 0));
                    }
                }
            }
            None => {
                marks.insert(node, Mark::Done);
                post_order.push(node);
                stack.pop();
            }
        }
    }

    post_order.reverse();
    Ok(post_order)
}

/// Restore `rank(a) < rank(b)` for every edge reachable from `start`.
///
/// Ranks only ever increase.
pub(crate) fn rerank(graph: &mut OperatorGraph, start: OpId, edge_to: OpId) -> Result<(), ConfigError> {
    let order = reachable_order(graph, start).map_err(|through| ConfigError::Cycle {
        from: start,
        to: edge_to,
        through,
    })?;

    let mut ranks: HashMap<OpId, Rank> = HashMap::with_capacity(order.len());
    for &id in &order {
        let current = graph.rank(id).unwrap_or_default();
        let required = graph
            .sources(id)
            .iter()
            .filter_map(|source| ranks.get(source).copied().or_else(|| graph.rank(*source)))
            .map(|rank| rank.next())
            .max()
            .unwrap_or_default();
        ranks.insert(id, current.max(required));
    }

    for (id, rank) in ranks {
        if let Some(node) = graph.node_mut(id) {
            node.rank = rank;
        }
    }
    Ok(())
}

/// Every edge whose endpoints are out of rank order.
pub(crate) fn violations(graph: &OperatorGraph) -> Vec<(OpId, OpId)> {
    let mut out = Vec::new();
    for id in graph.ids() {
        let Some(rank) = graph.rank(id) else { continue };
        for &target in graph.targets(id) {
            if graph.rank(target).is_some_and(|t| t <= rank) {
                out.push((id, target));
            }
        }
    }
    out
}
