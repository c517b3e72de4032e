//! Round Scheduler
//!
//! One [`Round`] drives a single propagation pass to completion.
//!
//! # Algorithm
//!
//! Dirty operators wait in a min-heap keyed by `(rank, id)`:
//!
//! 1. Pop the lowest-ranked operator. If its rank changed since it was queued
//!    (an edge was added mid-round), push it again under the new rank.
//! 2. If it is downstream of an operator with a deferred evaluation
//!    outstanding, park it until that evaluation settles.
//! 3. If it is downstream of an operator that failed this round, skip it.
//! 4. Evaluate it with its resolved parameters and its input pulse.
//! 5. If its value changed or it emitted a non-empty pulse, enqueue every
//!    target that has not been scheduled in this round yet.
//!
//! An operator is scheduled at most once per round (its `stamp` records the
//! last round it was queued in). The exceptions are requests that arrive
//! while the round is open and targets of a deferred evaluation that settled:
//! those re-enter the queue even if the operator already ran.
//!
//! Deferred evaluations resolve in whatever order their futures complete.
//! Each completion commits independently and re-triggers its own subgraph.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use futures_util::future::{abortable, AbortHandle, Aborted, BoxFuture};
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use indexmap::IndexMap;
use tracing::{debug, error, trace, warn, Span};

use super::{ErrorSink, RoundReport};
use crate::config::DataflowConfig;
use crate::data::{Changeset, Tuple, Value};
use crate::error::{DataflowError, EvalError, EvalFailure};
use crate::graph::{AsyncState, OpId, OperatorGraph, Rank};
use crate::operator::{Evaluation, Output, Param, Parameters};
use crate::pulse::{Flags, Pulse, Stamp};

type Settled = (OpId, Result<Output, EvalError>);
type Outcome = (OpId, Result<Result<Output, EvalError>, Aborted>);

/// Settings a round reads from its owning dataflow.
pub(super) struct Hooks<'a> {
    pub(super) config: &'a DataflowConfig,
    pub(super) on_error: Option<&'a ErrorSink>,
}

/// State of one open propagation round.
pub(crate) struct Round {
    stamp: Stamp,
    span: Span,
    queue: BinaryHeap<Reverse<(Rank, OpId)>>,

    /// Empty pulse handed to operators without a pulse source.
    pulse: Pulse,

    /// Popped while shadowed by a pending evaluation.
    parked: Vec<OpId>,

    /// For each operator awaiting a deferred result, everything downstream of it.
    shadows: HashMap<OpId, HashSet<OpId>>,

    /// Input pulses held for deferred evaluations.
    inputs: HashMap<OpId, Pulse>,

    /// Downstream of a failure this round.
    poisoned: HashSet<OpId>,

    /// Scheduled again after already running this round. Their changes
    /// reach targets that already ran, too.
    reruns: HashSet<OpId>,

    /// Operators that stored a pulse this round.
    emitted: HashSet<OpId>,

    failures: Vec<EvalFailure>,
    evaluated: usize,
    pending: FuturesUnordered<BoxFuture<'static, Outcome>>,

    /// Cancels the outstanding evaluation of an operator removed mid-round.
    aborts: HashMap<OpId, AbortHandle>,
}

impl Round {
    pub(super) fn new(stamp: Stamp, span: Span) -> Self {
        Self {
            stamp,
            span,
            queue: BinaryHeap::new(),
            pulse: Pulse::new(stamp),
            parked: Vec::new(),
            shadows: HashMap::new(),
            inputs: HashMap::new(),
            poisoned: HashSet::new(),
            reruns: HashSet::new(),
            emitted: HashSet::new(),
            failures: Vec::new(),
            evaluated: 0,
            pending: FuturesUnordered::new(),
            aborts: HashMap::new(),
        }
    }

    pub(super) fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub(super) fn span(&self) -> &Span {
        &self.span
    }

    /// Operators queued or parked.
    pub(super) fn has_work(&self) -> bool {
        !self.queue.is_empty()
    }

    /// No deferred evaluation is outstanding.
    ///
    /// Evaluations of removed operators do not count, even before their
    /// aborted futures have been drained.
    pub(super) fn is_settled(&self) -> bool {
        self.shadows.is_empty()
    }

    /// Operators whose deferred evaluation is outstanding, in id order.
    pub(super) fn pending_ops(&self) -> Vec<OpId> {
        let mut ops: Vec<OpId> = self.shadows.keys().copied().collect();
        ops.sort_unstable();
        ops
    }

    /// A deferred result that is ready now, without waiting.
    pub(super) fn poll_settled(&mut self) -> Option<Settled> {
        while let Some(Some((id, outcome))) = self.pending.next().now_or_never() {
            if let Ok(result) = outcome {
                return Some((id, result));
            }
            debug!(op = %id, "discarded aborted evaluation");
        }
        None
    }

    /// Wait for the next deferred result.
    pub(super) async fn next_settled(&mut self) -> Option<Settled> {
        while let Some((id, outcome)) = self.pending.next().await {
            if let Ok(result) = outcome {
                return Some((id, result));
            }
            debug!(op = %id, "discarded aborted evaluation");
        }
        None
    }

    /// Schedule `id` for this round.
    ///
    /// Without `force`, an operator already scheduled in this round is left
    /// alone. With `force`, it is queued again unless it is still waiting.
    pub(super) fn enqueue(&mut self, graph: &mut OperatorGraph, id: OpId, force: bool) {
        let Some(node) = graph.node_mut(id) else {
            return;
        };
        if node.queued {
            return;
        }
        if node.stamp >= self.stamp {
            if !force {
                return;
            }
            self.reruns.insert(id);
        }
        node.stamp = self.stamp;
        node.queued = true;
        self.queue.push(Reverse((node.rank, id)));
    }

    /// Drop bookkeeping for a removed operator so nothing waits on it.
    ///
    /// An outstanding deferred evaluation is aborted; its result never
    /// reaches `settle`.
    pub(super) fn forget(&mut self, graph: &OperatorGraph, id: OpId) {
        if let Some(handle) = self.aborts.remove(&id) {
            handle.abort();
        }
        self.reruns.remove(&id);
        if self.shadows.remove(&id).is_some() {
            self.inputs.remove(&id);
            self.unpark(graph);
        }
    }

    /// Evaluate the next ready operator.
    ///
    /// Returns `false` once nothing is ready, either because the round is
    /// done or because everything left waits on deferred results.
    pub(super) fn step(
        &mut self,
        graph: &mut OperatorGraph,
        changesets: &mut IndexMap<OpId, Changeset>,
        hooks: &Hooks<'_>,
    ) -> Result<bool, DataflowError> {
        let span = self.span.clone();
        let _enter = span.enter();

        while let Some(Reverse((rank, id))) = self.queue.pop() {
            let Some(node) = graph.node_mut(id) else {
                continue;
            };
            if node.rank != rank {
                self.queue.push(Reverse((node.rank, id)));
                continue;
            }
            if self.is_shadowed(id) {
                debug!(op = %id, "parked behind a pending evaluation");
                self.parked.push(id);
                continue;
            }

            node.queued = false;
            if self.poisoned.contains(&id) {
                debug!(op = %id, "skipped downstream of a failed operator");
                continue;
            }
            if node.async_state != AsyncState::Idle {
                node.async_state = AsyncState::PendingRerun;
                debug!(op = %id, "coalesced into pending evaluation");
                continue;
            }

            let limit = hooks.config.max_evaluations_per_round;
            if self.evaluated >= limit {
                warn!(limit, "evaluation limit reached, closing round");
                return Err(DataflowError::EvaluationLimit {
                    stamp: self.stamp,
                    limit,
                });
            }

            self.evaluate(graph, changesets, hooks, id);
            return Ok(true);
        }
        Ok(false)
    }

    fn evaluate(
        &mut self,
        graph: &mut OperatorGraph,
        changesets: &mut IndexMap<OpId, Changeset>,
        hooks: &Hooks<'_>,
        id: OpId,
    ) {
        let input = self.input_pulse(graph, changesets, id);
        let params = marshal(graph, id, self.stamp);
        let force = self.reruns.remove(&id);

        let Some(node) = graph.node_mut(id) else {
            return;
        };
        node.evaluations += 1;
        self.evaluated += 1;
        if hooks.config.trace_evaluations {
            trace!(op = %id, rank = %node.rank, kind = %node.kind, "evaluate");
        }

        let evaluation = match node.operator.as_mut() {
            Some(op) => op.evaluate(&params, &input),
            None => {
                let changed = std::mem::take(&mut node.pending_value);
                let mut out = input;
                out.set_stamp(self.stamp);
                node.pulse = Some(out);
                self.emitted.insert(id);
                self.propagate(graph, id, changed, force);
                return;
            }
        };

        match evaluation {
            Evaluation::Ready(Ok(output)) => self.commit(graph, id, input, output, force),
            Evaluation::Ready(Err(error)) => self.fail(graph, hooks, id, error),
            Evaluation::Deferred(future) => {
                node.async_state = AsyncState::Pending;
                debug!(op = %id, "evaluation deferred");
                let shadow = graph.downstream(id);
                self.shadows.insert(id, shadow);
                self.inputs.insert(id, input);
                let (future, handle) = abortable(future);
                self.aborts.insert(id, handle);
                self.pending
                    .push(async move { (id, future.await) }.boxed());
            }
        }
    }

    /// Finalize a deferred evaluation.
    pub(super) fn settle(
        &mut self,
        graph: &mut OperatorGraph,
        hooks: &Hooks<'_>,
        id: OpId,
        result: Result<Output, EvalError>,
    ) {
        let span = self.span.clone();
        let _enter = span.enter();

        self.shadows.remove(&id);
        self.aborts.remove(&id);
        let input = self.inputs.remove(&id).unwrap_or_else(|| self.pulse.clone());

        let rerun = match graph.node_mut(id) {
            Some(node) => {
                let rerun = node.async_state == AsyncState::PendingRerun;
                node.async_state = AsyncState::Idle;
                rerun
            }
            None => {
                debug!(op = %id, "dropped result of removed operator");
                self.unpark(graph);
                return;
            }
        };
        debug!(op = %id, ok = result.is_ok(), "deferred evaluation settled");

        match result {
            Ok(output) => self.commit(graph, id, input, output, true),
            Err(error) => self.fail(graph, hooks, id, error),
        }
        if rerun {
            self.enqueue(graph, id, true);
        }
        self.unpark(graph);
    }

    /// Close the round, clearing per-round flags on operators left behind.
    ///
    /// Pulses stored this round are cut down to their resulting tuple set so
    /// removed tuples are not held past the round.
    pub(super) fn close(mut self, graph: &mut OperatorGraph) -> (RoundReport, Vec<EvalFailure>) {
        let leftover = self
            .queue
            .drain()
            .map(|Reverse((_, id))| id)
            .chain(self.parked.drain(..))
            .collect::<Vec<_>>();
        for id in leftover {
            if let Some(node) = graph.node_mut(id) {
                node.queued = false;
            }
        }
        for id in self.shadows.keys() {
            if let Some(node) = graph.node_mut(*id) {
                node.async_state = AsyncState::Idle;
            }
        }
        for id in self.emitted.drain() {
            if let Some(node) = graph.node_mut(id) {
                node.pulse = node.pulse.take().map(|pulse| pulse.source_only());
            }
        }

        let report = RoundReport {
            stamp: self.stamp,
            evaluated: self.evaluated,
        };
        self.span.in_scope(|| {
            debug!(
                evaluated = self.evaluated,
                failed = self.failures.len(),
                "round finished"
            );
        });
        (report, self.failures)
    }

    fn is_shadowed(&self, id: OpId) -> bool {
        self.shadows
            .iter()
            .any(|(owner, shadow)| *owner != id && shadow.contains(&id))
    }

    fn unpark(&mut self, graph: &OperatorGraph) {
        for id in self.parked.drain(..) {
            if let Some(rank) = graph.rank(id) {
                self.queue.push(Reverse((rank, id)));
            }
        }
    }

    /// The pulse an operator sees this round.
    ///
    /// A pending changeset wins. Otherwise an operator with a pulse source
    /// gets that source's pulse if it ran this round, or an empty pulse that
    /// still carries the source's tuple set. Everything else gets the round's
    /// empty pulse.
    fn input_pulse(
        &self,
        graph: &OperatorGraph,
        changesets: &mut IndexMap<OpId, Changeset>,
        id: OpId,
    ) -> Pulse {
        if let Some(changeset) = changesets.shift_remove(&id) {
            let current = graph
                .node(id)
                .and_then(|node| node.value().as_tuples())
                .map(<[Tuple]>::to_vec)
                .unwrap_or_default();
            return changeset.apply(Pulse::new(self.stamp), &current);
        }

        let source = graph
            .node(id)
            .and_then(|node| node.params().pulse_source())
            .and_then(|source| graph.node(source))
            .and_then(|node| node.pulse.as_ref());
        match source {
            Some(pulse) if pulse.stamp() == self.stamp => pulse.clone(),
            Some(pulse) => {
                let mut carried = pulse.fork(Flags::NO_FIELDS);
                carried.set_stamp(self.stamp);
                carried.set_clean(false);
                carried
            }
            None => self.pulse.clone(),
        }
    }

    fn commit(
        &mut self,
        graph: &mut OperatorGraph,
        id: OpId,
        input: Pulse,
        output: Output,
        force: bool,
    ) {
        let (value, pulse, stop) = output.into_parts();
        let Some(node) = graph.node_mut(id) else {
            return;
        };

        let mut changed = false;
        if let Some(value) = value {
            if value != node.value {
                node.value = value;
                changed = true;
            }
        }

        let emitted = if stop {
            None
        } else {
            pulse.or_else(|| node.pulse_aware.then(|| input.clone()))
        };
        changed |= emitted.as_ref().is_some_and(|p| !p.is_noop());

        let mut out = match emitted {
            Some(pulse) => pulse,
            None if stop => input.fork(Flags::NONE),
            None => input,
        };
        out.set_stamp(self.stamp);
        node.pulse = Some(out);
        self.emitted.insert(id);

        if stop {
            if changed {
                node.modified_at = self.stamp;
            }
            return;
        }
        self.propagate(graph, id, changed, force);
    }

    fn propagate(&mut self, graph: &mut OperatorGraph, id: OpId, changed: bool, force: bool) {
        if !changed {
            return;
        }
        let targets = match graph.node_mut(id) {
            Some(node) => {
                node.modified_at = self.stamp;
                node.targets.clone()
            }
            None => return,
        };
        for target in targets {
            self.enqueue(graph, target, force);
        }
    }

    fn fail(&mut self, graph: &OperatorGraph, hooks: &Hooks<'_>, id: OpId, error: EvalError) {
        let Some(node) = graph.node(id) else {
            return;
        };
        let failure = EvalFailure {
            op: id,
            kind: node.kind().to_string(),
            rank: node.rank(),
            stamp: self.stamp,
            error,
        };
        error!(
            op = %id,
            kind = %failure.kind,
            rank = %failure.rank,
            error = %failure.error,
            "operator evaluation failed"
        );
        if let Some(sink) = hooks.on_error {
            sink(&failure);
        }
        self.poisoned.extend(graph.downstream(id));
        self.failures.push(failure);
    }
}

/// Resolve an operator's parameters for this round.
fn marshal(graph: &OperatorGraph, id: OpId, stamp: Stamp) -> Parameters {
    let mut params = Parameters::new();
    let Some(node) = graph.node(id) else {
        return params;
    };
    let first = node.evaluations == 0;
    for (name, param) in node.params().entries() {
        let (value, modified) = resolve(graph, param, stamp, first);
        params.insert(name, value, modified);
    }
    params
}

fn resolve(graph: &OperatorGraph, param: &Param, stamp: Stamp, first: bool) -> (Value, bool) {
    match param {
        Param::Literal(value) => (value.clone(), first),
        Param::Ref(op) => match graph.node(*op) {
            Some(node) => (node.value().clone(), node.modified_at == stamp),
            None => {
                warn!(op = %op, "parameter refers to a removed operator");
                (Value::Null, false)
            }
        },
        Param::Array(items) => {
            let mut modified = false;
            let values = items
                .iter()
                .map(|item| {
                    let (value, item_modified) = resolve(graph, item, stamp, first);
                    modified |= item_modified;
                    value
                })
                .collect();
            (Value::List(values), modified)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;
    use crate::operator::{func, Params};
    use serde_json::json;

    fn hooks(config: &DataflowConfig) -> Hooks<'_> {
        Hooks {
            config,
            on_error: None,
        }
    }

    #[test]
    fn enqueue_once_per_round_unless_forced() {
        let mut graph = OperatorGraph::new();
        let a = graph.attach(Node::new("value", None, Params::new(), Value::Null));
        let mut round = Round::new(1, Span::none());

        round.enqueue(&mut graph, a, false);
        round.enqueue(&mut graph, a, false);
        assert_eq!(round.queue.len(), 1);

        round.queue.clear();
        if let Some(node) = graph.node_mut(a) {
            node.queued = false;
        }
        round.enqueue(&mut graph, a, false);
        assert!(round.queue.is_empty());
        round.enqueue(&mut graph, a, true);
        assert_eq!(round.queue.len(), 1);
    }

    #[test]
    fn lowest_rank_runs_first() {
        let mut graph = OperatorGraph::new();
        let source = graph.attach(Node::new("value", None, Params::new(), Value::from(1.0)));
        let op = func::value("double", |p| Ok(Value::from(p.number("x")? * 2.0)));
        let double = graph
            .insert(Node::new(
                "double",
                Some(Box::new(op)),
                Params::new().reference("x", source),
                Value::Null,
            ))
            .unwrap();

        let config = DataflowConfig::default();
        let mut changesets = IndexMap::new();
        let mut round = Round::new(1, Span::none());
        round.enqueue(&mut graph, double, false);
        round.enqueue(&mut graph, source, false);

        while round.step(&mut graph, &mut changesets, &hooks(&config)).unwrap() {}
        assert_eq!(round.evaluated, 2);
        assert_eq!(graph.node(double).map(Node::value), Some(&Value::Number(2.0)));
    }

    #[test]
    fn stale_rank_is_requeued() {
        let mut graph = OperatorGraph::new();
        let a = graph.attach(Node::new("value", None, Params::new(), Value::Null));
        let b = graph.attach(Node::new("value", None, Params::new(), Value::Null));
        let mut round = Round::new(1, Span::none());
        round.enqueue(&mut graph, b, false);
        graph.connect(a, b).unwrap();

        let config = DataflowConfig::default();
        let mut changesets = IndexMap::new();
        assert!(round.step(&mut graph, &mut changesets, &hooks(&config)).unwrap());
        assert_eq!(graph.node(b).map(|n| n.evaluations), Some(1));
    }

    #[test]
    fn failure_poisons_downstream() {
        let mut graph = OperatorGraph::new();
        let source = graph.attach(Node::new("value", None, Params::new(), Value::from(1.0)));
        let broken = func::value("broken", |_| Err(EvalError::failed("boom")));
        let broken = graph
            .insert(Node::new(
                "broken",
                Some(Box::new(broken)),
                Params::new().reference("x", source),
                Value::Null,
            ))
            .unwrap();
        let after = graph.attach(Node::new(
            "value",
            None,
            Params::new().reference("x", broken),
            Value::Null,
        ));

        let config = DataflowConfig::default();
        let mut changesets = IndexMap::new();
        let mut round = Round::new(1, Span::none());
        round.enqueue(&mut graph, source, false);
        round.enqueue(&mut graph, after, false);
        while round.step(&mut graph, &mut changesets, &hooks(&config)).unwrap() {}

        let (report, failures) = round.close(&mut graph);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].op, broken);
        assert_eq!(report.evaluated, 2);
        assert_eq!(graph.node(after).map(|n| n.evaluations), Some(0));
    }

    #[test]
    fn forgotten_evaluation_is_aborted() {
        let mut graph = OperatorGraph::new();
        let stuck = func::deferred("stuck", |_, _| futures_util::future::pending());
        let stuck = graph
            .insert(Node::new("stuck", Some(Box::new(stuck)), Params::new(), Value::Null))
            .unwrap();

        let config = DataflowConfig::default();
        let mut changesets = IndexMap::new();
        let mut round = Round::new(1, Span::none());
        round.enqueue(&mut graph, stuck, false);
        while round.step(&mut graph, &mut changesets, &hooks(&config)).unwrap() {}
        assert!(!round.is_settled());
        assert_eq!(round.pending_ops(), vec![stuck]);

        graph.remove(stuck);
        round.forget(&graph, stuck);
        assert!(round.is_settled());
        assert!(round.pending_ops().is_empty());
        assert!(round.poll_settled().is_none());
        assert!(round.pending.is_empty());
    }

    #[test]
    fn close_keeps_only_the_resulting_tuple_set() {
        let mut graph = OperatorGraph::new();
        let relay = func::transform("relay", |_, pulse| Ok(Output::pulse(pulse.clone())));
        let relay = graph
            .insert(Node::new("relay", Some(Box::new(relay)), Params::new(), Value::Null))
            .unwrap();

        let config = DataflowConfig::default();
        let mut changesets = IndexMap::new();
        changesets.insert(relay, Changeset::new().insert([json!({"a": 1}), json!({"a": 2})]));
        let mut round = Round::new(1, Span::none());
        round.enqueue(&mut graph, relay, false);
        while round.step(&mut graph, &mut changesets, &hooks(&config)).unwrap() {}
        let stored = graph.node(relay).and_then(|n| n.pulse.as_ref());
        assert_eq!(stored.map(|p| p.add().len()), Some(2));

        round.close(&mut graph);
        let kept = graph.node(relay).and_then(|n| n.pulse.as_ref()).unwrap();
        assert!(kept.is_noop());
        assert_eq!(kept.source().map(<[Tuple]>::len), Some(2));
    }
}
